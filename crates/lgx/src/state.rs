//! 🗄️ The versioned pipeline-state record: bootstrap flags and the learned batch size.
//!
//! Two invocations may race on the same record, so nothing here ever writes
//! blind. Every write is a compare-and-swap against the version that was read:
//!
//! ```text
//!   load() ──► v7 ──► modify ──► cas(expected = v7) ──► Written(v8)
//!                                        │
//!                                        └──► Conflict(current) ──► merge, try again
//! ```
//!
//! Merging is monotonic. Flags only go false → true, and the batch size only
//! goes down. Two writers can't undo each other's progress, whoever lands first.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

const CAS_ATTEMPTS: usize = 16;
const LOCK_ATTEMPTS: usize = 100;
const LOCK_WAIT: Duration = Duration::from_millis(20);

/// ⚙️ `[state]` section. No path means state lives only as long as the process.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// 🚩 The five one-shot setup flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapState {
    pub role_mapped: bool,
    pub ism_created: bool,
    pub template_created: bool,
    pub dashboard_imported: bool,
    pub alias_created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapFlag {
    RoleMapped,
    IsmCreated,
    TemplateCreated,
    DashboardImported,
    AliasCreated,
}

impl fmt::Display for BootstrapFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootstrapFlag::RoleMapped => "role_mapped",
            BootstrapFlag::IsmCreated => "ism_created",
            BootstrapFlag::TemplateCreated => "template_created",
            BootstrapFlag::DashboardImported => "dashboard_imported",
            BootstrapFlag::AliasCreated => "alias_created",
        };
        f.write_str(name)
    }
}

impl BootstrapState {
    pub fn get(&self, flag: BootstrapFlag) -> bool {
        match flag {
            BootstrapFlag::RoleMapped => self.role_mapped,
            BootstrapFlag::IsmCreated => self.ism_created,
            BootstrapFlag::TemplateCreated => self.template_created,
            BootstrapFlag::DashboardImported => self.dashboard_imported,
            BootstrapFlag::AliasCreated => self.alias_created,
        }
    }

    fn raise(&mut self, flag: BootstrapFlag) {
        match flag {
            BootstrapFlag::RoleMapped => self.role_mapped = true,
            BootstrapFlag::IsmCreated => self.ism_created = true,
            BootstrapFlag::TemplateCreated => self.template_created = true,
            BootstrapFlag::DashboardImported => self.dashboard_imported = true,
            BootstrapFlag::AliasCreated => self.alias_created = true,
        }
    }
}

/// 🗄️ The whole record. `version` bumps by one on every successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub version: u64,
    pub batch_size: usize,
    #[serde(default)]
    pub bootstrap: BootstrapState,
}

impl PipelineState {
    pub fn initial(batch_size: usize) -> Self {
        Self {
            version: 0,
            batch_size,
            bootstrap: BootstrapState::default(),
        }
    }
}

/// 🔀 What a compare-and-swap did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// the new record, with its bumped version
    Written(PipelineState),
    /// somebody got there first; this is what they left
    Conflict(PipelineState),
}

/// 🗄️ Somewhere to keep a `PipelineState`.
#[async_trait]
pub trait StateStore: fmt::Debug + Send + Sync {
    async fn load(&self) -> Result<PipelineState>;

    /// ✍️ Write `next` only if the stored version is still `expected_version`.
    /// The stored version becomes `expected_version + 1` regardless of `next.version`.
    async fn compare_and_swap(&self, expected_version: u64, next: PipelineState) -> Result<CasOutcome>;
}

/// 🧠 Process-local store, for tests and for runs without a `[state] path`.
#[derive(Debug)]
pub struct InMemoryStateStore {
    state: Mutex<PipelineState>,
}

impl InMemoryStateStore {
    pub fn new(initial_batch_size: usize) -> Self {
        Self {
            state: Mutex::new(PipelineState::initial(initial_batch_size)),
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self) -> Result<PipelineState> {
        let guard = self.state.lock().map_err(|_| anyhow!("💀 in-memory state lock poisoned"))?;
        Ok(guard.clone())
    }

    async fn compare_and_swap(&self, expected_version: u64, next: PipelineState) -> Result<CasOutcome> {
        let mut guard = self.state.lock().map_err(|_| anyhow!("💀 in-memory state lock poisoned"))?;
        if guard.version != expected_version {
            return Ok(CasOutcome::Conflict(guard.clone()));
        }
        *guard = PipelineState {
            version: expected_version + 1,
            ..next
        };
        Ok(CasOutcome::Written(guard.clone()))
    }
}

/// 📁 JSON file store. Writers take a sibling `.lock` file (created exclusively),
/// write a temp file, and rename it over the record.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    initial_batch_size: usize,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>, initial_batch_size: usize) -> Self {
        Self {
            path: path.into(),
            initial_batch_size,
        }
    }

    fn lock_path(&self) -> PathBuf {
        sibling(&self.path, "lock")
    }

    async fn read(&self) -> Result<PipelineState> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).with_context(|| {
                format!(
                    "💀 The pipeline state file at '{}' is not valid JSON. Somebody hand-edited it, didn't they.",
                    self.path.display()
                )
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(PipelineState::initial(self.initial_batch_size)),
            Err(err) => Err(err).with_context(|| format!("💀 Failed to read pipeline state '{}'", self.path.display())),
        }
    }

    async fn acquire_lock(&self) -> Result<LockGuard> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("💀 Failed to create state directory '{}'", parent.display()))?;
        }
        for _ in 0..LOCK_ATTEMPTS {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(_) => return Ok(LockGuard { path: lock_path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => tokio::time::sleep(LOCK_WAIT).await,
                Err(err) => {
                    return Err(err).with_context(|| format!("💀 Failed to create lock file '{}'", lock_path.display()));
                }
            }
        }
        bail!(
            "💀 Gave up waiting for the state lock '{}'. If no other lgx is running, delete it.",
            lock_path.display()
        )
    }
}

/// 🔓 Removes the lock file when dropped.
#[derive(Debug)]
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{extension}"));
    path.with_file_name(name)
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<PipelineState> {
        self.read().await
    }

    async fn compare_and_swap(&self, expected_version: u64, next: PipelineState) -> Result<CasOutcome> {
        let _lock = self.acquire_lock().await?;
        let current = self.read().await?;
        if current.version != expected_version {
            return Ok(CasOutcome::Conflict(current));
        }
        let written = PipelineState {
            version: expected_version + 1,
            ..next
        };
        let bytes = serde_json::to_vec_pretty(&written).context("💀 Failed to serialize pipeline state")?;
        let temp = sibling(&self.path, &format!("{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&temp, bytes)
            .await
            .with_context(|| format!("💀 Failed to write '{}'", temp.display()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .with_context(|| format!("💀 Failed to move new state into '{}'", self.path.display()))?;
        debug!(version = written.version, "🗄️ pipeline state written to {}", self.path.display());
        Ok(CasOutcome::Written(written))
    }
}

/// 🏭 A file store if a path is configured, otherwise in-memory.
pub fn store_from_config(config: &StateConfig, initial_batch_size: usize) -> Arc<dyn StateStore> {
    match &config.path {
        Some(path) => Arc::new(FileStateStore::new(path.clone(), initial_batch_size)),
        None => Arc::new(InMemoryStateStore::new(initial_batch_size)),
    }
}

/// 🔁 Read-modify-CAS until it sticks. `modify` returns `None` when there is nothing to write.
async fn update<F>(store: &dyn StateStore, what: &str, mut modify: F) -> Result<PipelineState>
where
    F: FnMut(&PipelineState) -> Option<PipelineState>,
{
    let mut current = store.load().await?;
    for _ in 0..CAS_ATTEMPTS {
        let Some(next) = modify(&current) else {
            return Ok(current);
        };
        match store.compare_and_swap(current.version, next).await? {
            CasOutcome::Written(state) => return Ok(state),
            CasOutcome::Conflict(theirs) => {
                debug!(version = theirs.version, "🔀 state conflict while recording {what}, merging");
                current = theirs;
            }
        }
    }
    bail!("💀 Could not record {what}: the pipeline state kept changing underneath us ({CAS_ATTEMPTS} conflicts)")
}

/// 🚩 Raise one bootstrap flag. Already raised is fine and writes nothing.
pub async fn mark_flag(store: &dyn StateStore, flag: BootstrapFlag) -> Result<PipelineState> {
    let state = update(store, &flag.to_string(), |current| {
        (!current.bootstrap.get(flag)).then(|| {
            let mut next = current.clone();
            next.bootstrap.raise(flag);
            next
        })
    })
    .await?;
    info!("🚩 bootstrap step {flag} recorded (state v{})", state.version);
    Ok(state)
}

/// 📉 Persist a learned batch size. Only ever lowers the stored value.
pub async fn record_batch_size(store: &dyn StateStore, batch_size: usize) -> Result<PipelineState> {
    update(store, "batch size", |current| {
        (batch_size < current.batch_size).then(|| PipelineState {
            batch_size,
            ..current.clone()
        })
    })
    .await
}
