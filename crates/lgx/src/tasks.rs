//! 📨 Migration task messages and the size-bounded scanner that produces them.
//!
//! A scan turns a pile of `{source, destination}` object descriptors into queue
//! messages, each carrying roughly a threshold's worth of bytes. In merge mode
//! objects are grouped by the destination directory, so one task never writes
//! into two directories. Destinations that weren't given explicitly are derived
//! from the source key through the partition rewriter.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::batcher::{RecordBatcher, Threshold};
use crate::common::{Batch, DEFAULT_GROUP_KEY};
use crate::partition::{self, PolicyMap};

/// 🪣 Bucket + key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

/// 📄 One object to move, as listed by whoever did the listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ObjectDescriptor {
    pub source: ObjectRef,
    #[serde(default)]
    pub destination: Option<ObjectRef>,
    /// 📏 bytes
    #[serde(default)]
    pub size: u64,
}

/// 📨 The wire shape of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub execution_name: String,
    pub task_id: Uuid,
    pub parent_task_id: String,
    pub source_type: String,
    pub delete_on_success: bool,
    pub merge: bool,
    pub data: Vec<TaskData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskData {
    pub source: ObjectRef,
    pub destination: ObjectRef,
}

/// ⚙️ `[tasks]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_execution_name")]
    pub execution_name: String,
    #[serde(default)]
    pub parent_task_id: String,
    #[serde(default = "default_source_type")]
    pub source_type: String,
    #[serde(default)]
    pub delete_on_success: bool,
    /// 🪣 where derived destinations go; the source bucket when unset
    #[serde(default)]
    pub destination_bucket: Option<String>,
    #[serde(default)]
    pub destination_prefix: String,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            execution_name: default_execution_name(),
            parent_task_id: String::new(),
            source_type: default_source_type(),
            delete_on_success: false,
            destination_bucket: None,
            destination_prefix: String::new(),
        }
    }
}

fn default_execution_name() -> String {
    "lgx".to_string()
}

fn default_source_type() -> String {
    "s3".to_string()
}

/// 🔭 Groups descriptors into task messages.
#[derive(Debug, Clone)]
pub struct TaskScanner {
    config: TaskConfig,
    threshold: Threshold,
    merge: bool,
    policies: PolicyMap,
}

impl TaskScanner {
    pub fn new(config: TaskConfig, threshold: Threshold, merge: bool, policies: PolicyMap) -> Self {
        Self {
            config,
            threshold,
            merge,
            policies,
        }
    }

    /// 🧭 Where `source` ends up when nobody said otherwise.
    pub fn destination_for(&self, source: &ObjectRef) -> ObjectRef {
        let bucket = self
            .config
            .destination_bucket
            .clone()
            .unwrap_or_else(|| source.bucket.clone());
        let rewritten = partition::rewrite(&source.key, &self.policies);
        let prefix = self.config.destination_prefix.trim_end_matches('/');
        let key = if prefix.is_empty() {
            rewritten
        } else {
            format!("{prefix}/{}", rewritten.trim_start_matches('/'))
        };
        ObjectRef { bucket, key }
    }

    /// 🔭 Turn descriptors into task messages.
    pub fn scan<I>(&self, descriptors: I) -> Vec<TaskMessage>
    where
        I: IntoIterator<Item = ObjectDescriptor>,
    {
        let mut batcher = RecordBatcher::new(self.threshold);
        let mut messages = Vec::new();
        for descriptor in descriptors {
            let destination = descriptor
                .destination
                .clone()
                .unwrap_or_else(|| self.destination_for(&descriptor.source));
            let key = if self.merge {
                destination
                    .key
                    .rsplit_once('/')
                    .map(|(dir, _)| dir.to_string())
                    .unwrap_or_else(|| DEFAULT_GROUP_KEY.to_string())
            } else {
                DEFAULT_GROUP_KEY.to_string()
            };
            let item = TaskData {
                source: descriptor.source,
                destination,
            };
            if let Some(batch) = batcher.push(Some(&key), item, descriptor.size as usize) {
                messages.push(self.message(batch));
            }
        }
        messages.extend(batcher.finish().into_iter().map(|batch| self.message(batch)));
        debug!("🔭 scan produced {} task messages", messages.len());
        messages
    }

    fn message(&self, batch: Batch<TaskData>) -> TaskMessage {
        TaskMessage {
            execution_name: self.config.execution_name.clone(),
            task_id: Uuid::new_v4(),
            parent_task_id: self.config.parent_task_id.clone(),
            source_type: self.config.source_type.clone(),
            delete_on_success: self.config.delete_on_success,
            merge: self.merge,
            data: batch.items,
        }
    }
}
