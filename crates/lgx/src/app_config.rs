//! 🔧 App Configuration: TOML and environment in, one `AppConfig` out.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every operator at 3am) 🦆
//!
//! 🏗️ Figment does the layering: `LGX_*` environment variables first, then an
//! optional TOML file on top. Nested keys in the environment use a double
//! underscore, so `LGX_ENGINE__URL` lands in `[engine] url`.
//!
//! Each section's struct lives next to the code that consumes it; this module
//! only stitches them together.

use std::path::{Path, PathBuf};

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::batcher::BatchingConfig;
use crate::bootstrap::{BootstrapConfig, TemplateConfig};
use crate::engine::EngineConfig;
use crate::failures::FailureConfig;
use crate::lifecycle::LifecycleConfig;
use crate::parsers::{EnvelopeMode, LogFormat, ParserOptions};
use crate::partition::PolicyMap;
use crate::retry::RetryConfig;
use crate::state::StateConfig;
use crate::supervisors::RuntimeConfig;
use crate::tasks::TaskConfig;

/// 📦 One struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    /// 🪵 what we're parsing and where it goes. the only section without a default.
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub template: TemplateConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default, alias = "supervisor_config")]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub failures: FailureConfig,
    /// 🗂️ Hive-style segment policies for the prefix rewriter.
    #[serde(default)]
    pub partitions: PolicyMap,
    #[serde(default)]
    pub tasks: TaskConfig,
}

/// 🪵 The pipeline itself: which format, which index, which extras.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// 🏷️ format tag from the closed registry (`elb`, `cloudfront`, `rds_mysql`, ...)
    pub log_type: LogFormat,
    /// 📛 write alias and index name prefix
    pub index_prefix: String,
    /// 📅 date format baked into the first concrete index name, Java-style like the engine wants
    #[serde(default = "default_index_suffix")]
    pub index_suffix: String,
    /// 🚚 where the data came from, used in the failure export path
    #[serde(default = "default_source_kind")]
    pub source_kind: String,
    /// 📂 input files for `lgx run`, plain or `.gz`
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    #[serde(default)]
    pub parser: ParserOptions,
    #[serde(default)]
    pub envelope: EnvelopeMode,
    /// 🔌 enrichment capabilities, resolved by name at startup
    #[serde(default)]
    pub enrichments: Vec<String>,
    /// 🪪 stamp each document with a deterministic `_id`
    #[serde(default = "default_document_ids")]
    pub document_ids: bool,
    /// 🏗️ run the bootstrap sequence before indexing
    #[serde(default)]
    pub bootstrap_on_run: bool,
}

impl PipelineConfig {
    /// 📛 The alias every bulk request writes through. Engines want lowercase.
    pub fn index_name(&self) -> String {
        self.index_prefix.to_lowercase()
    }
}

fn default_index_suffix() -> String {
    "yyyy-MM-dd".to_string()
}

fn default_source_kind() -> String {
    "s3".to_string()
}

fn default_document_ids() -> bool {
    true
}

/// 🚀 Load the config from env vars (`LGX_*`) and, if given, a TOML file. TOML wins.
///
/// 📐 No file means env only. We do not go looking for `lgx.toml` on our own;
/// the CLI passes it when it exists.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("LGX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (LGX_*). \
             Check the section names and the log_type tag.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (LGX_*). \
                 No file was provided, so this one's all on the environment."
            .to_string(),
    };

    let app_config: AppConfig = config.extract().context(context_msg)?;
    crate::partition::validate_policies(&app_config.partitions)?;
    Ok(app_config)
}
