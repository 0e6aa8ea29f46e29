//! 🚀 lgx-cli: the front door of lgx.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 Thin wrapper: set up logging, parse arguments, load config, hand off to
//! the library, and explain the failure in plain words if there is one. 🦆

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 🪵 Turn log files into search documents, and keep the index tidy afterwards.
#[derive(Debug, Parser)]
#[command(name = "lgx", version, about)]
struct Cli {
    /// 🔧 TOML config file. Defaults to ./lgx.toml when it exists; env vars (LGX_*) fill the gaps.
    #[arg(short, long, global = true, env = "LGX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 🚀 Parse the configured inputs and bulk index them
    Run,
    /// 🏗️ Run the one-time setup sequence (roles, ISM policy, template, saved views, alias)
    Bootstrap,
    /// 📜 Print the ISM policy document the bootstrapper would PUT
    Policy,
    /// 🔬 Parse a file and print the records as NDJSON
    Parse { file: PathBuf },
    /// 🗂️ Rewrite an object path with the configured partition policies
    Rewrite { path: String },
    /// 📨 Group a JSON manifest of object descriptors into task messages
    Tasks { manifest: PathBuf },
}

/// 🔍 `--config` if given, otherwise `lgx.toml` if it's lying around, otherwise env only.
fn resolve_config_path(explicit: Option<PathBuf>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        let exists = path.try_exists().with_context(|| {
            format!(
                "💀 Couldn't check whether the config file exists. If this is a relative path, \
                 try an absolute one. Was checking here: '{}'",
                path.display()
            )
        })?;
        anyhow::ensure!(exists, "💀 Config file '{}' does not exist", path.display());
        return Ok(Some(path));
    }
    let default = Path::new("lgx.toml");
    Ok(default.is_file().then(|| default.to_path_buf()))
}

fn print_ndjson<T: serde::Serialize>(items: &[T]) -> Result<()> {
    for item in items {
        println!("{}", serde_json::to_string(item).context("💀 Failed to serialize output")?);
    }
    Ok(())
}

async fn execute(cli: Cli) -> Result<()> {
    let config_path = resolve_config_path(cli.config)?;
    let app_config = lgx::app_config::load_config(config_path.as_deref())
        .context("💀 Couldn't load the configuration. Check the file for typos and the [pipeline] section.")?;

    match cli.command {
        Command::Run => {
            let summary = lgx::run(app_config).await?;
            println!("{}", lgx::progress::summary_table(&summary));
        }
        Command::Bootstrap => {
            let state = lgx::bootstrap(app_config).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&state).context("💀 Failed to render the pipeline state")?
            );
        }
        Command::Policy => {
            let document = lgx::render_policy(&app_config);
            println!(
                "{}",
                serde_json::to_string_pretty(&document).context("💀 Failed to render the policy")?
            );
        }
        Command::Parse { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("💀 Failed to read '{}'", file.display()))?;
            let records = lgx::parse_text(&app_config, &text)?;
            print_ndjson(&records)?;
        }
        Command::Rewrite { path } => {
            println!("{}", lgx::rewrite_path(&app_config, &path));
        }
        Command::Tasks { manifest } => {
            let raw = std::fs::read_to_string(&manifest)
                .with_context(|| format!("💀 Failed to read manifest '{}'", manifest.display()))?;
            let descriptors = serde_json::from_str(&raw).with_context(|| {
                format!(
                    "💀 Manifest '{}' should be a JSON array of {{source, destination?, size}} objects",
                    manifest.display()
                )
            })?;
            print_ndjson(&lgx::plan_tasks(&app_config, descriptors))?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = execute(cli).await {
        error!("💀 error: {err}");
        let mut looks_like_connectivity = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {cause}");
            let cause = cause.to_string();
            if cause.contains("error sending request")
                || cause.contains("never reached the engine")
                || cause.to_lowercase().contains("connection refused")
                || cause.contains("tcp connect error")
                || cause.contains("dns error")
            {
                looks_like_connectivity = true;
            }
        }
        if looks_like_connectivity {
            error!(
                "🔧 hint: the search engine doesn't seem reachable. Check [engine] url, \
                 that the cluster is up, and that nothing between here and there is eating packets. ☕"
            );
        }
        std::process::exit(1);
    }
    Ok(())
}
