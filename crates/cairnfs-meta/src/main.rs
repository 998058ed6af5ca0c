#![warn(missing_docs)]

//! `cairn-meta`: runs one metadata node against a shared edit log directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cairnfs_meta::{
    DirSegmentSource, HaController, HaRole, NamenodeConfig, Namesystem, NamespaceSnapshot,
    ProcessExit, SystemClock,
};
use clap::{Parser, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cairn-meta")]
#[command(about = "CairnFS metadata node", long_about = None)]
struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(short, long, env = "CAIRN_META_CONFIG", default_value = "/etc/cairnfs/meta.toml")]
    config: PathBuf,

    /// Overrides the configured initial role
    #[arg(short, long, value_enum)]
    role: Option<RoleArg>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Copy, Clone, ValueEnum)]
enum RoleArg {
    Active,
    Standby,
}

impl From<RoleArg> for HaRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Active => HaRole::Active,
            RoleArg::Standby => HaRole::Standby,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if cli.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    let mut config = if cli.config.exists() {
        NamenodeConfig::from_file(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
        NamenodeConfig::default()
    };
    if let Some(role) = cli.role {
        config.initial_role = role.into();
    }

    tracing::info!(
        node_id = %config.node_id,
        role = %config.initial_role,
        shared_edits = %config.shared_edits_dir.display(),
        "CairnFS metadata node starting"
    );

    let namespace = match &config.image_path {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading namespace image {}", path.display()))?;
            NamespaceSnapshot::decode_image(&bytes)?
        }
        None => NamespaceSnapshot::new(),
    };

    // Every node starts as a standby; an active start goes through promotion
    // so the shared log is replayed first.
    let namesystem = Arc::new(Namesystem::new(
        &config.safe_mode,
        namespace,
        HaRole::Standby,
        Arc::new(SystemClock::new()),
    )?);
    let controller = HaController::new(
        namesystem.clone(),
        Arc::new(DirSegmentSource::new(config.shared_edits_dir.clone())),
        Arc::new(ProcessExit),
        config.replay.clone(),
    );

    match config.initial_role {
        HaRole::Active => controller.transition_to_active().await?,
        HaRole::Standby => controller.start().await?,
    }

    let mut status_tick =
        tokio::time::interval(Duration::from_millis(config.status_interval_ms.max(1)));
    loop {
        tokio::select! {
            _ = status_tick.tick() => {
                let report = namesystem.safe_mode_report()?;
                let status = namesystem.safe_mode_status()?;
                tracing::info!(
                    role = %namesystem.role()?,
                    last_applied = %namesystem.last_applied_txid()?,
                    state = ?report.state,
                    total_blocks = report.total_blocks,
                    safe_blocks = report.safe_blocks,
                    "{}",
                    if status.is_empty() { "Safe mode is OFF." } else { status.as_str() }
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("shutdown requested");
                break;
            }
        }
    }

    controller.shutdown().await?;
    Ok(())
}
