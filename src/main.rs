//! Rune engine command line
//!
//! Generates runtime specs, checkpoints and restores containers kept in the
//! engine's state directory.

use anyhow::Context;
use clap::{Parser, Subcommand};
use rune_engine::checkpoint::{CheckpointOptions, Compression, RestoreOptions};
use rune_engine::config::EngineConfig;
use rune_engine::spec::parse_device;
use rune_engine::Runtime;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Rune engine
#[derive(Parser)]
#[command(name = "rune-engine")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Container engine core: runtime specs and checkpoint/restore", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Engine configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare a container and print its runtime spec
    Spec {
        /// Container ID or name
        container: String,
    },

    /// Checkpoint a running container
    Checkpoint {
        /// Container ID or name
        container: String,
        /// Keep the dump logs and images after restoring
        #[arg(short, long)]
        keep: bool,
        /// Leave the container running
        #[arg(short = 'R', long)]
        leave_running: bool,
        /// Dump memory only, as the base of a later checkpoint
        #[arg(short = 'P', long)]
        pre_checkpoint: bool,
        /// Dump on top of the last pre-checkpoint
        #[arg(long)]
        with_previous: bool,
        /// Export the checkpoint to an archive
        #[arg(short, long)]
        export: Option<PathBuf>,
        /// Archive compression (none, gzip)
        #[arg(long, default_value = "gzip")]
        compress: Compression,
        /// Leave root filesystem changes out of the archive
        #[arg(long)]
        ignore_rootfs: bool,
        /// Leave named volumes out of the archive
        #[arg(long)]
        ignore_volumes: bool,
        /// Print dump statistics
        #[arg(long)]
        print_stats: bool,
    },

    /// Restore a checkpointed container
    Restore {
        /// Container ID or name; omit when importing
        container: Option<String>,
        /// Keep the dump logs and images
        #[arg(short, long)]
        keep: bool,
        /// Restore from an exported archive
        #[arg(short, long)]
        import: Option<PathBuf>,
        /// Pre-checkpoint archive to import first
        #[arg(long)]
        import_previous: Option<PathBuf>,
        /// Name of the imported container
        #[arg(short, long)]
        name: Option<String>,
        /// Do not reuse the checkpointed IP addresses
        #[arg(long)]
        ignore_static_ip: bool,
        /// Do not reuse the checkpointed MAC addresses
        #[arg(long)]
        ignore_static_mac: bool,
        /// Do not apply root filesystem changes from the archive
        #[arg(long)]
        ignore_rootfs: bool,
        /// Do not restore named volumes from the archive
        #[arg(long)]
        ignore_volumes: bool,
        /// Print restore statistics
        #[arg(long)]
        print_stats: bool,
    },

    /// Parse a device string and print the result
    ParseDevice {
        /// Device in SRC[:DST][:MODE] form
        device: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    Ok(config.with_process_env())
}

/// Cancel `token` on Ctrl-C
fn cancel_on_interrupt(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::ParseDevice { device } = &cli.command {
        let parsed = parse_device(device)?;
        println!("source:      {}", parsed.source);
        println!("destination: {}", parsed.destination);
        println!("permissions: {}", parsed.permissions);
        return Ok(());
    }

    let config = load_config(cli.config.as_ref())?;
    let runtime = Runtime::from_config(config).context("initialising engine")?;
    let cancel = CancellationToken::new();
    cancel_on_interrupt(&cancel);

    match cli.command {
        Commands::Spec { container } => {
            let spec = runtime.spec(&container).await?;
            println!("{}", serde_json::to_string_pretty(&spec)?);
        }

        Commands::Checkpoint {
            container,
            keep,
            leave_running,
            pre_checkpoint,
            with_previous,
            export,
            compress,
            ignore_rootfs,
            ignore_volumes,
            print_stats,
        } => {
            let options = CheckpointOptions {
                keep,
                keep_running: leave_running,
                pre_checkpoint,
                with_previous,
                export,
                compression: compress,
                ignore_rootfs,
                ignore_volumes,
                print_stats,
            };
            let report = runtime.checkpoint(&container, &options, &cancel).await?;
            println!("{}", report.id);
            if let Some(stats) = report.statistics {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            tracing::debug!("Checkpoint took {:?}", report.duration);
        }

        Commands::Restore {
            container,
            keep,
            import,
            import_previous,
            name,
            ignore_static_ip,
            ignore_static_mac,
            ignore_rootfs,
            ignore_volumes,
            print_stats,
        } => {
            let options = RestoreOptions {
                keep,
                import,
                import_previous,
                name,
                ignore_static_ip,
                ignore_static_mac,
                ignore_rootfs,
                ignore_volumes,
                print_stats,
            };
            let report = match (&container, &options.import) {
                (Some(container), _) => runtime.restore(container, &options, &cancel).await?,
                (None, Some(_)) => runtime.restore_from_archive(&options, &cancel).await?,
                (None, None) => anyhow::bail!("either a container or --import is required"),
            };
            println!("{} (pid {})", report.id, report.pid);
            if let Some(stats) = report.statistics {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            tracing::debug!("Restore took {:?}", report.duration);
        }

        Commands::ParseDevice { .. } => {}
    }

    Ok(())
}
