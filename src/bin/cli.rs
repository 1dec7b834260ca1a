use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use multiverse_connector::transport::TcpConnector;
use multiverse_connector::{server, MemoryScene, SyncConfig, SyncEngine, SyncStatus};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "multiverse-cli")]
#[command(
    about = "Real-time state synchronization between a simulation host and a multiverse server",
    version
)]
struct Cli {
    /// Also write logs to a daily rotated file in this directory
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reference multiverse server
    Serve {
        #[arg(short, long, default_value = "127.0.0.1:7000")]
        bind: String,
    },

    /// Connect an in-memory scene to a server and drive it with a fixed tick
    Connect {
        #[arg(short, long, default_value = "multiverse.toml")]
        config: PathBuf,

        /// Stop after this many ticks (runs until Ctrl-C when omitted)
        #[arg(long)]
        ticks: Option<u64>,

        /// Host ticks per second
        #[arg(long, default_value = "60")]
        tick_rate: u32,
    },

    /// Write an example configuration file
    InitConfig {
        #[arg(short, long, default_value = "multiverse.toml")]
        path: PathBuf,
    },
}

/// Subscriber writing to stderr and, when `log_dir` is set, to a daily
/// rotated file. The guard must outlive the subscriber for file output.
fn logging_subscriber(
    log_dir: Option<&Path>,
) -> Result<(impl tracing::Subscriber + Send + Sync + 'static, Option<WorkerGuard>)> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let (non_blocking, guard) =
                tracing_appender::non_blocking(rolling::daily(dir, "multiverse.log"));
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    Ok((subscriber, guard))
}

fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let (subscriber, guard) = logging_subscriber(log_dir)?;
    subscriber.init();
    Ok(guard)
}

fn paint(status: SyncStatus) -> ColoredString {
    match status {
        SyncStatus::Synchronizing => status.as_str().green().bold(),
        SyncStatus::Handshaking | SyncStatus::Idle => status.as_str().cyan(),
        SyncStatus::Degraded => status.as_str().yellow().bold(),
        SyncStatus::Failed => status.as_str().red().bold(),
        SyncStatus::Closed => status.as_str().bright_black(),
    }
}

/// Blocking host loop; returns the final status
fn run_host(mut engine: SyncEngine, mut scene: MemoryScene, ticks: Option<u64>, tick_rate: u32) -> SyncStatus {
    let period = Duration::from_secs_f64(1.0 / f64::from(tick_rate.max(1)));
    let shutdown = engine.shutdown_handle();
    let mut last = engine.status();
    let mut tick = 0u64;

    println!("{} {}", "●".bright_black(), paint(last));

    while !shutdown.is_requested() && ticks.map_or(true, |limit| tick < limit) {
        let started = Instant::now();
        let status = engine.on_tick(&mut scene, period);
        tick += 1;

        if status != last {
            let reason = engine
                .last_error()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default();
            println!(
                "{} {} {}{}",
                "→".bright_black(),
                format!("tick {tick}").bright_black(),
                paint(status),
                reason.bright_black()
            );
            last = status;
        }
        if status == SyncStatus::Failed {
            break;
        }

        if let Some(rest) = period.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    engine.shutdown();
    engine.status()
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_dir.as_deref())?;

    match cli.command {
        Commands::Serve { bind } => {
            println!(
                "{}",
                format!("🌐 Starting multiverse server on {bind}...").cyan().bold()
            );
            server::serve(&bind).await?;
        }

        Commands::Connect {
            config,
            ticks,
            tick_rate,
        } => {
            let config = SyncConfig::load(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            println!(
                "{} {} {}",
                "🔗 Connecting to".cyan().bold(),
                config.server_address.bright_white(),
                format!("({} published, {} subscribed)", config.send.len(), config.receive.len())
                    .bright_black()
            );

            let scene = MemoryScene::from_declarations(config.send.iter().chain(&config.receive));
            let mut engine = SyncEngine::new(config, TcpConnector)?;
            engine.connect()?;

            let shutdown = engine.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    shutdown.request();
                }
            });

            let status =
                tokio::task::spawn_blocking(move || run_host(engine, scene, ticks, tick_rate)).await?;
            println!("{} {}", "✓ Finished:".green(), paint(status));
        }

        Commands::InitConfig { path } => {
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            let contents = SyncConfig::example().to_toml_string()?;
            tokio::fs::write(&path, contents)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "{} Wrote {}",
                "✓".green(),
                path.display().to_string().bright_white()
            );
            println!(
                "  Next: {}",
                format!("multiverse-cli connect --config {}", path.display()).bright_white()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_dir_receives_events() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");

        let (subscriber, guard) = logging_subscriber(Some(&logs)).unwrap();
        assert!(guard.is_some());
        tracing::subscriber::with_default(subscriber, || {
            tracing::error!("handshake refused by server");
        });
        drop(guard);

        let written: String = std::fs::read_dir(&logs)
            .unwrap()
            .map(|entry| std::fs::read_to_string(entry.unwrap().path()).unwrap())
            .collect();
        assert!(written.contains("handshake refused by server"), "{written:?}");
    }

    #[test]
    fn test_stderr_only_without_log_dir() {
        let (subscriber, guard) = logging_subscriber(None).unwrap();
        assert!(guard.is_none());
        tracing::subscriber::with_default(subscriber, || tracing::info!("stderr only"));
    }
}
