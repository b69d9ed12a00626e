use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use vigil::backends::BackendRegistry;
use vigil::config::{load_server_config, ServerConfig};
use vigil::metrics::{self, Metrics};
use vigil::server::Orchestrator;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Continuous vulnerability monitoring of the container images running across a fleet")]
#[command(version)]
struct Cli {
    /// Configuration directory (default: /etc/vigil/config if exists, otherwise ~/.config/vigil/config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitoring server
    Serve {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
        /// Cycle interval in seconds (overrides the configuration)
        #[arg(long)]
        interval: Option<u64>,
        /// Worker pool size (overrides the configuration)
        #[arg(long)]
        workers: Option<usize>,
        /// Push every restored image to the monitors again on startup
        #[arg(long)]
        refresh: bool,
    },
    /// Load and validate the configuration, then print it
    CheckConfig,
    /// List the available scanner, monitor and store backends
    Backends,
}

fn config_dir(cli_value: Option<PathBuf>) -> PathBuf {
    // Precedence: CLI argument, system-wide config, user config
    cli_value.unwrap_or_else(|| {
        let system_config = PathBuf::from("/etc/vigil/config");
        if system_config.exists() {
            system_config
        } else {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vigil")
                .join("config")
        }
    })
}

fn load_config(config_dir: &std::path::Path) -> anyhow::Result<ServerConfig> {
    let mut config = load_server_config(config_dir)?;
    config.apply_env_overrides()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_dir = config_dir(cli.config);

    match cli.command {
        Commands::Serve {
            once,
            interval,
            workers,
            refresh,
        } => {
            let mut config = load_config(&config_dir)?;
            if let Some(interval) = interval {
                config.schedule.interval_secs = interval;
            }
            if let Some(workers) = workers {
                config.schedule.workers = workers;
            }
            config.validate()?;
            vigil::logging::init(&config.general)?;

            info!("Starting vigil with config: {}", config_dir.display());

            let backends = BackendRegistry::with_builtin()
                .build(&config)
                .context("Failed to set up backends")?;
            let metrics = Arc::new(Metrics::new()?);
            if config.metrics.enabled {
                metrics::serve(Arc::clone(&metrics), config.metrics.port).await?;
                info!(
                    "Metrics endpoint available at http://0.0.0.0:{}/metrics",
                    config.metrics.port
                );
            }

            let orchestrator =
                Orchestrator::new(&config, backends, metrics)?.with_refresh_on_restore(refresh);

            if once {
                let result = orchestrator.run_cycle().await;
                orchestrator.shutdown().await;
                match result {
                    Ok(Some(report)) => info!(
                        cycle = report.cycle,
                        monitored = report.monitored,
                        "Single cycle completed"
                    ),
                    Ok(None) => warn!("Cycle was skipped"),
                    Err(e) => {
                        error!(error = %e, "Cycle failed");
                        return Err(e);
                    }
                }
                return Ok(());
            }

            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
            };
            Arc::new(orchestrator).run_forever(shutdown).await?;
        }
        Commands::CheckConfig => {
            let config = load_config(&config_dir)?;
            config.validate()?;
            BackendRegistry::with_builtin()
                .build(&config)
                .context("Failed to set up backends")?;
            println!("Configuration in {} is valid", config_dir.display());
            println!("{}", serde_yaml::to_string(&config)?);
        }
        Commands::Backends => {
            let registry = BackendRegistry::with_builtin();
            for (kind, key, description) in registry.describe() {
                println!("{:<8} {:<8} {}", kind.as_str(), key, description);
            }
        }
    }

    Ok(())
}
