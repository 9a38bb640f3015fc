//! Motionbridge command-line runner

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use motionbridge::{BridgeConfig, ConnectionState, MotionBridge, TracingSink};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Relay animation-tool poses to a robot controller
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    print_config: bool,

    /// Seconds between status summaries (0 disables them)
    #[arg(long, default_value_t = 10)]
    status_interval: u64,
}

fn load_config(path: Option<&PathBuf>) -> Result<BridgeConfig> {
    let Some(path) = path else {
        return Ok(BridgeConfig::default());
    };
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("reading configuration from {}", path.display()))?;
    BridgeConfig::from_yaml_str(&yaml).with_context(|| format!("loading {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("motionbridge={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(args.config.as_ref())?;
    if args.print_config {
        print!("{}", config.to_yaml_string()?);
        return Ok(());
    }

    info!("Starting motionbridge {}", env!("CARGO_PKG_VERSION"));
    let bridge = MotionBridge::connect(config, Arc::new(TracingSink))?;
    let session = bridge.session();

    let status = async {
        if args.status_interval == 0 {
            return std::future::pending::<()>().await;
        }
        let mut ticks = tokio::time::interval(Duration::from_secs(args.status_interval));
        ticks.tick().await;
        loop {
            ticks.tick().await;
            let state = session.snapshot();
            let counters = state.counters;
            info!(
                animation = %state.animation.state,
                robot = %state.robot.state,
                received = counters.frames_received,
                sent = counters.frames_sent,
                dropped = counters.dropped_link_down,
                decode_errors = counters.decode_errors,
                drift = state.drift.unwrap_or_default(),
                "Status"
            );
            if state.robot.state == ConnectionState::Degraded {
                info!("Robot telemetry is late; check the controller's motion channel");
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received");
        }
        _ = status => {}
    }

    bridge.shutdown().await;
    Ok(())
}
