//! Neo Enclave Host
//!
//! Untrusted side of the Neo Service Layer enclave. Loads the configuration,
//! starts the (simulated) enclave, drives schedule triggers from the host
//! clock, exports enclave metrics to a Prometheus textfile and relays
//! JSON-lines requests from stdin to the boundary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use neo_enclave::{Enclave, EnclaveClient, EnclaveTransport, InProcessTransport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn};

mod config;
mod logging;
mod metrics;

use config::HostConfig;

#[derive(Parser, Debug)]
#[command(name = "neo-enclave-host", version, about = "Neo Service Layer enclave host")]
struct Cli {
    /// Path to the host configuration file
    #[arg(short, long, default_value = "enclave-host.toml", global = true)]
    config: PathBuf,

    /// Override the enclave data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Keep all enclave state in memory
    #[arg(long, global = true)]
    in_memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the enclave, relaying JSON-lines requests from stdin to stdout
    Serve,
    /// Send a single JSON request and print the response
    Call {
        /// Request object, e.g. '{"op":"list_triggers"}'
        request: String,
    },
    /// Print the enclave's metrics in Prometheus text format
    Metrics,
    /// Write the default configuration to the config path
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::InitConfig = cli.command {
        HostConfig::default().save_to_file(&cli.config)?;
        println!("wrote {}", cli.config.display());
        return Ok(());
    }

    let config = HostConfig::load_or_create(&cli.config)?.with_overrides(cli.data_dir, cli.in_memory);
    config.validate()?;
    logging::init_logging(&config.logging)?;

    let enclave = tokio::task::spawn_blocking({
        let enclave_config = config.enclave.clone();
        move || Enclave::from_config(enclave_config)
    })
    .await
    .context("enclave start-up task panicked")?
    .context("failed to start enclave")?;
    let transport = InProcessTransport::new(Arc::new(enclave));

    match cli.command {
        Command::Call { request } => {
            let response = relay(transport, request.into_bytes()).await?;
            println!("{}", String::from_utf8_lossy(&response));
            Ok(())
        }
        Command::Metrics => {
            let client = EnclaveClient::new(transport);
            let text = tokio::task::spawn_blocking(move || client.get_metrics())
                .await
                .context("enclave call panicked")??;
            print!("{text}");
            Ok(())
        }
        Command::Serve => serve(config, transport).await,
        Command::InitConfig => Ok(()),
    }
}

async fn serve(config: HostConfig, transport: InProcessTransport) -> Result<()> {
    info!(
        data_dir = %config.enclave.data_dir.display(),
        backend = ?config.enclave.storage_backend,
        "enclave host started"
    );

    let scheduler = config.scheduler.enabled.then(|| {
        let client = EnclaveClient::new(transport.clone());
        let period = Duration::from_secs(config.scheduler.poll_interval_secs);
        tokio::spawn(run_scheduler(client, period))
    });
    let exporter = config.metrics.enabled.then(|| {
        let client = EnclaveClient::new(transport.clone());
        let period = Duration::from_secs(config.metrics.interval_secs);
        info!(path = %config.metrics.textfile.display(), "exporting metrics");
        tokio::spawn(metrics::run_exporter(
            client,
            config.metrics.textfile.clone(),
            period,
        ))
    });

    tokio::select! {
        result = relay_stdin(transport) => {
            if let Err(e) = result {
                error!(error = %e, "request relay failed");
            }
        }
        _ = signal::ctrl_c() => info!("shutdown signal received"),
    }

    for handle in [scheduler, exporter].into_iter().flatten() {
        handle.abort();
    }
    info!("enclave host stopped");
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn run_scheduler(client: EnclaveClient<InProcessTransport>, period: Duration) {
    let client = Arc::new(client);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let client = client.clone();
        let now = unix_now();
        match tokio::task::spawn_blocking(move || client.process_scheduled_triggers(now)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(count)) => debug!(count, now, "scheduled triggers processed"),
            Ok(Err(e)) => warn!(error = %e, "scheduler tick failed"),
            Err(e) => error!(error = %e, "scheduler task panicked"),
        }
    }
}

async fn relay(transport: InProcessTransport, request: Vec<u8>) -> Result<Vec<u8>> {
    let response = tokio::task::spawn_blocking(move || transport.call(&request))
        .await
        .context("enclave call panicked")??;
    Ok(response)
}

/// One request per stdin line, one response per stdout line.
async fn relay_stdin(transport: InProcessTransport) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut response = relay(transport.clone(), line.into_bytes()).await?;
        response.push(b'\n');
        stdout.write_all(&response).await?;
        stdout.flush().await?;
    }
    info!("stdin closed");
    Ok(())
}
