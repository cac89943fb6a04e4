//! `meshrouterd` — a thin CLI binary wiring a [`RouterCore`] to a
//! loopback-only demo [`IoBridge`] for local smoke testing (§0 "Crate
//! shape"). The real AMQP wire driver is out of scope for this crate.

use std::process::ExitCode;
use std::sync::atomic::Ordering;

use clap::Parser;
use meshrouter_core::core_engine::drain_general_work;
use meshrouter_core::domain_types::MaskBit;
use meshrouter_core::io_bridge::LoopbackBridge;
use meshrouter_core::RouterConfig;
use meshrouter_core::RouterCore;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "meshrouterd", about = "Router-core loopback smoke-test harness")]
struct Cli {
    /// Run with production-tuned queue/watermark defaults instead of
    /// development defaults.
    #[arg(long)]
    production: bool,

    /// This router's position in the mesh-wide bitmask.
    #[arg(long, default_value_t = 0)]
    self_bit: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config =
        if cli.production { RouterConfig::production() } else { RouterConfig::development() };
    if let Err(error) = config.validate() {
        eprintln!("invalid configuration: {error}");
        return ExitCode::FAILURE;
    }
    info!(router_id = %config.router_id, "starting meshrouterd");

    let Ok(self_bit) = MaskBit::try_new(cli.self_bit) else {
        eprintln!("self_bit {} is out of range", cli.self_bit);
        return ExitCode::FAILURE;
    };

    let (mut core, mut general_work_rx) = RouterCore::new(self_bit);
    let shutdown = core.shutdown_handle();
    let (_action_tx, action_rx) = tokio::sync::mpsc::unbounded_channel();

    let core_task = tokio::spawn(async move { core.run(action_rx).await });
    let bridge = LoopbackBridge;
    let general_work_task = tokio::spawn(async move {
        let _ = &bridge;
        loop {
            drain_general_work(&mut general_work_rx).await;
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    });

    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    info!("shutdown signal received");
    shutdown.store(false, Ordering::Release);
    drop(_action_tx);

    let _ = core_task.await;
    general_work_task.abort();
    ExitCode::SUCCESS
}
