//! gpcand - Camera BLE to CAN bridge daemon
//!
//! Usage:
//!   gpcand [OPTIONS]
//!
//! Without a config file the bridge runs on mock transports. With
//! `--simulate-camera` the mock camera connects and answers the startup
//! status queries, which is enough to watch the heartbeat change.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gpcan_bridge::config::CanTransportConfig;
use gpcan_bridge::transport::mock::MockBleLink;
use gpcan_bridge::transport::{create_can_transport, create_isotp_links, BleEvent, BleLink};
use gpcan_bridge::{BridgeConfig, Router, Transports};
use gpcan_core::status::{query_id, status_id};
use gpcan_core::{AdvertisedStatus, Channel};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gpcand")]
#[command(about = "Bridge an action camera's BLE link to a CAN bus")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    /// CAN interface name, overrides the config file
    #[arg(short, long)]
    interface: Option<String>,

    /// Let the mock camera connect and answer status queries
    #[arg(long)]
    simulate_camera: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    info!("Starting gpcand (camera BLE to CAN bridge)");

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from: {}", path);
            BridgeConfig::load(path)?
        }
        None => {
            info!("No config file provided, using mock transport");
            BridgeConfig::default()
        }
    };
    if let Some(interface) = &args.interface {
        config.can.set_interface(interface);
    }

    match &config.can {
        CanTransportConfig::SocketCan(cfg) => info!(interface = %cfg.interface, "Using SocketCAN"),
        CanTransportConfig::Mock(_) => info!("Using mock CAN bus"),
    }

    let can = create_can_transport(&config.can)
        .await
        .context("Failed to open CAN transport")?;
    let isotp = create_isotp_links(&config)
        .await
        .context("Failed to open ISO-TP links")?;

    // the BLE stack is platform glue outside this daemon; run against the mock
    let camera = Arc::new(MockBleLink::new());
    let ble: Arc<dyn BleLink> = camera.clone();

    let mut router = Router::start(&config, Transports { ble, can, isotp });

    if args.simulate_camera {
        simulate_camera(&camera);
    }

    let mut connectivity = router.state().subscribe();
    let watch_state = router.state();
    let watcher = tokio::spawn(async move {
        while connectivity.changed().await.is_ok() {
            let snap = watch_state.snapshot();
            info!(
                state = ?snap.connectivity,
                battery = snap.battery,
                videos = snap.video_count,
                "Camera status"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    watcher.abort();
    router.shutdown();
    // let aborted workers unwind before the runtime goes away
    tokio::time::sleep(Duration::from_millis(50)).await;

    Ok(())
}

fn init_tracing(args: &Args) {
    let default_filter = if args.verbose {
        "gpcand=debug,gpcan_bridge=debug,gpcan_core=debug"
    } else {
        "gpcand=info,gpcan_bridge=info,gpcan_core=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if args.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Script the mock camera: advertise, connect, answer the status registration
fn simulate_camera(camera: &MockBleLink) {
    camera.add_response(
        Channel::Query,
        vec![
            0x04,
            query_id::REGISTER_STATUS,
            status_id::ENCODING,
            status_id::VIDEO_COUNT,
            status_id::BATTERY_PERCENT,
        ],
        vec![vec![
            0x0B,
            query_id::REGISTER_STATUS,
            0x00,
            status_id::ENCODING,
            1,
            0,
            status_id::VIDEO_COUNT,
            1,
            3,
            status_id::BATTERY_PERCENT,
            1,
            87,
        ]],
    );

    camera.inject(BleEvent::Advertisement {
        status: AdvertisedStatus::Online,
        name: Some("GoPro 1234".to_string()),
    });
    for channel in Channel::BLE {
        camera.inject(BleEvent::Subscribed(channel));
    }
    camera.inject(BleEvent::Connected);
    info!("Simulated camera connected");
}
