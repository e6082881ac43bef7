//! display-coordinator - Main entry point
//!
//! Runs the coordinator against the headless engine with synthesized vsync
//! interrupts and an optional built-in virtual console client.

mod args;

use args::Args;
use clap::Parser;
use display_coordinator::config::{Config, DisplayConfig};
use display_coordinator::coordinator::{self, CoordinatorHandle};
use display_coordinator::engine::{HeadlessAllocator, HeadlessEngine, VsyncTicker};
use display_coordinator::session::{Reply, Request, SessionEvent};
use display_coordinator::status::Status;
use display_coordinator::types::{ClientKind, DisplayId, PixelFormat, VirtconMode, VsyncAckCookie};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task;

/// Vsyncs between two color changes of the virtual console
const VIRTCON_REPAINT_INTERVAL: u64 = 60;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match args.load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };

    let log_level = if args.verbose { "debug" } else { config.logging.level.as_str() };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("DISPLAY_COORDINATOR_LOG").unwrap_or_else(|_| log_level.to_string()))
        .init();

    info!("display-coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Apply command line overrides
    if let Some(ref mode) = args.virtcon_mode {
        match VirtconMode::parse(mode) {
            Some(mode) => config.coordinator.virtcon_mode = mode,
            None => warn!("Invalid virtcon mode: {}, keeping {:?}", mode, config.coordinator.virtcon_mode),
        }
    }
    if args.capture {
        config.engine.capture_supported = true;
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let engine = Arc::new(HeadlessEngine::new(config.engine.capture_supported));
    let allocator = Arc::new(HeadlessAllocator::new());
    let (handle, worker) = coordinator::spawn(engine.clone(), allocator, config.coordinator.clone())?;

    handle.on_displays_changed(config.displays.iter().map(DisplayConfig::info).collect(), vec![]);
    for display in &config.displays {
        info!(
            "Display {}: {}x{} @ {} Hz",
            display.id, display.width, display.height, display.refresh_rate
        );
    }

    let rates: Vec<(DisplayId, u32)> = config
        .displays
        .iter()
        .map(|d| (DisplayId(d.id), d.refresh_rate))
        .collect();
    let ticker = VsyncTicker::start(handle.clone(), engine.clone(), &rates)?;

    let mut virtcon_handle = if args.no_virtcon {
        None
    } else {
        let handle = handle.clone();
        let displays = config.displays.clone();
        let mode = config.coordinator.virtcon_mode;
        let frames = args.frames;
        Some(task::spawn(async move { run_virtcon(handle, displays, mode, frames).await }))
    };

    let snapshot_handle = task::spawn(log_snapshots(handle.clone()));

    let shutdown = async {
        let _ = signal::ctrl_c().await;
        info!("Shutdown signal received");
    };

    match virtcon_handle.as_mut() {
        Some(virtcon) => {
            tokio::select! {
                _ = shutdown => {
                    info!("Initiating graceful shutdown...");
                }
                result = virtcon => match result {
                    Ok(Ok(vsyncs)) => info!("Virtual console finished after {} vsyncs", vsyncs),
                    Ok(Err(e)) => error!("Virtual console failed: {}", e),
                    Err(e) => error!("Virtual console task panicked: {}", e),
                },
            }
        }
        None => shutdown.await,
    }

    // Cleanup
    snapshot_handle.abort();
    ticker.stop();
    handle.shutdown();
    if task::spawn_blocking(move || worker.join()).await.is_err() {
        error!("Coordinator worker did not stop cleanly");
    }
    info!(
        "Last applied config stamp {}, {} image(s) still imported",
        engine.last_applied_stamp(),
        engine.live_image_count()
    );

    Ok(())
}

/// Built-in virtual console: one solid color layer per display, repainted
/// periodically, acknowledging vsync cookies as they arrive
async fn run_virtcon(
    handle: CoordinatorHandle,
    displays: Vec<DisplayConfig>,
    mode: VirtconMode,
    frames: Option<u64>,
) -> Result<u64, Status> {
    let mut session = handle.connect(ClientKind::Virtcon).await?;
    session.call(Request::SetVirtconMode { mode }).await?;

    let mut layers = Vec::with_capacity(displays.len());
    for display in &displays {
        let layer_id = match session.call(Request::CreateLayer).await? {
            Reply::Layer(id) => id,
            other => {
                warn!("Unexpected reply to CreateLayer: {:?}", other);
                return Err(Status::BadState);
            }
        };
        session
            .call(Request::SetDisplayLayers { display_id: DisplayId(display.id), layer_ids: vec![layer_id] })
            .await?;
        layers.push(layer_id);
    }

    let mut shade: u8 = 0;
    paint(&session, &layers, shade).await?;
    session.call(Request::EnableVsync { enable: true }).await?;
    info!("Virtual console running with {} layer(s) in {:?} mode", layers.len(), mode);

    let mut vsyncs = 0u64;
    while let Some(event) = session.next_event().await {
        match event {
            SessionEvent::Vsync { display_id, stamp, cookie, .. } => {
                vsyncs += 1;
                if cookie != VsyncAckCookie::INVALID {
                    debug!("Acknowledging vsync cookie {:#x} on display {}", cookie.0, display_id);
                    session.send(Request::AcknowledgeVsync { cookie })?;
                }
                if vsyncs % VIRTCON_REPAINT_INTERVAL == 0 {
                    shade = shade.wrapping_add(32);
                    paint(&session, &layers, shade).await?;
                    debug!("Repainted virtual console, last presented stamp {}", stamp);
                }
                if frames.is_some_and(|limit| limit > 0 && vsyncs >= limit) {
                    break;
                }
            }
            SessionEvent::OwnershipChanged(owner) => info!("Virtual console ownership: {}", owner),
            SessionEvent::DisplaysChanged { added, removed } => {
                debug!("Virtual console saw {} display(s) added, {} removed", added.len(), removed.len());
            }
        }
    }
    Ok(vsyncs)
}

async fn paint(
    session: &coordinator::SessionHandle,
    layers: &[display_coordinator::types::LayerId],
    shade: u8,
) -> Result<(), Status> {
    for layer_id in layers {
        session
            .call(Request::SetLayerColorConfig {
                layer_id: *layer_id,
                format: PixelFormat::Argb8888,
                bytes: vec![shade, shade, shade, 0xff],
            })
            .await?;
    }
    session.call(Request::ApplyConfig).await?;
    Ok(())
}

async fn log_snapshots(handle: CoordinatorHandle) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let Some(snapshot) = handle.snapshot().await else {
            break;
        };
        match serde_json::to_string(&snapshot) {
            Ok(json) => debug!("Coordinator state: {}", json),
            Err(e) => warn!("Failed to serialize coordinator state: {}", e),
        }
    }
}
