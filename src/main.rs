mod config;
mod dispatcher;
mod evidence;
mod frame_source;
mod link;
mod runway_detection;
mod session;
mod trigger;
mod types;

use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};

use evidence::EvidenceLogger;
use frame_source::ImageDirSource;
use link::{LinkHandle, LoopbackLink};
use runway_detection::SegmentationDetector;
use session::Session;
use types::{AbortReason, Config, SessionClock, SessionOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load("config.yaml")?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| format!("autoland_trigger={}", config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Autoland trigger starting");

    let clock = SessionClock::start();
    let mut source = ImageDirSource::open(&config.camera.input_dir, clock)?;
    let mut detector = SegmentationDetector::new(config.detection.clone(), config.camera.proc_width);

    if config.detection.calibration.enabled {
        info!(
            "Calibrating detector thresholds over up to {} frame(s)",
            config.detection.calibration.frames
        );
        detector.calibrate(
            &mut source,
            config.detection.calibration.frames,
            Duration::from_secs_f64(config.detection.calibration.timeout_secs),
        )?;
    }

    // Stand-in controller until a real telemetry transport is wired in
    let link = LinkHandle::new(Box::new(LoopbackLink::new()), &config.link);
    let monitor = link::spawn_monitor(
        link.clone(),
        Duration::from_millis(config.link.status_refresh_interval_ms),
    );

    let evidence = EvidenceLogger::new(&config.evidence)?;
    let mut session = Session::new(&config, link, evidence, clock);

    let abort_handle = session.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Abort signal received");
            abort_handle.abort(AbortReason::OperatorAbort);
        }
    });

    let outcome = session.run(&mut source, &mut detector).await?;
    monitor.abort();

    match outcome {
        SessionOutcome::Done => info!("Autoland mode change acknowledged; exiting"),
        SessionOutcome::Aborted(reason) => warn!("Session ended without autoland: {}", reason.as_str()),
        SessionOutcome::InProgress => {}
    }

    Ok(())
}
