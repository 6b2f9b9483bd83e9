//! Streams a moving test pattern to rtsp://localhost:7654/livefeed.
//!
//! Usage: `test_pattern [BIN_DIR] [SECONDS]`. Without `BIN_DIR`, `ffmpeg` and
//! `ffserver` are looked up on `PATH`.

use ffrelay::{FrameRelay, RelayConfig, StreamParameters, SupervisorEvent, TestPattern};
use log::{error, info};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let mut args = std::env::args().skip(1);
    let bin_dir = args.next();
    let seconds = args.next().and_then(|s| s.parse().ok()).unwrap_or(30u64);

    let work_dir = std::env::temp_dir().join("ffrelay-demo");
    let mut config = RelayConfig::new(&work_dir);
    if let Some(dir) = bin_dir {
        config = config.set_bin_dir(dir);
    }

    let params = match StreamParameters::builder()
        .video_size(640, 480)
        .frame_rate(15)
        .feed_file_path(work_dir.join("feed1.ffm"))
        .build()
    {
        Ok(params) => params,
        Err(e) => {
            error!("{e}");
            return;
        }
    };

    let relay = Arc::new(FrameRelay::new(config));
    if let Err(e) = relay.start_session(params.clone()) {
        error!("Could not start streaming: {e}");
        return;
    }
    info!("Streaming to rtsp://localhost:{}/livefeed for {seconds}s", params.rtsp_port());

    let mut source = TestPattern::new(params);
    if let Err(e) = source.start_relay(relay.clone()) {
        error!("{e}");
        relay.stop_session();
        return;
    }

    let events = relay.events();
    let deadline = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < deadline {
        if let Ok(event) = events.recv_timeout(Duration::from_millis(500)) {
            match event {
                SupervisorEvent::GaveUp { name, .. } => {
                    error!("{name} keeps crashing, giving up");
                    break;
                }
                event => info!("{event:?}"),
            }
        }
    }

    source.stop();
    if let Some(stats) = relay.stats() {
        info!(
            "{} frames produced, {} written, {} dropped",
            source.frames_produced(),
            stats.frames_written,
            stats.frames_dropped
        );
    }
    relay.stop_session();
}
