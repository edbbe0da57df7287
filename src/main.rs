//! Reconciler demo: a simulated frame factory completing results out of order

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use capture_reconciler::{
    utils, BufferHandle, CallbackSinks, CaptureRequest, Config, RequestManager, ResultEvent,
    SequenceId, Settings, StreamBuffer, StreamClass, StreamConfig,
};
use color_eyre::Result;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const REQUESTS: u64 = 24;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    utils::init_tracing("capture_reconciler=debug,reconciler_demo=info");

    info!("Reconciler demo launching...");

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    capture_reconciler::CONFIG.store(Arc::new(config));

    let manager = Arc::new(RequestManager::with_global_config());
    let preview = StreamConfig::new(StreamClass::Preview, 0, 1280, 720)?;
    let jpeg = StreamConfig::new(StreamClass::Jpeg, 0, 4032, 3024)?;
    manager.configure_streams(&[preview, jpeg])?;

    manager.register_sinks(
        CallbackSinks::new()
            .on_notify(|_, msg| info!(sequence_id = %msg.sequence_id, status = ?msg.status, "shutter"))
            .on_buffer(|_, buf| info!(sequence_id = %buf.sequence_id, stream = %buf.stream_id, buffer = %buf.buffer, "buffer"))
            .on_partial_metadata(|_, meta| info!(sequence_id = %meta.sequence_id, "partial result"))
            .on_final_metadata(|_, res| {
                info!(sequence_id = %res.sequence_id, depth = res.pipeline_depth, "final result")
            }),
    );

    let started = Instant::now();
    tokio::select! {
        res = run_factory(Arc::clone(&manager), preview, jpeg, started) => res?,
        _ = tokio::signal::ctrl_c() => warn!("interrupted, flushing"),
    }

    // Let the reclaim worker catch up before reporting.
    for _ in 0..50 {
        if manager.running_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    info!(telemetry = ?manager.telemetry(), in_flight = %manager.dump(), "factory finished");

    let flusher = Arc::clone(&manager);
    let outcome = tokio::task::spawn_blocking(move || flusher.flush()).await?;
    info!(?outcome, "Reconciler demo shutting down");
    Ok(())
}

/// Enqueues and dispatches every request, then completes each result kind
/// from its own task after a pseudo-random delay.
async fn run_factory(
    manager: Arc<RequestManager>,
    preview: StreamConfig,
    jpeg: StreamConfig,
    started: Instant,
) -> Result<()> {
    let mut stages = JoinSet::new();

    for n in 0..REQUESTS {
        let mut request = CaptureRequest::new()
            .with_output(StreamBuffer::new(preview.id, BufferHandle(0x100 + n)));
        if n == 0 {
            request = request.with_settings(Settings::new("ae=auto;af=continuous"));
        }
        if n % 4 == 3 {
            request = request.with_output(StreamBuffer::new(jpeg.id, BufferHandle(0x200 + n)));
        }

        let sequence_id = manager.enqueue(request)?;
        manager.bind_frame_count(n as u32, sequence_id)?;
        let dispatched = manager.dispatch_next()?;

        let mut events = vec![
            ResultEvent::shutter(sequence_id, started.elapsed().as_nanos() as u64),
            ResultEvent::partial(sequence_id, "3a-state"),
            ResultEvent::final_metadata(sequence_id, "android.sensor.exposureTime=33ms"),
        ];
        events.extend(
            dispatched
                .outputs
                .iter()
                .map(|out| ResultEvent::buffer(sequence_id, out.stream_id, out.buffer)),
        );

        for (slot, event) in events.into_iter().enumerate() {
            let manager = Arc::clone(&manager);
            let delay = jitter(sequence_id, slot as u64);
            stages.spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(err) = manager.submit(event) {
                    error!(error = %err, "pipeline stage result rejected");
                }
            });
        }

        tokio::time::sleep(Duration::from_millis(33)).await;
    }

    while let Some(res) = stages.join_next().await {
        res?;
    }
    Ok(())
}

fn jitter(sequence_id: SequenceId, slot: u64) -> Duration {
    let mut x = sequence_id.0.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ (slot + 1).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 31;
    Duration::from_millis(5 + x % 120)
}
