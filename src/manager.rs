//! Client-facing request manager
//! Owns the store, the callback sinks and the worker session, and exposes
//! enqueue, dispatch, result submission and flush.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{CaptureRequest, DispatchedRequest, Request, SequenceId, StreamConfig, StreamId};
use crate::delivery::CallbackSinks;
use crate::error::{Error, Result};
use crate::pipeline::worker::{self, Lane, Router, Session, Wake};
use crate::pipeline::{ResultEvent, ResultKey, Shared};
use crate::telemetry::{Telemetry, TelemetrySnapshot};
use crate::{Config, FlushConfig, CONFIG};

/// How a flush ended. Either way the manager is empty afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every request completed before the deadline.
    Drained { elapsed: Duration },
    /// The deadline passed; the remaining requests were dropped.
    Abandoned {
        elapsed: Duration,
        pending: usize,
        running: usize,
    },
}

impl FlushOutcome {
    pub fn is_drained(&self) -> bool {
        matches!(self, FlushOutcome::Drained { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match *self {
            FlushOutcome::Drained { elapsed } | FlushOutcome::Abandoned { elapsed, .. } => elapsed,
        }
    }
}

pub struct RequestManager {
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
    flush: FlushConfig,
}

impl RequestManager {
    pub fn new(config: Config) -> Self {
        let shared = Shared {
            store: Default::default(),
            sinks: ArcSwap::from_pointee(CallbackSinks::default()),
            watermarks: Default::default(),
            telemetry: Telemetry::new(
                config.telemetry.rate_window,
                config.telemetry.export_metrics,
            ),
            poll_interval: worker::poll_interval(config.pipeline.poll_interval_ms),
            stall_threshold: config.pipeline.stall_threshold,
        };
        Self {
            shared: Arc::new(shared),
            session: Mutex::new(None),
            flush: config.flush,
        }
    }

    /// Builds a manager from the process-wide [`CONFIG`].
    pub fn with_global_config() -> Self {
        Self::new(CONFIG.load().as_ref().clone())
    }

    /// Starts one worker per stream plus the shutter, metadata and reclaim
    /// workers. Fails if a configuration is already active.
    pub fn configure_streams(&self, streams: &[StreamConfig]) -> Result<()> {
        let mut slot = self.session.lock();
        if slot.is_some() {
            return Err(Error::StreamConfig(
                "streams are already configured, flush first".into(),
            ));
        }

        let mut seen = HashSet::with_capacity(streams.len());
        for stream in streams {
            if !seen.insert(stream.id) {
                return Err(Error::StreamConfig(format!(
                    "stream {} is configured twice",
                    stream.id
                )));
            }
            if stream.width == 0 || stream.height == 0 {
                return Err(Error::StreamConfig(format!(
                    "stream {} has an empty resolution",
                    stream.id
                )));
            }
        }

        let session = Session::start(&self.shared, streams)?;
        self.shared.watermarks.reset();
        self.shared.store.set_accepting(true);
        *slot = Some(session);

        info!(
            streams = streams.len(),
            names = ?streams.iter().map(|s| s.id.to_string()).collect::<Vec<_>>(),
            "streams configured"
        );
        Ok(())
    }

    pub fn configured_streams(&self) -> Vec<StreamConfig> {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.streams().to_vec())
            .unwrap_or_default()
    }

    /// Replaces the client callbacks. Takes effect for the next delivery.
    pub fn register_sinks(&self, sinks: CallbackSinks) {
        self.shared.sinks.store(Arc::new(sinks));
    }

    fn router(&self) -> Result<Router> {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.router().clone())
            .ok_or(Error::NotConfigured)
    }

    #[instrument(skip_all, fields(outputs = request.outputs.len()))]
    pub fn enqueue(&self, request: CaptureRequest) -> Result<SequenceId> {
        let router = self.router()?;
        for output in &request.outputs {
            if !router.has_stream(output.stream_id) {
                return Err(Error::UnknownStream(output.stream_id));
            }
        }
        if let Some(input) = &request.input {
            if !router.has_stream(input.stream_id) {
                return Err(Error::UnknownStream(input.stream_id));
            }
        }

        let sequence_id = self.shared.store.enqueue(request)?;
        self.shared.telemetry.record_enqueue();
        debug!(sequence_id = %sequence_id, "request accepted");
        Ok(sequence_id)
    }

    /// Hands the oldest pending request to the pipeline.
    pub fn dispatch_next(&self) -> Result<DispatchedRequest> {
        let request = self.shared.store.dispatch_next()?;
        self.shared.telemetry.record_dispatch();
        Ok(request.snapshot())
    }

    /// Accepts a completion event from a pipeline stage and wakes the lane
    /// that delivers it. Stale events are dropped.
    pub fn submit(&self, event: ResultEvent) -> Result<ResultKey> {
        let router = self.router()?;
        let lane = Lane::of(&event);
        let kind = event.kind();

        match self.shared.store.stage(event) {
            Ok((request, key)) => {
                router.wake(lane, request.sequence_id());
                Ok(key)
            }
            Err(err) => {
                if let Error::StaleEvent { .. } = err {
                    warn!(error = %err, "dropping stale result");
                }
                self.shared.telemetry.record_stale(kind);
                Err(err)
            }
        }
    }

    pub fn bind_frame_count(&self, frame_count: u32, sequence_id: SequenceId) -> Result<()> {
        self.shared.store.bind_frame_count(frame_count, sequence_id)
    }

    pub fn resolve_frame_count(&self, frame_count: u32) -> Option<SequenceId> {
        self.shared.store.resolve_frame_count(frame_count)
    }

    /// Runs `f` against a running request.
    pub fn with_request<R>(&self, sequence_id: SequenceId, f: impl FnOnce(&Request) -> R) -> Result<R> {
        self.shared.store.lookup(sequence_id, f)
    }

    /// Reclaims a complete request right away instead of waiting for the
    /// reclaim worker. Errors if the request is unknown or incomplete.
    pub fn reclaim(&self, sequence_id: SequenceId) -> Result<()> {
        self.shared.store.reclaim(sequence_id)?;
        self.shared.telemetry.record_reclaim();
        Ok(())
    }

    /// Flushes with the configured timeout.
    pub fn flush(&self) -> FlushOutcome {
        self.flush_with_timeout(Duration::from_millis(self.flush.timeout_ms))
    }

    /// Rejects new requests, waits up to `timeout` for in-flight ones to
    /// complete, then stops the workers. Requests still outstanding get an
    /// error completion for every result not yet delivered, oldest first,
    /// before they are dropped. Streams must be configured again afterwards.
    ///
    /// Must not be called from inside a callback sink.
    #[instrument(skip(self))]
    pub fn flush_with_timeout(&self, timeout: Duration) -> FlushOutcome {
        let started = Instant::now();
        let poll = Duration::from_millis(self.flush.poll_interval_ms.max(1));
        self.shared.store.set_accepting(false);

        let router = self.router().ok();
        let outcome = loop {
            if let Some(router) = &router {
                router.broadcast(Wake::Flush);
            }

            let pending = self.shared.store.pending_count();
            let running = self.shared.store.running_count();
            let elapsed = started.elapsed();
            if pending == 0 && running == 0 {
                break FlushOutcome::Drained { elapsed };
            }
            if elapsed >= timeout {
                break FlushOutcome::Abandoned {
                    elapsed,
                    pending,
                    running,
                };
            }
            thread::sleep(poll);
        };
        drop(router);

        // Joined outside the lock: sinks may still be calling into us.
        let session = self.session.lock().take();
        if let Some(mut session) = session {
            session.shutdown();
        }
        self.abort_outstanding();

        let cleared = self.shared.store.clear();
        self.shared.watermarks.reset();
        self.shared.telemetry.record_flush(cleared.total());

        match outcome {
            FlushOutcome::Drained { elapsed } => {
                info!(elapsed_ms = elapsed.as_millis() as u64, "flush drained")
            }
            FlushOutcome::Abandoned {
                elapsed,
                pending,
                running,
            } => warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                pending,
                running,
                dropped = ?cleared,
                "flush timed out, abandoning requests"
            ),
        }
        outcome
    }

    /// Sends the missing results of every outstanding request through the
    /// sinks as errors. Runs with the workers stopped.
    fn abort_outstanding(&self) {
        let sinks = self.shared.sinks.load();
        for sequence_id in self.shared.store.sequencer().snapshot() {
            let Some(request) = self.shared.store.get(sequence_id) else {
                continue;
            };
            let events = request.abort();
            debug!(sequence_id = %sequence_id, results = events.len(), "aborting request");
            for event in events {
                sinks.deliver(&request, &event);
                self.shared.telemetry.record_delivery(event.kind());
            }
        }
    }

    /// Reports a fatal device error to the client. Outstanding requests are
    /// left to the next flush.
    pub fn notify_device_error(&self) {
        error!("device error reported");
        self.shared.telemetry.record_device_error();
        self.shared.sinks.load().device_error();
    }

    /// False while flushing or before streams are configured.
    pub fn is_accepting(&self) -> bool {
        self.session.lock().is_some() && self.shared.store.is_accepting()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.store.pending_count()
    }

    pub fn running_count(&self) -> usize {
        self.shared.store.running_count()
    }

    /// Sequence ids still in flight, oldest first.
    pub fn in_flight(&self) -> Vec<SequenceId> {
        self.shared.store.sequencer().snapshot()
    }

    pub fn watermark(&self, stream_id: StreamId) -> Option<SequenceId> {
        self.shared.watermarks.get(stream_id)
    }

    pub fn queued_wakes(&self) -> usize {
        self.router().map(|router| router.queued()).unwrap_or(0)
    }

    pub fn dump(&self) -> String {
        self.shared.store.sequencer().dump()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.shared.telemetry.snapshot()
    }
}

impl Drop for RequestManager {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.get_mut().take() {
            session.shutdown();
        }
    }
}
