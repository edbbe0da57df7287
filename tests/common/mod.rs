#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use capture_reconciler::{
    BufferHandle, BufferStatus, CallbackSinks, CaptureRequest, Config, FinalResult, NotifyError,
    NotifyStatus, RequestManager, RequestState, ResultKind, SequenceId, Settings, StreamBuffer, StreamClass, StreamConfig,
    StreamId,
};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum Delivered {
    Notify(SequenceId),
    Buffer(SequenceId, StreamId),
    Partial(SequenceId),
    Final(FinalResult),
}

impl Delivered {
    pub fn sequence_id(&self) -> SequenceId {
        match self {
            Delivered::Notify(id) | Delivered::Buffer(id, _) | Delivered::Partial(id) => *id,
            Delivered::Final(res) => res.sequence_id,
        }
    }
}

/// Sink that records every delivery and the request state seen by the
/// callback.
#[derive(Clone, Default)]
pub struct Recorder {
    log: Arc<Mutex<Vec<Delivered>>>,
    states: Arc<Mutex<Vec<(SequenceId, ResultKind, RequestState)>>>,
    errors: Arc<Mutex<Vec<(SequenceId, NotifyError)>>>,
    failed_buffers: Arc<Mutex<Vec<(SequenceId, StreamId)>>>,
    device_errors: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn sinks(&self) -> CallbackSinks {
        let (notify, buffer, partial, fin) = (self.clone(), self.clone(), self.clone(), self.clone());
        let device_errors = Arc::clone(&self.device_errors);
        CallbackSinks::new()
            .on_notify(move |req, msg| {
                if let NotifyStatus::Error(code) = msg.status {
                    notify.errors.lock().push((msg.sequence_id, code));
                }
                notify.push(req.state(), ResultKind::Notify, Delivered::Notify(msg.sequence_id))
            })
            .on_buffer(move |req, buf| {
                if buf.status == BufferStatus::Error {
                    buffer.failed_buffers.lock().push((buf.sequence_id, buf.stream_id));
                }
                buffer.push(
                    req.state(),
                    ResultKind::BufferReady,
                    Delivered::Buffer(buf.sequence_id, buf.stream_id),
                )
            })
            .on_partial_metadata(move |req, meta| {
                partial.push(
                    req.state(),
                    ResultKind::PartialMetadata,
                    Delivered::Partial(meta.sequence_id),
                )
            })
            .on_final_metadata(move |req, res| {
                fin.push(req.state(), ResultKind::FinalMetadata, Delivered::Final(res.clone()))
            })
            .on_device_error(move || {
                device_errors.fetch_add(1, Ordering::SeqCst);
            })
    }

    fn push(&self, state: RequestState, kind: ResultKind, delivered: Delivered) {
        self.states.lock().push((delivered.sequence_id(), kind, state));
        self.log.lock().push(delivered);
    }

    pub fn log(&self) -> Vec<Delivered> {
        self.log.lock().clone()
    }

    pub fn states(&self) -> Vec<(SequenceId, ResultKind, RequestState)> {
        self.states.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    /// Error notifications, in delivery order.
    pub fn errors(&self) -> Vec<(SequenceId, NotifyError)> {
        self.errors.lock().clone()
    }

    pub fn failed_buffers(&self) -> Vec<(SequenceId, StreamId)> {
        self.failed_buffers.lock().clone()
    }

    pub fn device_errors(&self) -> usize {
        self.device_errors.load(Ordering::SeqCst)
    }

    pub fn notifies(&self) -> Vec<SequenceId> {
        self.filter(|d| matches!(d, Delivered::Notify(_)))
    }

    pub fn buffers_on(&self, stream: StreamId) -> Vec<SequenceId> {
        self.filter(|d| matches!(d, Delivered::Buffer(_, s) if *s == stream))
    }

    pub fn finals(&self) -> Vec<FinalResult> {
        self.log
            .lock()
            .iter()
            .filter_map(|d| match d {
                Delivered::Final(res) => Some(res.clone()),
                _ => None,
            })
            .collect()
    }

    fn filter(&self, keep: impl Fn(&Delivered) -> bool) -> Vec<SequenceId> {
        self.log
            .lock()
            .iter()
            .filter(|d| keep(d))
            .map(Delivered::sequence_id)
            .collect()
    }
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.pipeline.poll_interval_ms = 5;
    config.flush.poll_interval_ms = 5;
    config.telemetry.export_metrics = false;
    config
}

pub fn stream(class: StreamClass) -> StreamConfig {
    StreamConfig::new(class, 0, 640, 480).unwrap()
}

/// Manager configured with `streams` and a fresh recorder.
pub fn manager(streams: &[StreamConfig]) -> (RequestManager, Recorder) {
    let manager = RequestManager::new(config());
    manager.configure_streams(streams).unwrap();
    let recorder = Recorder::default();
    manager.register_sinks(recorder.sinks());
    (manager, recorder)
}

pub fn capture(outputs: &[StreamId]) -> CaptureRequest {
    outputs.iter().enumerate().fold(
        CaptureRequest::new().with_settings(Settings::new("ae=auto")),
        |req, (i, id)| req.with_output(StreamBuffer::new(*id, BufferHandle(i as u64))),
    )
}

/// Enqueues and dispatches one request per entry.
pub fn start(manager: &RequestManager, requests: &[&[StreamId]]) -> Vec<SequenceId> {
    requests
        .iter()
        .map(|outputs| {
            let id = manager.enqueue(capture(outputs)).unwrap();
            manager.dispatch_next().unwrap();
            id
        })
        .collect()
}

pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    done()
}

pub const TIMEOUT: Duration = Duration::from_secs(5);
