//! Dispatch and reclaim workers.
//!
//! Every lane (shutter, partial metadata, final metadata, and one per
//! configured output stream) owns a thread that waits on its own wake queue
//! and then walks a fresh sequencer snapshot oldest-first. The first request
//! a lane cannot deliver for stops that lane's pass; other lanes keep going.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, trace, warn};

use crate::capture::request::Gate;
use crate::capture::{Request, SequenceId, StreamConfig, StreamId};
use crate::error::{Error, Result};
use crate::pipeline::result::{ResultEvent, ResultKey, ResultKind};
use crate::pipeline::Shared;

/// Ordered delivery lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Notify,
    Partial,
    Final,
    Stream(StreamId),
}

impl Lane {
    pub fn of(event: &ResultEvent) -> Self {
        match event {
            ResultEvent::Notify(_) => Lane::Notify,
            ResultEvent::BufferReady(buf) => Lane::Stream(buf.stream_id),
            ResultEvent::PartialMetadata(_) => Lane::Partial,
            ResultEvent::FinalMetadata(_) => Lane::Final,
        }
    }

    pub fn kind(self) -> ResultKind {
        match self {
            Lane::Notify => ResultKind::Notify,
            Lane::Partial => ResultKind::PartialMetadata,
            Lane::Final => ResultKind::FinalMetadata,
            Lane::Stream(_) => ResultKind::BufferReady,
        }
    }

    pub(crate) fn waiting_reason(self) -> &'static str {
        match self {
            Lane::Notify => "waiting for shutter",
            Lane::Partial => "waiting for partial metadata",
            Lane::Final => "waiting for final metadata",
            Lane::Stream(_) => "waiting for buffer",
        }
    }

    fn thread_name(self) -> String {
        match self {
            Lane::Notify => "notify-callback".into(),
            Lane::Partial => "partial-callback".into(),
            Lane::Final => "final-callback".into(),
            Lane::Stream(id) => format!("{id}-callback"),
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Stream(id) => write!(f, "stream {id}"),
            lane => f.write_str(lane.kind().name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// Something changed for this request.
    Check(SequenceId),
    /// Flush in progress; run a pass now.
    Flush,
    Shutdown,
}

/// Senders for every worker queue of a session.
#[derive(Clone)]
pub(crate) struct Router {
    notify: Sender<Wake>,
    partial: Sender<Wake>,
    final_metadata: Sender<Wake>,
    streams: Arc<HashMap<StreamId, Sender<Wake>>>,
    reclaim: Sender<Wake>,
}

impl Router {
    fn sender(&self, lane: Lane) -> Option<&Sender<Wake>> {
        match lane {
            Lane::Notify => Some(&self.notify),
            Lane::Partial => Some(&self.partial),
            Lane::Final => Some(&self.final_metadata),
            Lane::Stream(id) => self.streams.get(&id),
        }
    }

    pub(crate) fn has_stream(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub(crate) fn wake(&self, lane: Lane, sequence_id: SequenceId) {
        match self.sender(lane) {
            Some(tx) => {
                if tx.send(Wake::Check(sequence_id)).is_err() {
                    trace!(lane = %lane, "wake dropped, worker gone");
                }
            }
            None => warn!(lane = %lane, sequence_id = %sequence_id, "no worker for lane"),
        }
    }

    /// Wakes every lane gated on the request's shutter.
    pub(crate) fn wake_gated(&self, request: &Request) {
        let sequence_id = request.sequence_id();
        self.wake(Lane::Partial, sequence_id);
        self.wake(Lane::Final, sequence_id);
        for stream_id in request.output_stream_ids() {
            self.wake(Lane::Stream(stream_id), sequence_id);
        }
    }

    pub(crate) fn check_reclaim(&self, sequence_id: SequenceId) {
        if self.reclaim.send(Wake::Check(sequence_id)).is_err() {
            trace!(sequence_id = %sequence_id, "reclaim check dropped, worker gone");
        }
    }

    fn all(&self) -> impl Iterator<Item = &Sender<Wake>> {
        [&self.notify, &self.partial, &self.final_metadata, &self.reclaim]
            .into_iter()
            .chain(self.streams.values())
    }

    pub(crate) fn broadcast(&self, wake: Wake) {
        for tx in self.all() {
            let _ = tx.send(wake);
        }
    }

    /// Wakes queued across every worker.
    pub(crate) fn queued(&self) -> usize {
        self.all().map(|tx| tx.len()).sum()
    }
}

enum Step {
    Delivered,
    Skip,
    Blocked(&'static str),
}

/// Counts consecutive passes blocked on the same head request.
struct StallTracker {
    threshold: u32,
    head: Option<SequenceId>,
    passes: u32,
}

impl StallTracker {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            head: None,
            passes: 0,
        }
    }

    /// Returns the pass count when a stall should be reported.
    fn blocked(&mut self, sequence_id: SequenceId) -> Option<u32> {
        if self.head == Some(sequence_id) {
            self.passes += 1;
        } else {
            self.head = Some(sequence_id);
            self.passes = 1;
        }
        (self.threshold > 0 && self.passes % self.threshold == 0).then_some(self.passes)
    }

    fn clear(&mut self) {
        self.head = None;
        self.passes = 0;
    }
}

struct DispatchWorker {
    lane: Lane,
    rx: Receiver<Wake>,
    shared: Arc<Shared>,
    router: Router,
    stop: Arc<AtomicBool>,
    stall: StallTracker,
}

impl DispatchWorker {
    fn run(mut self) {
        debug!(lane = %self.lane, "dispatch worker started");
        while !self.stop.load(Ordering::Acquire) {
            match self.rx.recv_timeout(self.shared.poll_interval) {
                Ok(Wake::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(_) => {
                    // One pass serves every queued wake.
                    if self.rx.try_iter().any(|wake| wake == Wake::Shutdown) {
                        break;
                    }
                    self.pass();
                }
                Err(RecvTimeoutError::Timeout) => self.pass(),
            }
        }
        debug!(lane = %self.lane, "dispatch worker stopped");
    }

    fn pass(&mut self) {
        let snapshot = self.shared.store.sequencer().snapshot();
        for sequence_id in snapshot {
            match self.step(sequence_id) {
                Step::Delivered | Step::Skip => continue,
                Step::Blocked(reason) => {
                    trace!(lane = %self.lane, sequence_id = %sequence_id, reason, "lane blocked");
                    if let Some(passes) = self.stall.blocked(sequence_id) {
                        self.report_stall(sequence_id, passes);
                    }
                    return;
                }
            }
        }
        self.stall.clear();
    }

    fn step(&mut self, sequence_id: SequenceId) -> Step {
        if let Lane::Stream(stream_id) = self.lane {
            if let Some(mark) = self.shared.watermarks.get(stream_id) {
                if sequence_id <= mark {
                    return Step::Skip;
                }
            }
        }

        // Reclaimed or flushed since the snapshot was taken.
        let Some(request) = self.shared.store.get(sequence_id) else {
            return Step::Skip;
        };

        match request.take(self.lane) {
            Gate::Skip => Step::Skip,
            Gate::Blocked(reason) => Step::Blocked(reason),
            Gate::Ready(key, event) => {
                self.deliver(&request, key, event);
                self.stall.clear();
                Step::Delivered
            }
        }
    }

    fn deliver(&self, request: &Request, key: ResultKey, event: ResultEvent) {
        let sequence_id = request.sequence_id();
        let sinks = self.shared.sinks.load();
        trace!(lane = %self.lane, sequence_id = %sequence_id, key = %key, "delivering result");

        sinks.deliver(request, &event);

        if let Err(err) = request.commit(self.lane) {
            error!(lane = %self.lane, sequence_id = %sequence_id, error = %err, "delivered result rejected by state machine");
            return;
        }

        self.shared.telemetry.record_delivery(event.kind());
        match self.lane {
            Lane::Notify => self.router.wake_gated(request),
            Lane::Stream(stream_id) => {
                if !self.shared.watermarks.advance(stream_id, sequence_id) {
                    error!(stream = %stream_id, sequence_id = %sequence_id, "stream watermark would move backwards");
                }
            }
            Lane::Partial | Lane::Final => {}
        }
        self.router.check_reclaim(sequence_id);
    }

    fn report_stall(&self, sequence_id: SequenceId, passes: u32) {
        let err = Error::StallDetected {
            lane: self.lane.to_string(),
            sequence_id,
            passes,
        };
        let head = self
            .shared
            .store
            .get(sequence_id)
            .map(|req| req.describe())
            .unwrap_or_else(|| format!("request {sequence_id} gone"));
        warn!(
            error = %err,
            head = %head,
            sequencer = %self.shared.store.sequencer().dump(),
            "delivery stalled"
        );
        self.shared.telemetry.record_stall(self.lane);
    }
}

/// Consumes "check this request" tokens and reclaims complete requests.
struct Reclaimer {
    rx: Receiver<Wake>,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
}

impl Reclaimer {
    fn run(self) {
        debug!("reclaim worker started");
        while !self.stop.load(Ordering::Acquire) {
            match self.rx.recv_timeout(self.shared.poll_interval) {
                Ok(Wake::Check(sequence_id)) => self.check(sequence_id),
                Ok(Wake::Flush) => self.sweep(),
                Ok(Wake::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        debug!("reclaim worker stopped");
    }

    fn check(&self, sequence_id: SequenceId) {
        if self.shared.store.try_reclaim(sequence_id) {
            self.shared.telemetry.record_reclaim();
        }
    }

    fn sweep(&self) {
        for sequence_id in self.shared.store.sequencer().snapshot() {
            self.check(sequence_id);
        }
    }
}

/// Worker threads of one configured stream session.
pub(crate) struct Session {
    router: Router,
    streams: Vec<StreamConfig>,
    stop: Arc<AtomicBool>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Session {
    pub(crate) fn start(shared: &Arc<Shared>, streams: &[StreamConfig]) -> Result<Self> {
        let (notify_tx, notify_rx) = flume::unbounded();
        let (partial_tx, partial_rx) = flume::unbounded();
        let (final_tx, final_rx) = flume::unbounded();
        let (reclaim_tx, reclaim_rx) = flume::unbounded();

        let mut lanes = vec![
            (Lane::Notify, notify_rx),
            (Lane::Partial, partial_rx),
            (Lane::Final, final_rx),
        ];
        let mut stream_txs = HashMap::with_capacity(streams.len());
        for stream in streams {
            let (tx, rx) = flume::unbounded();
            stream_txs.insert(stream.id, tx);
            lanes.push((Lane::Stream(stream.id), rx));
        }

        let mut session = Self {
            router: Router {
                notify: notify_tx,
                partial: partial_tx,
                final_metadata: final_tx,
                streams: Arc::new(stream_txs),
                reclaim: reclaim_tx,
            },
            streams: streams.to_vec(),
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::with_capacity(lanes.len() + 1),
        };

        for (lane, rx) in lanes {
            let worker = DispatchWorker {
                lane,
                rx,
                shared: Arc::clone(shared),
                router: session.router.clone(),
                stop: Arc::clone(&session.stop),
                stall: StallTracker::new(shared.stall_threshold),
            };
            if let Err(err) = session.spawn(lane.thread_name(), move || worker.run()) {
                session.shutdown();
                return Err(err);
            }
        }

        let reclaimer = Reclaimer {
            rx: reclaim_rx,
            shared: Arc::clone(shared),
            stop: Arc::clone(&session.stop),
        };
        if let Err(err) = session.spawn("reclaim".into(), move || reclaimer.run()) {
            session.shutdown();
            return Err(err);
        }

        debug!(workers = session.handles.len(), "callback workers started");
        Ok(session)
    }

    fn spawn(&mut self, name: String, body: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|source| Error::Spawn {
                name: name.clone(),
                source,
            })?;
        self.handles.push((name, handle));
        Ok(())
    }

    pub(crate) fn router(&self) -> &Router {
        &self.router
    }

    pub(crate) fn streams(&self) -> &[StreamConfig] {
        &self.streams
    }

    /// Stops and joins every worker. Queued wakes are dropped with the
    /// channels.
    pub(crate) fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.router.broadcast(Wake::Shutdown);
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(worker = %name, "callback worker panicked");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.shutdown();
        }
    }
}

/// Interval the workers wait on their queue before polling anyway.
pub(crate) fn poll_interval(millis: u64) -> Duration {
    Duration::from_millis(millis.max(1))
}
