use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::capture::state::{Milestone, Progress, RequestState, TransitionError};
use crate::capture::{StreamBuffer, StreamId};
use crate::error::{Error, Result};
use crate::pipeline::result::{NotifyError, ResultEvent, ResultKey};
use crate::pipeline::worker::Lane;

/// Internal, monotonically increasing request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceId(pub u64);

impl SequenceId {
    /// `None` once the id space is exhausted.
    pub fn checked_next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque capture settings blob carried per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings(Bytes);

impl Settings {
    pub fn new(blob: impl Into<Bytes>) -> Self {
        Self(blob.into())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Client-issued unit of capture work, as handed to `enqueue`.
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    /// Externally chosen id; assigned by the store when absent.
    pub sequence_id: Option<SequenceId>,
    /// Inherited from the previous request when absent.
    pub settings: Option<Settings>,
    pub outputs: Vec<StreamBuffer>,
    /// Reprocessing input, returned with the final result.
    pub input: Option<StreamBuffer>,
}

impl CaptureRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sequence_id(mut self, sequence_id: SequenceId) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_output(mut self, output: StreamBuffer) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_input(mut self, input: StreamBuffer) -> Self {
        self.input = Some(input);
        self
    }
}

/// Owned copy of a request handed to the pipeline by `dispatch_next`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedRequest {
    pub sequence_id: SequenceId,
    pub settings: Settings,
    pub outputs: Vec<StreamBuffer>,
    pub input: Option<StreamBuffer>,
}

/// Outcome of asking a request whether a lane may deliver.
#[derive(Debug)]
pub(crate) enum Gate {
    /// Nothing to do for this lane on this request.
    Skip,
    /// Head-of-line: this lane must wait on this request.
    Blocked(&'static str),
    Ready(ResultKey, ResultEvent),
}

struct RequestInner {
    pending_results: BTreeMap<ResultKey, ResultEvent>,
    progress: Progress,
    /// Lanes whose event has been taken for delivery.
    taken: HashSet<Lane>,
}

/// A request owned by the store while it is in flight.
pub struct Request {
    sequence_id: SequenceId,
    settings: Settings,
    outputs: Vec<StreamBuffer>,
    input: Option<StreamBuffer>,
    pipeline_depth: AtomicU32,
    inner: Mutex<RequestInner>,
}

impl Request {
    pub(crate) fn new(
        sequence_id: SequenceId,
        settings: Settings,
        outputs: Vec<StreamBuffer>,
        input: Option<StreamBuffer>,
    ) -> Self {
        let expected = outputs.len() as u32;
        Self {
            sequence_id,
            settings,
            outputs,
            input,
            pipeline_depth: AtomicU32::new(0),
            inner: Mutex::new(RequestInner {
                pending_results: BTreeMap::new(),
                progress: Progress::new(expected),
                taken: HashSet::new(),
            }),
        }
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn outputs(&self) -> &[StreamBuffer] {
        &self.outputs
    }

    pub fn output_stream_ids(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.outputs.iter().map(|out| out.stream_id)
    }

    pub fn input_buffer(&self) -> Option<StreamBuffer> {
        self.input
    }

    pub fn targets(&self, stream_id: StreamId) -> bool {
        self.outputs.iter().any(|out| out.stream_id == stream_id)
    }

    pub fn expected_buffer_count(&self) -> u32 {
        self.outputs.len() as u32
    }

    pub fn pipeline_depth(&self) -> u32 {
        self.pipeline_depth.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RequestState {
        self.inner.lock().progress.state()
    }

    pub fn progress(&self) -> Progress {
        self.inner.lock().progress.clone()
    }

    pub fn pending_result_count(&self) -> usize {
        self.inner.lock().pending_results.len()
    }

    pub fn describe(&self) -> String {
        let inner = self.inner.lock();
        format!(
            "request {} depth={} staged={} {}",
            self.sequence_id,
            self.pipeline_depth(),
            inner.pending_results.len(),
            inner.progress
        )
    }

    pub(crate) fn snapshot(&self) -> DispatchedRequest {
        DispatchedRequest {
            sequence_id: self.sequence_id,
            settings: self.settings.clone(),
            outputs: self.outputs.clone(),
            input: self.input,
        }
    }

    pub(crate) fn increase_pipeline_depth(&self) {
        self.pipeline_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_dispatched(&self) -> std::result::Result<(), TransitionError> {
        self.inner.lock().progress.apply(Milestone::Dispatch).map(|_| ())
    }

    /// Stages an event until its lane delivers it. Duplicates and events the
    /// request does not expect are rejected as stale.
    pub(crate) fn stage(&self, key: ResultKey, event: ResultEvent) -> Result<()> {
        let kind = event.kind();
        let stale = |reason: &str| Error::StaleEvent {
            sequence_id: self.sequence_id,
            kind,
            reason: reason.to_string(),
        };

        if let Some(stream_id) = event.stream_id() {
            if !self.targets(stream_id) {
                return Err(stale(&format!("stream {stream_id} is not an output of this request")));
            }
        }

        let lane = Lane::of(&event);
        let mut inner = self.inner.lock();
        if inner.progress.state() == RequestState::Reclaimed {
            return Err(stale("request already reclaimed"));
        }
        if inner.taken.contains(&lane) {
            return Err(stale("result already delivered"));
        }
        if inner
            .pending_results
            .values()
            .any(|staged| Lane::of(staged) == lane)
        {
            return Err(stale("result already staged"));
        }

        inner.pending_results.insert(key, event);
        Ok(())
    }

    pub(crate) fn take(&self, lane: Lane) -> Gate {
        if let Lane::Stream(stream_id) = lane {
            if !self.targets(stream_id) {
                return Gate::Skip;
            }
        }

        let mut inner = self.inner.lock();
        if inner.taken.contains(&lane) {
            return Gate::Skip;
        }
        match lane {
            Lane::Notify if inner.progress.state() == RequestState::Pending => {
                return Gate::Blocked("not dispatched");
            }
            Lane::Notify => {}
            _ if !inner.progress.notify_done() => return Gate::Blocked("waiting for shutter"),
            _ => {}
        }

        let key = inner
            .pending_results
            .iter()
            .find(|(_, event)| Lane::of(event) == lane)
            .map(|(key, _)| *key);
        match key.and_then(|key| inner.pending_results.remove(&key).map(|event| (key, event))) {
            Some((key, event)) => {
                inner.taken.insert(lane);
                Gate::Ready(key, event)
            }
            None => Gate::Blocked(lane.waiting_reason()),
        }
    }

    /// Records a delivered result once the client callback has returned.
    pub(crate) fn commit(&self, lane: Lane) -> std::result::Result<RequestState, TransitionError> {
        self.inner.lock().progress.apply(lane.kind().milestone())
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.inner.lock().progress.is_complete()
    }

    pub(crate) fn mark_reclaimed(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.progress.apply(Milestone::Reclaim).is_err() {
            return Err(Error::Incomplete {
                sequence_id: self.sequence_id,
                flags: inner.progress.to_string(),
            });
        }
        inner.pending_results.clear();
        Ok(())
    }

    /// Drops staged events and returns one error completion per lane that
    /// has not been taken yet, shutter first. The notify error reports a
    /// failed result once any metadata or buffer went out, otherwise a
    /// failed request.
    pub(crate) fn abort(&self) -> Vec<ResultEvent> {
        let sequence_id = self.sequence_id;
        let mut inner = self.inner.lock();
        inner.pending_results.clear();

        let mut events = Vec::new();
        if inner.taken.insert(Lane::Notify) {
            let partly_delivered = inner
                .taken
                .iter()
                .any(|lane| matches!(lane, Lane::Partial | Lane::Stream(_)));
            let code = if partly_delivered {
                NotifyError::Result
            } else {
                NotifyError::Request
            };
            events.push(ResultEvent::error(sequence_id, code, 0));
        }
        if inner.taken.insert(Lane::Partial) {
            events.push(ResultEvent::partial(sequence_id, Bytes::new()));
        }
        if inner.taken.insert(Lane::Final) {
            events.push(ResultEvent::final_metadata(sequence_id, Bytes::new()));
        }
        for out in &self.outputs {
            if inner.taken.insert(Lane::Stream(out.stream_id)) {
                events.push(ResultEvent::failed_buffer(sequence_id, out.stream_id, out.buffer));
            }
        }
        events
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("sequence_id", &self.sequence_id)
            .field("outputs", &self.outputs)
            .field("state", &self.state())
            .finish()
    }
}
