//! Authoritative owner of every in-flight request

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::capture::{CaptureRequest, Request, SequenceId, Settings};
use crate::error::{Error, Result};
use crate::pipeline::result::{ResultEvent, ResultKey};
use crate::pipeline::sequencer::OrderingSequencer;

struct StoreInner {
    pending: VecDeque<Arc<Request>>,
    running: BTreeMap<SequenceId, Arc<Request>>,
    next_sequence: SequenceId,
    previous_settings: Option<Settings>,
    frame_counts: HashMap<u32, SequenceId>,
    accepting: bool,
}

/// Requests dropped by a forced clear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cleared {
    pub pending: Vec<SequenceId>,
    pub running: Vec<SequenceId>,
}

impl Cleared {
    pub fn total(&self) -> usize {
        self.pending.len() + self.running.len()
    }
}

/// Holds requests in two states, pending (not yet dispatched) and running,
/// and mirrors their submission order into the [`OrderingSequencer`].
///
/// The store lock is only held for the map operation itself, never while a
/// client callback runs. Lock order is store, then request, then sequencer.
pub struct RequestStore {
    inner: Mutex<StoreInner>,
    sequencer: OrderingSequencer,
    next_result_key: AtomicU64,
}

impl Default for RequestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                pending: VecDeque::new(),
                running: BTreeMap::new(),
                next_sequence: SequenceId(1),
                previous_settings: None,
                frame_counts: HashMap::new(),
                accepting: true,
            }),
            sequencer: OrderingSequencer::new(),
            next_result_key: AtomicU64::new(0),
        }
    }

    pub fn sequencer(&self) -> &OrderingSequencer {
        &self.sequencer
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.inner.lock().accepting = accepting;
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.lock().accepting
    }

    pub fn enqueue(&self, request: CaptureRequest) -> Result<SequenceId> {
        let mut inner = self.inner.lock();
        if !inner.accepting {
            return Err(Error::Flushing);
        }

        let mut seen = HashSet::with_capacity(request.outputs.len());
        for output in &request.outputs {
            if !seen.insert(output.stream_id) {
                return Err(Error::InvalidRequest(format!(
                    "stream {} is targeted more than once",
                    output.stream_id
                )));
            }
        }

        let settings = match request.settings {
            Some(settings) if settings.is_empty() => {
                return Err(Error::InvalidRequest("settings payload is empty".into()));
            }
            Some(settings) => settings,
            None => inner.previous_settings.clone().ok_or_else(|| {
                Error::InvalidRequest("no settings given and none to inherit".into())
            })?,
        };

        let sequence_id = match request.sequence_id {
            Some(id) if id < inner.next_sequence => {
                return Err(Error::InvalidRequest(format!(
                    "sequence id {id} was already issued"
                )));
            }
            Some(id) => id,
            None => inner.next_sequence,
        };

        let next_sequence = sequence_id.checked_next().ok_or_else(|| {
            Error::InvalidRequest(format!("sequence id {sequence_id} exhausts the id space"))
        })?;

        self.sequencer.append(sequence_id)?;
        inner.next_sequence = next_sequence;
        inner.previous_settings = Some(settings.clone());
        inner.pending.push_back(Arc::new(Request::new(
            sequence_id,
            settings,
            request.outputs,
            request.input,
        )));

        trace!(sequence_id = %sequence_id, pending = inner.pending.len(), "request enqueued");
        Ok(sequence_id)
    }

    /// Moves the oldest pending request to running and bumps the pipeline
    /// depth of every other running request.
    pub fn dispatch_next(&self) -> Result<Arc<Request>> {
        let mut inner = self.inner.lock();
        let request = inner.pending.pop_front().ok_or(Error::Empty)?;
        if let Err(err) = request.mark_dispatched() {
            inner.pending.push_front(request);
            return Err(err.into());
        }

        for other in inner.running.values() {
            other.increase_pipeline_depth();
        }
        inner
            .running
            .insert(request.sequence_id(), Arc::clone(&request));

        trace!(sequence_id = %request.sequence_id(), running = inner.running.len(), "request dispatched");
        Ok(request)
    }

    /// Runs `f` against a running request without holding the store lock.
    pub fn lookup<R>(&self, sequence_id: SequenceId, f: impl FnOnce(&Request) -> R) -> Result<R> {
        let request = self.running(sequence_id).ok_or(Error::NotFound(sequence_id))?;
        Ok(f(&request))
    }

    pub(crate) fn running(&self, sequence_id: SequenceId) -> Option<Arc<Request>> {
        self.inner.lock().running.get(&sequence_id).cloned()
    }

    /// Pending or running request.
    pub(crate) fn get(&self, sequence_id: SequenceId) -> Option<Arc<Request>> {
        let inner = self.inner.lock();
        inner.running.get(&sequence_id).cloned().or_else(|| {
            inner
                .pending
                .iter()
                .find(|req| req.sequence_id() == sequence_id)
                .cloned()
        })
    }

    /// Stages a pipeline event on its running request.
    pub fn stage(&self, event: ResultEvent) -> Result<(Arc<Request>, ResultKey)> {
        let sequence_id = event.sequence_id();
        let request = self.running(sequence_id).ok_or_else(|| {
            warn!(sequence_id = %sequence_id, kind = %event.kind(), "event for a request that is not running");
            Error::NotFound(sequence_id)
        })?;

        let key = ResultKey(self.next_result_key.fetch_add(1, Ordering::Relaxed));
        request.stage(key, event)?;
        Ok((request, key))
    }

    /// Reclaims a request the caller believes is complete. Anything else is
    /// an invariant violation: logged, and the store is left untouched.
    pub fn reclaim(&self, sequence_id: SequenceId) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(request) = inner.running.get(&sequence_id).cloned() else {
            error!(sequence_id = %sequence_id, "reclaim of a request that is not running");
            return Err(Error::NotFound(sequence_id));
        };
        if let Err(err) = request.mark_reclaimed() {
            error!(sequence_id = %sequence_id, error = %err, "reclaim of an incomplete request");
            return Err(err);
        }
        self.remove_locked(&mut inner, sequence_id);
        Ok(())
    }

    /// Reclaims the request if it is complete. Unknown or incomplete requests
    /// are ignored, so redundant checks are harmless.
    pub fn try_reclaim(&self, sequence_id: SequenceId) -> bool {
        let mut inner = self.inner.lock();
        let Some(request) = inner.running.get(&sequence_id).cloned() else {
            trace!(sequence_id = %sequence_id, "reclaim check for a request no longer running");
            return false;
        };
        if !request.is_complete() || request.mark_reclaimed().is_err() {
            return false;
        }
        self.remove_locked(&mut inner, sequence_id);
        true
    }

    fn remove_locked(&self, inner: &mut StoreInner, sequence_id: SequenceId) {
        inner.running.remove(&sequence_id);
        inner.frame_counts.retain(|_, bound| *bound != sequence_id);
        if !self.sequencer.remove(sequence_id) {
            warn!(sequence_id = %sequence_id, "reclaimed request was missing from the sequencer");
        }
        debug!(sequence_id = %sequence_id, running = inner.running.len(), "request reclaimed");
    }

    pub fn bind_frame_count(&self, frame_count: u32, sequence_id: SequenceId) -> Result<()> {
        let mut inner = self.inner.lock();
        let known = inner.running.contains_key(&sequence_id)
            || inner.pending.iter().any(|req| req.sequence_id() == sequence_id);
        if !known {
            return Err(Error::NotFound(sequence_id));
        }
        if let Some(bound) = inner.frame_counts.get(&frame_count) {
            return Err(Error::InvalidRequest(format!(
                "frame count {frame_count} is already bound to request {bound}"
            )));
        }
        inner.frame_counts.insert(frame_count, sequence_id);
        Ok(())
    }

    pub fn resolve_frame_count(&self, frame_count: u32) -> Option<SequenceId> {
        self.inner.lock().frame_counts.get(&frame_count).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().running.len()
    }

    pub fn running_ids(&self) -> Vec<SequenceId> {
        self.inner.lock().running.keys().copied().collect()
    }

    /// Drops every request regardless of its completion state.
    pub fn clear(&self) -> Cleared {
        let mut inner = self.inner.lock();
        let cleared = Cleared {
            pending: inner.pending.drain(..).map(|req| req.sequence_id()).collect(),
            running: std::mem::take(&mut inner.running).into_keys().collect(),
        };
        inner.frame_counts.clear();
        self.sequencer.clear();
        cleared
    }
}
