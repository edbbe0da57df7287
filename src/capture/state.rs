//! Completion state machine of a single capture request.
//!
//! A request moves `Pending -> Dispatched -> NotifyDone`, then buffer and
//! metadata completion race each other until both meet in `Complete`, and
//! the reclaimer finally moves it to `Reclaimed`.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Enqueued, not yet handed to the pipeline.
    Pending,
    /// Handed to the pipeline, shutter not yet delivered.
    Dispatched,
    /// Shutter delivered; buffers and metadata outstanding.
    NotifyDone,
    /// Shutter and every output buffer delivered; metadata outstanding.
    BufferComplete,
    /// Shutter, partial and final metadata delivered; buffers outstanding.
    MetadataComplete,
    /// Every result delivered, waiting for the reclaimer.
    Complete,
    Reclaimed,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Event that advances a request's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Milestone {
    Dispatch,
    Notify,
    Buffer,
    PartialMetadata,
    FinalMetadata,
    Reclaim,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot apply {milestone:?} to a request in state {state}")]
pub struct TransitionError {
    pub state: RequestState,
    pub milestone: Milestone,
}

/// Per-request completion tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    state: RequestState,
    partial: bool,
    final_metadata: bool,
    buffers_delivered: u32,
    expected_buffers: u32,
}

impl Progress {
    pub fn new(expected_buffers: u32) -> Self {
        Self {
            state: RequestState::Pending,
            partial: false,
            final_metadata: false,
            buffers_delivered: 0,
            expected_buffers,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn notify_done(&self) -> bool {
        !matches!(self.state, RequestState::Pending | RequestState::Dispatched)
    }

    pub fn buffers_complete(&self) -> bool {
        self.buffers_delivered == self.expected_buffers
    }

    pub fn partial_done(&self) -> bool {
        self.partial
    }

    pub fn final_done(&self) -> bool {
        self.final_metadata
    }

    pub fn buffers_delivered(&self) -> u32 {
        self.buffers_delivered
    }

    pub fn expected_buffers(&self) -> u32 {
        self.expected_buffers
    }

    /// `[notify, buffers, partial, final]`
    pub fn flags(&self) -> [bool; 4] {
        [
            self.notify_done(),
            self.buffers_complete(),
            self.partial,
            self.final_metadata,
        ]
    }

    pub fn is_complete(&self) -> bool {
        self.state == RequestState::Complete
    }

    pub fn apply(&mut self, milestone: Milestone) -> Result<RequestState, TransitionError> {
        let rejected = TransitionError {
            state: self.state,
            milestone,
        };

        match milestone {
            Milestone::Dispatch => {
                if self.state != RequestState::Pending {
                    return Err(rejected);
                }
                self.state = RequestState::Dispatched;
                return Ok(self.state);
            }
            Milestone::Notify => {
                if self.state != RequestState::Dispatched {
                    return Err(rejected);
                }
            }
            Milestone::Buffer => {
                if !self.is_open() || self.buffers_complete() {
                    return Err(rejected);
                }
                self.buffers_delivered += 1;
            }
            Milestone::PartialMetadata => {
                if !self.is_open() || self.partial {
                    return Err(rejected);
                }
                self.partial = true;
            }
            Milestone::FinalMetadata => {
                if !self.is_open() || self.final_metadata {
                    return Err(rejected);
                }
                self.final_metadata = true;
            }
            Milestone::Reclaim => {
                if self.state != RequestState::Complete {
                    return Err(rejected);
                }
                self.state = RequestState::Reclaimed;
                return Ok(self.state);
            }
        }

        self.state = match (self.buffers_complete(), self.partial && self.final_metadata) {
            (true, true) => RequestState::Complete,
            (true, false) => RequestState::BufferComplete,
            (false, true) => RequestState::MetadataComplete,
            (false, false) => RequestState::NotifyDone,
        };
        Ok(self.state)
    }

    // Shutter delivered and not yet reclaimed.
    fn is_open(&self) -> bool {
        self.notify_done() && self.state != RequestState::Reclaimed
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [notify, buffers, partial, final_metadata] = self.flags();
        write!(
            f,
            "state={} notify={} buffers={}/{} ({}) partial={} final={}",
            self.state,
            notify,
            self.buffers_delivered,
            self.expected_buffers,
            buffers,
            partial,
            final_metadata
        )
    }
}
