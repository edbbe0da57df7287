use thiserror::Error;

use crate::capture::state::TransitionError;
use crate::capture::{SequenceId, StreamId};
use crate::pipeline::result::ResultKind;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the request manager.
///
/// Errors raised inside dispatch workers never reach the client; they are
/// logged and the offending event is dropped or retried on the next pass.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no pending request to dispatch")]
    Empty,

    #[error("request {0} is not in flight")]
    NotFound(SequenceId),

    #[error("stale {kind} event for request {sequence_id}: {reason}")]
    StaleEvent {
        sequence_id: SequenceId,
        kind: ResultKind,
        reason: String,
    },

    #[error("{lane} delivery stalled on request {sequence_id} for {passes} passes")]
    StallDetected {
        lane: String,
        sequence_id: SequenceId,
        passes: u32,
    },

    #[error("request {sequence_id} is not complete: {flags}")]
    Incomplete {
        sequence_id: SequenceId,
        flags: String,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("manager is flushing, new requests are rejected")]
    Flushing,

    #[error("no stream configuration is active")]
    NotConfigured,

    #[error("stream configuration: {0}")]
    StreamConfig(String),

    #[error("stream {0} is not configured")]
    UnknownStream(StreamId),

    #[error("failed to spawn worker {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}
