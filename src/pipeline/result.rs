//! Completion events produced by the pipeline stages.

use std::fmt;

use bytes::Bytes;

use crate::capture::state::Milestone;
use crate::capture::{BufferHandle, SequenceId, StreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKind {
    Notify,
    BufferReady,
    PartialMetadata,
    FinalMetadata,
}

impl ResultKind {
    pub const ALL: [ResultKind; 4] = [
        ResultKind::Notify,
        ResultKind::BufferReady,
        ResultKind::PartialMetadata,
        ResultKind::FinalMetadata,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ResultKind::Notify => "notify",
            ResultKind::BufferReady => "buffer",
            ResultKind::PartialMetadata => "partial",
            ResultKind::FinalMetadata => "final",
        }
    }

    pub fn milestone(self) -> Milestone {
        match self {
            ResultKind::Notify => Milestone::Notify,
            ResultKind::BufferReady => Milestone::Buffer,
            ResultKind::PartialMetadata => Milestone::PartialMetadata,
            ResultKind::FinalMetadata => Milestone::FinalMetadata,
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key under which an event is staged on its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultKey(pub u64);

impl fmt::Display for ResultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyError {
    Device,
    Request,
    Result,
    Buffer,
}

/// Shutter or error notification status. Opaque to the ordering core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyStatus {
    Shutter,
    Error(NotifyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferStatus {
    #[default]
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyMessage {
    pub sequence_id: SequenceId,
    pub status: NotifyStatus,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferReady {
    pub sequence_id: SequenceId,
    pub stream_id: StreamId,
    pub buffer: BufferHandle,
    pub status: BufferStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub sequence_id: SequenceId,
    pub fields: Bytes,
}

/// Event pushed by a pipeline stage. Each one belongs to exactly one request
/// and is consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultEvent {
    Notify(NotifyMessage),
    BufferReady(BufferReady),
    PartialMetadata(Metadata),
    FinalMetadata(Metadata),
}

impl ResultEvent {
    pub fn shutter(sequence_id: SequenceId, timestamp_ns: u64) -> Self {
        ResultEvent::Notify(NotifyMessage {
            sequence_id,
            status: NotifyStatus::Shutter,
            timestamp_ns,
        })
    }

    pub fn error(sequence_id: SequenceId, error: NotifyError, timestamp_ns: u64) -> Self {
        ResultEvent::Notify(NotifyMessage {
            sequence_id,
            status: NotifyStatus::Error(error),
            timestamp_ns,
        })
    }

    pub fn buffer(sequence_id: SequenceId, stream_id: StreamId, buffer: BufferHandle) -> Self {
        ResultEvent::BufferReady(BufferReady {
            sequence_id,
            stream_id,
            buffer,
            status: BufferStatus::Ok,
        })
    }

    pub fn failed_buffer(sequence_id: SequenceId, stream_id: StreamId, buffer: BufferHandle) -> Self {
        ResultEvent::BufferReady(BufferReady {
            sequence_id,
            stream_id,
            buffer,
            status: BufferStatus::Error,
        })
    }

    pub fn partial(sequence_id: SequenceId, fields: impl Into<Bytes>) -> Self {
        ResultEvent::PartialMetadata(Metadata {
            sequence_id,
            fields: fields.into(),
        })
    }

    pub fn final_metadata(sequence_id: SequenceId, fields: impl Into<Bytes>) -> Self {
        ResultEvent::FinalMetadata(Metadata {
            sequence_id,
            fields: fields.into(),
        })
    }

    pub fn kind(&self) -> ResultKind {
        match self {
            ResultEvent::Notify(_) => ResultKind::Notify,
            ResultEvent::BufferReady(_) => ResultKind::BufferReady,
            ResultEvent::PartialMetadata(_) => ResultKind::PartialMetadata,
            ResultEvent::FinalMetadata(_) => ResultKind::FinalMetadata,
        }
    }

    pub fn sequence_id(&self) -> SequenceId {
        match self {
            ResultEvent::Notify(msg) => msg.sequence_id,
            ResultEvent::BufferReady(buf) => buf.sequence_id,
            ResultEvent::PartialMetadata(meta) | ResultEvent::FinalMetadata(meta) => meta.sequence_id,
        }
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            ResultEvent::BufferReady(buf) => Some(buf.stream_id),
            _ => None,
        }
    }
}
