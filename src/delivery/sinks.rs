//! Client callback sinks, one per result kind.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::capture::{Request, SequenceId, StreamBuffer};
use crate::pipeline::result::{BufferReady, Metadata, NotifyMessage, ResultEvent};

/// Final metadata as handed to the client, together with the request's
/// pipeline depth and its reprocessing input buffer, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalResult {
    pub sequence_id: SequenceId,
    pub fields: Bytes,
    pub pipeline_depth: u32,
    pub input_buffer: Option<StreamBuffer>,
}

type NotifyFn = dyn Fn(&Request, &NotifyMessage) + Send + Sync;
type BufferFn = dyn Fn(&Request, &BufferReady) + Send + Sync;
type PartialFn = dyn Fn(&Request, &Metadata) + Send + Sync;
type FinalFn = dyn Fn(&Request, &FinalResult) + Send + Sync;
type DeviceErrorFn = dyn Fn() + Send + Sync;

/// Callbacks invoked by the dispatch workers. No internal lock is held while
/// a callback runs, so a callback may call back into the manager.
///
/// Sinks that are not set only trace the result.
#[derive(Clone)]
pub struct CallbackSinks {
    notify: Arc<NotifyFn>,
    buffer: Arc<BufferFn>,
    partial: Arc<PartialFn>,
    final_result: Arc<FinalFn>,
    device_error: Arc<DeviceErrorFn>,
}

impl Default for CallbackSinks {
    fn default() -> Self {
        Self {
            notify: Arc::new(|_: &Request, msg: &NotifyMessage| {
                trace!(sequence_id = %msg.sequence_id, "notify dropped, no sink")
            }),
            buffer: Arc::new(|_: &Request, buf: &BufferReady| {
                trace!(sequence_id = %buf.sequence_id, "buffer dropped, no sink")
            }),
            partial: Arc::new(|_: &Request, meta: &Metadata| {
                trace!(sequence_id = %meta.sequence_id, "partial result dropped, no sink")
            }),
            final_result: Arc::new(|_: &Request, res: &FinalResult| {
                trace!(sequence_id = %res.sequence_id, "final result dropped, no sink")
            }),
            device_error: Arc::new(|| trace!("device error dropped, no sink")),
        }
    }
}

impl CallbackSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_notify(mut self, f: impl Fn(&Request, &NotifyMessage) + Send + Sync + 'static) -> Self {
        self.notify = Arc::new(f);
        self
    }

    pub fn on_buffer(mut self, f: impl Fn(&Request, &BufferReady) + Send + Sync + 'static) -> Self {
        self.buffer = Arc::new(f);
        self
    }

    pub fn on_partial_metadata(
        mut self,
        f: impl Fn(&Request, &Metadata) + Send + Sync + 'static,
    ) -> Self {
        self.partial = Arc::new(f);
        self
    }

    pub fn on_final_metadata(
        mut self,
        f: impl Fn(&Request, &FinalResult) + Send + Sync + 'static,
    ) -> Self {
        self.final_result = Arc::new(f);
        self
    }

    /// Called once per device error. Not tied to any request.
    pub fn on_device_error(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.device_error = Arc::new(f);
        self
    }

    /// Routes `event` to the sink of its kind. Final metadata is wrapped
    /// with the request's pipeline depth and input buffer.
    pub(crate) fn deliver(&self, request: &Request, event: &ResultEvent) {
        match event {
            ResultEvent::Notify(msg) => self.notify(request, msg),
            ResultEvent::BufferReady(buf) => self.buffer(request, buf),
            ResultEvent::PartialMetadata(meta) => self.partial_metadata(request, meta),
            ResultEvent::FinalMetadata(meta) => {
                let result = FinalResult {
                    sequence_id: meta.sequence_id,
                    fields: meta.fields.clone(),
                    pipeline_depth: request.pipeline_depth(),
                    input_buffer: request.input_buffer(),
                };
                self.final_result(request, &result);
            }
        }
    }

    pub(crate) fn device_error(&self) {
        (self.device_error)()
    }

    pub(crate) fn notify(&self, request: &Request, msg: &NotifyMessage) {
        (self.notify)(request, msg)
    }

    pub(crate) fn buffer(&self, request: &Request, buf: &BufferReady) {
        (self.buffer)(request, buf)
    }

    pub(crate) fn partial_metadata(&self, request: &Request, meta: &Metadata) {
        (self.partial)(request, meta)
    }

    pub(crate) fn final_result(&self, request: &Request, result: &FinalResult) {
        (self.final_result)(request, result)
    }
}

impl fmt::Debug for CallbackSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSinks").finish_non_exhaustive()
    }
}
