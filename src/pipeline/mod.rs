pub mod result;
pub mod sequencer;
pub mod store;
pub mod watermark;
pub mod worker;

use std::time::Duration;

use arc_swap::ArcSwap;

pub use result::{
    BufferReady, BufferStatus, Metadata, NotifyError, NotifyMessage, NotifyStatus, ResultEvent,
    ResultKey, ResultKind,
};
pub use sequencer::OrderingSequencer;
pub use store::{Cleared, RequestStore};
pub use watermark::StreamWatermarks;
pub use worker::Lane;

use crate::delivery::CallbackSinks;
use crate::telemetry::Telemetry;

/// State shared by the manager and every worker thread.
pub(crate) struct Shared {
    pub(crate) store: RequestStore,
    pub(crate) sinks: ArcSwap<CallbackSinks>,
    pub(crate) watermarks: StreamWatermarks,
    pub(crate) telemetry: Telemetry,
    pub(crate) poll_interval: Duration,
    pub(crate) stall_threshold: u32,
}
