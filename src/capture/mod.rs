pub mod request;
pub mod state;
pub mod stream;

pub use request::{CaptureRequest, DispatchedRequest, Request, SequenceId, Settings};
pub use state::{Milestone, Progress, RequestState};
pub use stream::{BufferHandle, StreamBuffer, StreamClass, StreamConfig, StreamId};
