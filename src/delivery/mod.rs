pub mod sinks;

pub use sinks::{CallbackSinks, FinalResult};
