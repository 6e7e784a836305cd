pub mod consumer;
pub mod sse;

pub use consumer::{StreamConsumer, TurnEvent, TurnHandle};
pub use sse::{classify_line, LineDecoder, StreamEvent};
