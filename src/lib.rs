//! Client core for a streaming chat backend.
//!
//! [`StreamConsumer`] drives one turn at a time: it posts the prompt to the
//! streaming endpoint, turns the incremental body into [`TurnEvent`]s and falls
//! back to the plain request/response endpoint when streaming is unavailable.
//! [`markup::parse`] turns the (possibly still growing) reply text into
//! segments for display.

pub mod api;
pub mod config;
pub mod errors;
pub mod markup;
pub mod models;
pub mod stream;

pub use api::ApiClient;
pub use config::ClientConfig;
pub use errors::ChatError;
pub use markup::{parse, Segment, StreamingMarkup};
pub use models::{ChatTurn, Delivery, TurnStatus};
pub use stream::{StreamConsumer, TurnEvent, TurnHandle};
