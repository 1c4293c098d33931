//! Pre-record buffering
//!
//! Keeps the last few seconds of a camera's video so a recording can start
//! before the event that triggered it.

pub mod registry;
pub mod ring;
pub mod service;

pub use registry::PreBufferRegistry;
pub use ring::{BufferedBox, Ingested, ReplaySnapshot, RetainedBoxes};
pub use service::{PreBuffer, PreBufferError, ReplayEndpoint};
