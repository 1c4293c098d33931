//! Integration tests for Camrec
//!
//! Exercise recording sessions, the pre-record buffer and real transcoder
//! processes together through the public API.

#[path = "integration/common.rs"]
mod common;

#[path = "integration/prebuffer_replay.rs"]
mod prebuffer_replay;
#[path = "integration/process_pipeline.rs"]
mod process_pipeline;
#[path = "integration/sessions.rs"]
mod sessions;
