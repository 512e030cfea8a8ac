#![forbid(unsafe_code)]

//! Streaming retrieval gateway: `GET /retrieve?url=&format=` runs one
//! extractor process per request and relays its stdout as the response body.

pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod format;
pub mod process;
pub mod relay;
pub mod security;
pub mod telemetry;
