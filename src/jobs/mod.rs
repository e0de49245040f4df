//! Jobs module - HTTP surface over the merge pipeline.
//!
//! - `models` - request and response bodies
//! - `multipart_parser` - upload parsing with size limits
//! - `registry` - in-flight and finished jobs, progress fan-out
//! - `runner` - background execution of a run
//! - `handlers` - actix-web handlers and route registration

pub mod handlers;
pub mod models;
pub mod multipart_parser;
pub mod registry;
pub mod runner;

pub use registry::{Job, JobEvent, JobRegistry};
