//! `simbridge-runtime` – capture scheduling and pipeline lifecycle
//!
//! Turns configured streams into periodic captures, encodes them off the
//! async threads and hands them to the middleware publishers.
//!
//! # Modules
//!
//! - [`encode`] – JPEG/PNG/mono16 encoding of raw render targets via the
//!   `image` crate.
//! - [`scheduler`] – [`CaptureScheduler`]: one fixed-delay capture loop per
//!   stream that never has more than one capture in flight.
//! - [`pipeline`] – [`Pipeline`]: wires the connection, schedulers and
//!   render-target pool together and shuts them down in order.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console
//!   logging plus optional OTLP span export.

pub mod encode;
pub mod pipeline;
pub mod scheduler;
pub mod telemetry;

pub use encode::DepthOutput;
pub use pipeline::{Collaborators, Pipeline, PipelineConfig, PipelineReport, StreamReport};
pub use scheduler::{
    CameraMount, CaptureContext, CaptureScheduler, StreamConfig, StreamKind, StreamStats,
};
