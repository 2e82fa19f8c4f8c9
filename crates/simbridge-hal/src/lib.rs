//! `simbridge-hal` – Simulator Abstraction Layer
//!
//! The simulator's renderer and scene graph are external collaborators; this
//! crate defines the seams they plug into and ships simulated stand-ins.
//!
//! # Modules
//!
//! - [`source`] – [`FrameSource`] and [`SceneSource`] traits: raw pixel buffers
//!   and object positions on demand.
//! - [`render_pool`] – [`RenderTargetPool`]: free-list of reusable pixel
//!   buffers keyed by size and format.
//! - [`sim`] – [`SimFrameSource`][sim::SimFrameSource] and
//!   [`SimScene`][sim::SimScene] for headless runs and tests.

pub mod render_pool;
pub mod sim;
pub mod source;

pub use render_pool::{PoolStats, RenderTargetPool};
pub use source::{FrameSource, SceneObject, SceneSource};
