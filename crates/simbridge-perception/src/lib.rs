//! `simbridge-perception` – scene geometry.
//!
//! Turns object and camera poses into the per-camera distances carried by
//! `ObjectInfo` messages.
//!
//! # Modules
//!
//! - [`transform`] – [`Vec3`][transform::Vec3], [`Quaternion`][transform::Quaternion]
//!   and [`Pose`][transform::Pose] math plus
//!   [`camera_distances`][transform::camera_distances].

pub mod transform;

pub use transform::{DistanceMode, Pose, Quaternion, Vec3, camera_distances};
