//! Code generator for the edge-edge continuous-collision volume functional.
//!
//! The volume of an edge pair is derived symbolically for a fixed 4-point
//! stencil and emitted as flat C99 scalar statements in two flavors: a value
//! body reading velocities through `double[2]` parameters, and a gradient
//! body reading them as separate `x`/`y` scalars. See `derive_volume_code`.

pub mod codegen;
pub mod compiler;

pub use codegen::{derive_volume_code, LowerError, VolumeCode};
