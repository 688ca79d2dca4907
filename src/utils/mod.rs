//! Utility types and functions used throughout the crate.
//!
//! # Contents
//!
//! - [`UniqueId`]: Process-wide unique, non-zero identifiers
//! - [`panic_message`]: Readable description of a panic payload
//! - [`measure_fn`]: Wall-clock timing of a closure

mod measure;
mod panic;
mod unique;

pub(crate) use self::measure::measure_fn;
pub(crate) use self::panic::panic_message;
pub(crate) use self::unique::UniqueId;
