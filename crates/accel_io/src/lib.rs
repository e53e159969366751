//! File I/O for the accelerator tools.
//!
//! Reads platform configuration files into a `PlatformConfig` and moves
//! word images (raw arrays of 32-bit integers) between files and buffers.

/// Platform configuration file parser.
///
/// Parses `key = value` files with comments, applies the `ACCEL_*`
/// environment overrides and validates the result. Every error names the
/// offending line or variable.
pub mod config;

/// Binary word image loading and saving.
///
/// Images are packed little-endian 32-bit signed integers with no header,
/// the layout the vector tools read inputs from and write results to.
pub mod loader;
