//! Exit codes for the CLI

/// Success, including runs with nothing to publish
pub const SUCCESS: u8 = 0;

/// Any error, including packages that failed to publish
pub const ERROR: u8 = 1;
