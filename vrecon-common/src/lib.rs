//! # vrecon Common
//!
//! Shared utilities for the vrecon crates.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use vrecon_common::{init_logging, TimedOperation};
//!
//! init_logging("info").unwrap();
//!
//! let op = TimedOperation::start("delete");
//! // ...
//! op.finish();
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, is_valid_level, TimedOperation, LOG_LEVELS};
