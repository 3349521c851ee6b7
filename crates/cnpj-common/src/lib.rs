//! CNPJ Common Library
//!
//! Shared utilities and error handling for the CNPJ pipeline workspace.
//!
//! # Overview
//!
//! - **Error Handling**: Common error type and result alias
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//! - **Units**: Human-readable byte sizes, both directions
//!
//! # Example
//!
//! ```
//! use cnpj_common::units::{format_bytes, parse_size};
//! use cnpj_common::Result;
//!
//! fn describe(listed: &str) -> Result<String> {
//!     let bytes = parse_size(listed)?;
//!     Ok(format_bytes(bytes))
//! }
//!
//! assert_eq!(describe("12K").unwrap(), "12.00 KB");
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod units;

// Re-export commonly used types
pub use error::{CommonError, Result};
