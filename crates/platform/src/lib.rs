//! # Oakley Platform
//!
//! Core platform types and collaborator traits for the Oakley IKEv1 engine.
//!
//! This crate provides:
//! - Unified error types (`OakleyError`, `OakleyResult`)
//! - Collaborator traits the protocol core consumes but does not implement
//!   (`DhBackend`, `SigBackend`, `IpsecInstaller`, `EventSink`)
//!
//! # Examples
//!
//! ```
//! use oakley_platform::{OakleyError, OakleyResult};
//!
//! fn example_function() -> OakleyResult<String> {
//!     Ok("Hello, Oakley!".to_string())
//! }
//!
//! # fn main() -> OakleyResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Oakley!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{OakleyError, OakleyResult};
pub use traits::{
    ChildSaInstall, DhBackend, DhOutcome, EventSink, IpsecInstaller, SigBackend, SigOutcome,
    VerifyOutcome,
};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
