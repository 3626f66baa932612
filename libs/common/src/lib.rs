//! Shared service plumbing for the STTP crates
//!
//! Logging bootstrap and graceful shutdown helpers used by the transport
//! engines and the CLI tools.

pub mod logging;
pub mod shutdown;
