//! Application module (C-app): ambient config and logging setup shared by
//! every CLI subcommand.
//!
//! Grounded in the teacher's `app/config.rs` + `app/logging.rs` split;
//! `runtime.rs`'s storage-migration concern has no counterpart here, so it
//! isn't carried over.

pub mod config;
pub mod error_handling;
pub mod logging;

pub use config::AppConfig;
pub use error_handling::handle_fatal_error;
pub use logging::init_logging;
