//! Logging setup for termdeck binaries.
//!
//! Library crates only emit `tracing` events; binaries and tests call one of
//! the initialisers here to install a subscriber.

pub mod logging;
