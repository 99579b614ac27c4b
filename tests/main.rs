//! Integration tests for probixel.
//!
//! One test binary; modules mirror the source tree. Everything runs
//! against in-process listeners on 127.0.0.1; no external network.

mod common;
mod config;
mod core;
