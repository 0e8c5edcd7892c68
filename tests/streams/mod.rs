//! Shared stream integration tests.
//!
//! Tests the StreamManager and StreamHandle contract against every backend.
//! Each backend test binary imports these functions and runs them.

pub mod handle_tests;
