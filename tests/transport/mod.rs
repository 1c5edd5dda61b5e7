//! Shared stream transport integration tests.
//!
//! Tests the StreamTransport interface against all implementations.
//! Each backend test binary imports these test functions and runs them.

pub mod stream_transport_tests;
