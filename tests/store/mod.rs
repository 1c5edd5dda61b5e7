//! Shared version store integration tests.
//!
//! Tests the EventStore interface against all implementations.
//! Each backend test binary imports these test functions and runs them.

pub mod event_store_tests;
