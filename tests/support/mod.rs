//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod engine;
pub mod socket_guard;
