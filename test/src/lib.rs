//! Shared helpers for fenceline integration tests.

pub mod helpers;

pub use helpers::{wait_until, RecordingDevice, TestBuffer};
