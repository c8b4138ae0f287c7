//! Fixture programs and helpers for guardrun integration tests.

#![allow(missing_docs)]

pub mod helpers;

pub use helpers::*;
