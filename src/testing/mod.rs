//! Testing utilities and mock implementations
//!
//! Mocks for exercising the connector and HTTP routes without a broker.

pub mod mocks;

pub use mocks::*;
