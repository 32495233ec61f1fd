//! Testing utilities and mock implementations
//!
//! Lets the dispatcher be exercised without a broker or token issuer.

pub mod mocks;

pub use mocks::*;
