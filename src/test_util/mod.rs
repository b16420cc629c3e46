//! This module contains utilities for testing code based on non-breaking connections: an in-memory
//!  network whose physical links can be killed at will, and agents exchanging random data over it.
//!  They are used for testing the session layer itself, but they are also exported for application
//!  testing, which is why they are part of the crate's regular (non-#[cfg(test)]) code.

pub mod agent;
pub mod flaky_network;
