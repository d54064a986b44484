//! Infrastructure layer for cross-cutting concerns.
//!
//! Provides error handling and result types shared by every container
//! operation.

pub mod error;
