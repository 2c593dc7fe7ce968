//! # skysync testkit
//!
//! Test utilities for skysync.
//!
//! This crate provides:
//! - Schema fixtures covering plain, cyclic, cacheable and public entities
//! - A harness wiring a local store, an in-memory cloud and an engine
//! - An error sink that collects what the engine reports
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use skysync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn pushes_a_company() {
//!     let h = Harness::new(business_schema());
//!     h.insert("Company", &[("name", "Acme".into())]);
//!     h.engine.process_local_changes().await;
//!     assert_eq!(h.remote_records_of("Company").len(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod harness;
pub mod sink;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
    pub use crate::sink::*;
}

pub use fixtures::*;
pub use generators::*;
pub use harness::*;
pub use sink::*;
