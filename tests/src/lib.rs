//! # Courier Test Suite
//!
//! Unified test crate for flows that cross patterns and crates.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── fixtures.rs          # Shared registries and broker setup
//!     ├── pubsub_flows.rs      # Publish/subscribe through the facade
//!     ├── request_flows.rs     # Request/reply error protocol
//!     ├── consumer_flows.rs    # Durable stream delivery and settlement
//!     └── trace_flows.rs       # One trace across producer and receivers
//!
//! tests/benches/
//! └── broker_benchmarks.rs     # Codec and validation throughput
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p courier-tests
//!
//! # By flow
//! cargo test -p courier-tests integration::request_flows::
//!
//! # Benchmarks
//! cargo bench -p courier-tests
//! ```

#![allow(dead_code)]

pub mod integration;
