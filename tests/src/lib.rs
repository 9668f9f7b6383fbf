//! # Message Bus Test Suite
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/           # Frame codec and buffer pool throughput
//! └── src/integration/   # Whole-bus scenarios over both transports
//!     ├── scenarios.rs   # publish/subscribe, self-publish, routing, ordering
//!     ├── rpc.rs         # request/reply, fast and per-call reply, timeouts
//!     ├── transactional.rs
//!     ├── tcp_stream.rs
//!     ├── telemetry.rs   # metrics exposition, config from file
//!     └── lifecycle.rs   # open/close/abort, blocking forms, dispose
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p bus-tests
//! cargo test -p bus-tests integration::rpc
//! cargo bench -p bus-tests
//! ```

#![allow(dead_code)]

pub mod integration;
