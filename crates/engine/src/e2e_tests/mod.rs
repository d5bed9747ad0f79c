//! End-to-end scenarios.
//!
//! Each scenario runs a full [`SyncCoordinator`](crate::SyncCoordinator)
//! against a [`FakeRemote`](crate::test_fixtures::FakeRemote) and a
//! standalone host whose main context records every invocation. Nothing
//! leaves the process; the SQLite scenarios use a temporary directory.
//!
//! ```bash
//! cargo test -p storesync-engine --lib e2e_tests
//! ```

mod harness;

mod delivery_tests;
mod failure_tests;
mod recovery_tests;

pub use harness::*;
