//! End-to-end tests against a file-backed SQLite ledger.
//!
//! Each test gets its own database file so that the pool can hand out
//! several connections, the way a running exchange does.

mod concurrency;
mod fixtures;
mod scenarios;
