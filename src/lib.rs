//! TRADEFLOOR: Miniature Exchange with Autonomous Trading Agents
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod api;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod strategy;
pub mod types;
