//! Pull-based task dispatch controller for a fleet of remote agents.
//!
//! Agents register (optionally with a registration code), wait for operator
//! approval, then heartbeat, pull their task list and report results over
//! HTTP. The controller tracks liveness, stores execution records with
//! compressed output, keeps daily counters and prunes old records.

pub mod agents;
pub mod artifacts;
pub mod clock;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod stats;
pub mod tasks;
