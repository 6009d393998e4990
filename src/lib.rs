//! Race strategy aggregator library.
//!
//! Subscribes to the overtake, tire-cliff and undercut telemetry WebSocket
//! streams, keeps the latest value of each, and requests a pit strategy from
//! an HTTP endpoint whenever all three revisions line up on a multiple of the
//! configured period.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod presentation;
pub mod source;
pub mod strategy;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;
