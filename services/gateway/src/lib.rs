//! Multi-protocol telematics ingestion gateway.
//!
//! Terminates raw TCP sessions from fleet GPS trackers (Ruptela
//! framed-records and Jimi/GT06 families), keeps devices reporting with the
//! protocol-mandated acknowledgements and location polling, and fans
//! validated, deduplicated fixes out to authenticated push subscribers.
//!
//! Wire-level parsing lives in the `tg-wire` crate; the push-message
//! contract in `tg-protocol`. This crate is the service glue: listeners,
//! per-connection sessions, normalization, fan-out, config, and the stats
//! endpoint.

pub mod config;
pub mod dedup;
pub mod fanout;
pub mod listener;
pub mod normalize;
pub mod poll;
pub mod registry;
pub mod session;
pub mod stats_http;
