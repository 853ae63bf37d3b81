//! InfluxDB v1 sink client for opflux.
//!
//! [`line`] renders core batches into Line Protocol text; [`client`] ships
//! them over HTTP (`/write`) and runs database-creation statements
//! (`/query`), implementing the core [`SinkClient`](opflux_core::SinkClient)
//! contract.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod client;
pub mod line;

pub use client::{InfluxClient, InfluxSettings};
