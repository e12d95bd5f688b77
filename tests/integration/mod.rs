//! Integration tests: engine cycles, propagation and listing ingestion
//! against an in-memory drive

mod engine_cycle;
mod executor;
mod listing_properties;
mod progress;
mod remote_observer;
mod support;
