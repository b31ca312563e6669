//! Transaction ingestion and decisioning core.
//!
//! An inbound transaction event is enriched, evaluated against a rule
//! catalog, scored, disposed, and persisted with a full decision trail.
//! Actionable outcomes raise alerts for analysts.

pub mod alert_workflow;
pub mod config;
pub mod decision;
pub mod disposition;
pub mod engine;
pub mod enrichment;
pub mod error;
pub mod event;
pub mod reference_data;
pub mod rng;
pub mod rule_engine;
pub mod scoring;
pub mod snapshot;
pub mod store;
pub mod types;
