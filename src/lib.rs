//! OVD Watchdog - rule-driven incident detection over tracked video objects.
//!
//! # Overview
//!
//! Per-frame track updates from an upstream tracker are matched against
//! operator rules. A (track, rule) pair that stays eligible for the rule's
//! dwell period becomes a tentative incident and is confirmed on the next
//! eligible frame. Confirmed incidents get time-windowed evidence (snapshot,
//! clip, metadata) cut from an in-memory ring buffer and are fanned out to
//! notification channels under per-incident cooldowns.
//!
//! # Modules
//!
//! - [`rule`]: Rule documents, validation and loading
//! - [`roi`]: Region-of-interest geometry
//! - [`engine`]: Matching, classification enrichment, dwell and incident lifecycle
//! - [`record`]: Evidence ring buffer, encoders and incident recorder
//! - [`notify`]: Notification channels, dispatcher and alert queue
//! - [`pipeline`]: The monitoring frame loop
//! - [`replay`]: Offline frame and track-log sources
//! - [`storage`]: SQLite incident journal
//! - [`api`]: Operator HTTP API
//! - [`config`]: Environment configuration

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod record;
pub mod replay;
pub mod roi;
pub mod rule;
pub mod storage;

pub use error::{Error, Result};
