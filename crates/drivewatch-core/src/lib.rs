//! # drivewatch core
//!
//! Store-agnostic coordination logic for drivewatch: the data model, the
//! lease lock guarding each channel's change-feed cursor, the change
//! ingestion engine, the document ledger traits, and the notification relay.
//!
//! This crate contains no sqlx, HTTP, or filesystem I/O. Persistent state
//! lives behind the traits in [`store`]; the `drivewatch` crate supplies SQLite
//! implementations and [`store::memory`] supplies an in-memory one for tests.
//!
//! ```text
//!  push signal ──▶ NotificationRelay ──▶ MessageQueue
//!                                            │
//!                                            ▼
//!                  IngestCoordinator ── LeaseLock (acquire)
//!                        │                    │
//!                        ▼                    ▼
//!                  IngestEngine ◀────── ChangeFeed pages
//!                        │
//!                        ▼
//!          DocumentLedger::record_if_new ──▶ PipelineDispatcher
//! ```

pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod lease;
pub mod models;
pub mod queue;
pub mod relay;
pub mod store;

pub use error::{CoordError, Result};
