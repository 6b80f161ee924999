//! # drivewatch
//!
//! Change-ingestion coordination for watched Drive folders.
//!
//! Drive pushes a bodiless signal to the webhook whenever a watched folder
//! changes. drivewatch turns that stream of signals into exactly one
//! pipeline execution per new file, even with many stateless workers
//! running concurrently:
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────────┐   ┌─────────────┐
//! │  Drive   │──▶│ dwatch serve │──▶│ notifications │──▶│ dwatch work │
//! │  push    │   │  (webhook)   │   │    queue      │   │notifications│
//! └──────────┘   └──────────────┘   └───────────────┘   └──────┬──────┘
//!                                                              │ lease + change feed
//!                                                              ▼
//!                ┌─────────────┐   ┌───────────────┐   ┌─────────────┐
//!                │ dwatch work │◀──│   pipeline    │◀──│  document   │
//!                │  pipeline   │   │    queue      │   │   ledger    │
//!                └─────────────┘   └───────────────┘   └─────────────┘
//! ```
//!
//! The coordination logic itself lives in `drivewatch-core`; this crate
//! supplies the SQLite store and queue, the Drive client, the HTTP server,
//! the pipeline stages, and the `dwatch` CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | Channel registry, leases, document ledger on SQLite |
//! | [`sqlite_queue`] | Named durable queues with visibility timeouts |
//! | [`drive`] | Drive REST client (changes, watch, files) |
//! | [`server`] | Webhook HTTP server |
//! | [`register`] | Channel registration, renewal, sweep |
//! | [`workflow`] | Workflow starters (local queue or HTTP) |
//! | [`worker`] | Queue consumers |
//! | [`pipeline`] | Per-document processing stages |
//! | [`blob`] | Stage artifact storage |
//! | [`status`] | Operator views |

pub mod blob;
pub mod config;
pub mod db;
pub mod drive;
pub mod migrate;
pub mod pipeline;
pub mod register;
pub mod server;
pub mod sqlite_queue;
pub mod sqlite_store;
pub mod status;
pub mod token;
pub mod worker;
pub mod workflow;
