//! # dfe-harvest
//!
//! Cursor-based retrieval of fiscal documents from the national DF-e
//! distribution service, with local reconciliation of summaries, full
//! documents and lifecycle events.
//!
//! For each registered taxpayer the engine walks the authority's
//! sequence-number feed (NSU), stores every document it receives, and
//! respects the authority's rate limiting by backing off for the cool-down
//! window. A secondary path fetches full documents one access key at a time
//! to replace summaries, under its own hourly budget.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │ Distribution │──▶│  Unpack  │──▶│ Classify │──▶│  SQLite  │
//! │ SOAP / mTLS  │   │ b64+gzip │   │ FULL/SUM │   │  store   │
//! └──────▲───────┘   └──────────┘   │  /EVENT  │   └────┬─────┘
//!        │                          └──────────┘        │
//!   ┌────┴─────┐                                   ┌────┴─────┐
//!   │  Engine  │◀──────── cursor + quota ──────────│  Ledger  │
//!   └──────────┘                                   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dfe init                          # create database, register taxpayers
//! dfe sync all                      # one cycle per taxpayer
//! dfe status                        # cursors and quota blocks
//! dfe backfill 12345678000195       # promote summaries to full documents
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | NSU, access key, document and job types |
//! | [`error`] | Engine error taxonomy |
//! | [`protocol`] | Request/response codec and SOAP client |
//! | [`unpack`] | `docZip` decoding |
//! | [`classify`] | FULL / SUMMARY / EVENT classification |
//! | [`store`] | Storage trait with SQLite and in-memory backends |
//! | [`ledger`] | Cursor and quota/backoff rules |
//! | [`ratelimit`] | By-key call budget |
//! | [`backfill`] | Resumable targeted backfill jobs |
//! | [`engine`] | Sync orchestrator |
//! | [`progress`] | Progress reporting |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod backfill;
pub mod classify;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod protocol;
pub mod ratelimit;
pub mod status;
pub mod store;
pub mod sync_cmd;
pub mod unpack;
