// SPDX-License-Identifier: MPL-2.0
//! # revmachine
//!
//! Storage and reconstruction engine for diff-encoded Wikipedia revision histories.
//!
//! ## Overview
//!
//! Storing every revision of a Wikipedia article as full text is wasteful: consecutive revisions
//! differ by a few characters. `revmachine` stores an article's history as *runs*. Each run starts
//! with one full revision and continues with compact encoded diffs, each against the text of the
//! row before it. Three index tables resolve a revision by its global id, by its position in the
//! article's history, or by a point in time, to the run holding it and the number of rows that
//! have to be replayed.
//!
//! **Key Features:**
//!
//! - **Lazy reconstruction**: lookups load metadata only. The text is rebuilt on first access and
//!   shared afterwards, also between threads.
//! - **Compatible storage format**: the bit-packed diff encoding and the space separated index
//!   columns are read and written exactly as they appear in existing databases.
//! - **Chronological order**: revisions stored out of timestamp order are still numbered and
//!   searched chronologically.
//! - **Typed row store**: all lookups go through the [`store::RowStore`] trait. A SQLite
//!   implementation is included.
//!
//! ## Getting Started
//!
//! ### Storing and reading a history
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use revmachine::{
//!     api::RevisionApi,
//!     codec::Charset,
//!     encoder::RevisionEncoder,
//!     ingest::{ArticleHistory, ChainWriter, RevisionRecord},
//!     revision::Contributor,
//!     sqlite::SqliteStore,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SqliteStore::open_in_memory()?;
//!
//!     let record = |id: i64, day: u32, text: &str| RevisionRecord {
//!         id,
//!         timestamp: Utc.with_ymd_and_hms(2006, 1, day, 12, 0, 0).unwrap(),
//!         contributor: Contributor::default(),
//!         comment: None,
//!         minor: false,
//!         text: text.to_string(),
//!     };
//!     let history = ArticleHistory {
//!         article_id: 12,
//!         revisions: vec![record(1, 2, "Hello"), record(2, 3, "Hello, world")],
//!     };
//!     ChainWriter::with_settings(&store, RevisionEncoder::new(Charset::Utf8), true, 1000)
//!         .write_article(&history)?;
//!
//!     let api = RevisionApi::new(store);
//!     let revision = api.get_revision_by_counter(12, 2)?;
//!     assert_eq!(revision.id, 2);
//!     assert_eq!(revision.text()?, "Hello, world");
//!
//!     let at_noon = api.get_revision_at(12, Utc.with_ymd_and_hms(2006, 1, 2, 18, 0, 0).unwrap())?;
//!     assert_eq!(at_noon.text()?, "Hello");
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Telling "not found" from failures
//!
//! Every lookup returns a [`RevisionError`]. Missing revisions and articles are reported through
//! dedicated variants (see [`RevisionError::is_not_found`]); non-positive ids and counters are
//! rejected before the store is queried.
//!
//! ```rust
//! use revmachine::{api::RevisionApi, sqlite::SqliteStore, RevisionError};
//!
//! let api = RevisionApi::new(SqliteStore::open_in_memory().unwrap());
//! assert!(matches!(api.get_revision(0), Err(RevisionError::InvalidArgument { .. })));
//! assert!(api.get_revision(999_999_999).unwrap_err().is_not_found());
//! ```
//!
//! ## Modules and API
//!
//! - [`diff`]: the edit model. A [`diff::Diff`] is an ordered list of [`diff::DiffPart`]s.
//! - [`codec`], [`decoder`], [`encoder`]: the bit-packed storage format of diffs.
//! - [`reconstruction`]: replays chains of diffs into texts.
//! - [`index`]: resolves ids, counters and timestamps to chain locations.
//! - [`api`]: [`api::RevisionApi`], the query surface returning lazy [`Revision`]s.
//! - [`ingest`]: [`ingest::ChainWriter`], which stores histories as runs and writes their index rows.
//! - [`store`], [`sqlite`]: the row store abstraction and its SQLite implementation.
//!
//! ## Offsets
//!
//! Offsets inside a diff count `char`s, not bytes, and are cumulative: every part addresses the
//! text as left behind by the parts before it. An offset outside the current text is a corrupt
//! chain and reported as [`codec::DecodingError::OffsetOutOfRange`]; it is never clamped.
//!
//! ## Features and Configuration
//!
//! Settings (charset, column kind, compression, run length, reconnect attempts) are read from
//! TOML, see [`config::Config`].
//!
//! Enable the `strict` feature to reject encoded diffs with trailing data after the end marker.
//! By default such data is logged and ignored.
//!
//! ```toml
//! [dependencies]
//! revmachine = { version = "0.1.0", features = ["strict"] }
//! ```
//!
//! ### Logging
//!
//! - Uses the `tracing` crate: `debug` for replayed chains, `warn` for reconnects and lenient
//!   decoding.
//! - The library never installs a subscriber.

pub mod api;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod diff;
pub mod diff_calculator;
pub mod encoder;
pub mod error;
pub mod index;
pub mod ingest;
pub mod maintenance;
pub mod reconstruction;
pub mod retry;
pub mod revision;
pub mod sqlite;
pub mod store;

pub use api::RevisionApi;
pub use error::RevisionError;
pub use revision::{Revision, RevisionMetadata};

#[cfg(test)]
mod test_support;
