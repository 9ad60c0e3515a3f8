//! Data-plane client for Bigtable.
//!
//! A [`client::BigtableClient`] owns a channel pool and vends per-table
//! handles. All reads go through the streaming [`client::Table::read_rows`]
//! engine (chunk reassembly plus resumable retry); writes go through
//! [`client::Table::apply`] / [`client::Table::apply_bulk`], which share the
//! same retry policy and idempotency classification.
//!
//! The gRPC endpoint comes from the settings DSN
//! (e.g. `grpc://bigtable.googleapis.com:443`). Google default credentials
//! (`GOOGLE_APPLICATION_CREDENTIALS`) are attached automatically unless the
//! DSN points at localhost or `BIGTABLE_EMULATOR_HOST` is set.

#[macro_use]
extern crate slog;
#[macro_use]
extern crate slog_scope;

pub mod bulk;
pub mod cell;
pub mod client;
pub mod error;
pub mod logging;
mod merge;
pub mod mutation;
mod pool;
pub mod read;
pub mod retry;
pub mod row;
pub mod rows;
pub mod settings;

/// Row keys are uninterpreted byte strings, ordered lexicographically. The
/// empty key is reserved as the "unbounded" sentinel in ranges.
pub type RowKey = Vec<u8>;
/// A "qualifier" is a free-form column name within a family.
pub type Qualifier = Vec<u8>;
// This must be a String.
pub type FamilyId = String;

pub use crate::bulk::BulkOptions;
pub use crate::cell::Cell;
pub use crate::client::{BigtableClient, Table};
pub use crate::error::{BigtableError, BigtableResult};
pub use crate::mutation::{Mutation, ReadModifyWrite, Timestamp};
pub use crate::read::{FullReadStats, ReadOptions};
pub use crate::row::Row;
pub use crate::rows::{Bound, RowRange, RowSet};
pub use crate::settings::BigtableDbSettings;

// Row filters are built with the generated proto type, re-exported here so
// callers don't need to depend on the raw crate.
pub use google_cloud_rust_raw::bigtable::v2::data::RowFilter;
