//! Analytical graph/time-series database core.
//!
//! Clients issue SQL-like statements; the core parses each statement,
//! executes it against a named database ("scope") and streams framed
//! results back. The storage side turns a stream of fixed-size records
//! into a queryable, time-ordered, compressed, index-accelerated data
//! set: a memory-mapped writer file rolls into waiting files, background
//! sorters turn those into sorted (optionally ZSTD-compressed) readers,
//! and a two-level index maps composite keys to page-level bitmaps.

pub mod cursor;
pub mod errors;
pub mod expr;
pub mod filter;
pub mod fsutil;
pub mod index;
pub mod io;
pub mod ipc;
pub mod logger;
pub mod model;
pub mod plan;
pub mod procman;
pub mod reader;
pub mod scope;
pub mod session;
pub mod sort;
pub mod sql;
pub mod store;
pub mod task;
pub mod text;
pub mod time;
pub mod types;
pub mod vrow;
pub mod wire;

pub use cursor::Cursor;
pub use errors::{ErrorKind, NowError, Result};
pub use scope::Scope;
pub use session::{Library, Session};
pub use types::{Typ, Value};
