pub mod catalog;
pub mod core;
pub mod worker;

pub use catalog::CatalogEntry;
pub use core::{Store, StoreConfig};
pub use worker::{SortMsg, Storage};
