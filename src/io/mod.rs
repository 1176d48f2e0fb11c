pub mod comp;
pub mod file;

pub use comp::{Comp, CompPool, ZSTD_LEVEL};
pub use file::{BlockHeader, File, FileState, BLOCK_HDR_SIZE, MAPSIZE};
