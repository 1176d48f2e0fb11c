pub mod man;
pub mod tree;

pub use man::{IndexDesc, IndexMan};
pub use tree::{Index, Sizing, SlotMask};
