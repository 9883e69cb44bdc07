#![warn(missing_docs)]
//! Tile grid storage, addressing and terrain generation.

mod cell;
mod grid;
mod storage;
mod terrain;

pub use cell::*;
pub use grid::*;
pub use storage::*;
pub use terrain::*;
