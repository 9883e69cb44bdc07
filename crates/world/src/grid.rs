//! Dense 3D grid addressing.
//!
//! Cells are laid out row-major with X varying fastest, then Y, then Z:
//!
//! ```text
//! index = x + y * width + z * (width * depth)
//! ```
//!
//! The ordering is part of the wire contract. World chunks carry only a
//! linear start index and clients rebuild coordinates from it, so changing
//! the layout breaks compatibility with every peer.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised by grid addressing and storage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    /// A coordinate or index fell outside the grid.
    #[error("{what} is out of range for a {dims} grid")]
    OutOfRange {
        /// Description of the offending value.
        what: String,
        /// Grid the value was checked against.
        dims: GridDims,
    },
    /// Grid dimensions were zero or too large for the wire format.
    #[error("invalid grid dimensions {width}x{depth}x{height}: {reason}")]
    InvalidDimensions {
        /// Requested width.
        width: u32,
        /// Requested depth.
        depth: u32,
        /// Requested height.
        height: u32,
        /// Why the dimensions were refused.
        reason: &'static str,
    },
}

/// Grid coordinate (x along width, y along depth, z along height).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    /// Position along the width axis.
    pub x: u32,
    /// Position along the depth axis.
    pub y: u32,
    /// Position along the height axis.
    pub z: u32,
}

impl Coord {
    /// Construct a coordinate.
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Width, depth and height of a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDims")]
pub struct GridDims {
    width: u32,
    depth: u32,
    height: u32,
}

#[derive(Deserialize)]
struct RawDims {
    width: u32,
    depth: u32,
    height: u32,
}

impl TryFrom<RawDims> for GridDims {
    type Error = GridError;

    fn try_from(raw: RawDims) -> Result<Self, Self::Error> {
        GridDims::new(raw.width, raw.depth, raw.height)
    }
}

impl GridDims {
    /// Validate and construct grid dimensions.
    ///
    /// Every axis must be non-zero and the total volume must fit in an `i32`,
    /// since chunk start indices travel as signed 32-bit integers.
    pub fn new(width: u32, depth: u32, height: u32) -> Result<Self, GridError> {
        let invalid = |reason| GridError::InvalidDimensions {
            width,
            depth,
            height,
            reason,
        };
        if width == 0 || depth == 0 || height == 0 {
            return Err(invalid("every dimension must be greater than zero"));
        }
        let volume = u64::from(width) * u64::from(depth) * u64::from(height);
        if volume > i32::MAX as u64 {
            return Err(invalid("volume exceeds the wire index range"));
        }
        Ok(Self {
            width,
            depth,
            height,
        })
    }

    /// Size along X.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Size along Y.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Size along Z.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of cells in one Z layer.
    pub fn layer_size(&self) -> usize {
        self.width as usize * self.depth as usize
    }

    /// Total number of cells.
    pub fn volume(&self) -> usize {
        self.layer_size() * self.height as usize
    }

    /// Whether the coordinate lies inside the grid.
    pub fn contains(&self, coord: Coord) -> bool {
        coord.x < self.width && coord.y < self.depth && coord.z < self.height
    }

    /// Map a coordinate to its linear index.
    pub fn index_of(&self, x: u32, y: u32, z: u32) -> Result<usize, GridError> {
        let coord = Coord::new(x, y, z);
        if !self.contains(coord) {
            return Err(GridError::OutOfRange {
                what: format!("coordinate {coord}"),
                dims: *self,
            });
        }
        Ok(x as usize + y as usize * self.width as usize + z as usize * self.layer_size())
    }

    /// Map a linear index back to its coordinate.
    pub fn coord_of(&self, index: usize) -> Result<Coord, GridError> {
        if index >= self.volume() {
            return Err(GridError::OutOfRange {
                what: format!("index {index}"),
                dims: *self,
            });
        }
        let layer = self.layer_size();
        let z = index / layer;
        let rem = index % layer;
        let y = rem / self.width as usize;
        let x = rem % self.width as usize;
        Ok(Coord::new(x as u32, y as u32, z as u32))
    }
}

impl fmt::Display for GridDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.depth, self.height)
    }
}
