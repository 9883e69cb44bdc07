//! Client-side reassembly of a streamed world.

use isoworld_net::{WorldChunk, WorldInfo, MAX_WORLD_CELLS};
use isoworld_world::{GridDims, GridError, TileGrid};
use std::collections::HashSet;
use tracing::{debug, warn};

/// A world being received chunk by chunk.
///
/// Chunks are placed by their start index, so arrival order does not matter.
#[derive(Debug)]
pub struct WorldDownload {
    info: WorldInfo,
    grid: TileGrid,
    covered: Vec<bool>,
    received_cells: usize,
    sequences: HashSet<u16>,
}

impl WorldDownload {
    /// Allocate an empty grid matching the advertised world.
    ///
    /// Worlds larger than [`MAX_WORLD_CELLS`] are refused before anything
    /// is allocated.
    pub fn new(info: WorldInfo) -> Result<Self, GridError> {
        let dims = GridDims::new(info.width, info.depth, info.height)?;
        if dims.volume() as u64 > MAX_WORLD_CELLS {
            return Err(GridError::InvalidDimensions {
                width: info.width,
                depth: info.depth,
                height: info.height,
                reason: "world exceeds the download limit",
            });
        }
        Ok(Self {
            info,
            grid: TileGrid::new(dims),
            covered: vec![false; dims.volume()],
            received_cells: 0,
            sequences: HashSet::new(),
        })
    }

    /// Place one chunk.
    pub fn apply(&mut self, chunk: &WorldChunk) -> Result<(), GridError> {
        self.grid.write_run(chunk.start_index, &chunk.cells)?;

        if !self.sequences.insert(chunk.sequence_id) {
            warn!(sequence = chunk.sequence_id, "duplicate chunk sequence id");
        }
        let span = chunk.span();
        let fresh = self.covered[span.clone()].iter().filter(|c| !**c).count();
        if fresh != span.len() {
            warn!(
                start = span.start,
                end = span.end,
                "chunk overlaps data already received"
            );
        }
        self.covered[span].fill(true);
        self.received_cells += fresh;
        debug!(
            sequence = chunk.sequence_id,
            received = self.received_cells,
            total = self.total_cells(),
            "chunk placed"
        );
        Ok(())
    }

    /// World description this download follows.
    pub fn info(&self) -> &WorldInfo {
        &self.info
    }

    /// Distinct cells received so far.
    pub fn received_cells(&self) -> usize {
        self.received_cells
    }

    /// Cells in the full world.
    pub fn total_cells(&self) -> usize {
        self.covered.len()
    }

    /// Fraction received in `0.0..=1.0`.
    pub fn progress(&self) -> f32 {
        if self.covered.is_empty() {
            return 1.0;
        }
        self.received_cells as f32 / self.total_cells() as f32
    }

    /// Whether every cell has arrived.
    pub fn is_complete(&self) -> bool {
        self.received_cells == self.total_cells()
    }

    /// The finished grid; `None` while cells are missing.
    pub fn into_grid(self) -> Option<TileGrid> {
        self.is_complete().then_some(self.grid)
    }
}
