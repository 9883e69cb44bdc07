use std::ops::Range;

use crate::{GridCell, GridDims, GridError};

/// Read access to a grid, as consumed by the network layer.
pub trait Grid {
    /// Dimensions of the grid.
    fn dimensions(&self) -> GridDims;

    /// Copy of the cell at a linear index.
    fn cell_at(&self, index: usize) -> Result<GridCell, GridError>;

    /// Snapshot a contiguous run of cells.
    fn snapshot(&self, range: Range<usize>) -> Result<Vec<GridCell>, GridError> {
        check_range(self.dimensions(), &range)?;
        range.map(|index| self.cell_at(index)).collect()
    }
}

fn check_range(dims: GridDims, range: &Range<usize>) -> Result<(), GridError> {
    if range.start > range.end || range.end > dims.volume() {
        return Err(GridError::OutOfRange {
            what: format!("range {}..{}", range.start, range.end),
            dims,
        });
    }
    Ok(())
}

/// Dense tile storage backed by a single vector in linear index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    dims: GridDims,
    cells: Vec<GridCell>,
}

impl TileGrid {
    /// Allocate a grid filled with empty cells.
    pub fn new(dims: GridDims) -> Self {
        Self::filled(dims, GridCell::EMPTY)
    }

    /// Allocate a grid with every cell set to `cell`.
    pub fn filled(dims: GridDims, cell: GridCell) -> Self {
        tracing::debug!(%dims, volume = dims.volume(), "allocating tile grid");
        Self {
            dims,
            cells: vec![cell; dims.volume()],
        }
    }

    /// Fetch the cell at a coordinate.
    pub fn get(&self, x: u32, y: u32, z: u32) -> Result<GridCell, GridError> {
        let index = self.dims.index_of(x, y, z)?;
        Ok(self.cells[index])
    }

    /// Replace the cell at a coordinate.
    pub fn set(&mut self, x: u32, y: u32, z: u32, cell: GridCell) -> Result<(), GridError> {
        let index = self.dims.index_of(x, y, z)?;
        self.cells[index] = cell;
        Ok(())
    }

    /// Overwrite a run of cells starting at a linear index.
    pub fn write_run(&mut self, start: usize, cells: &[GridCell]) -> Result<(), GridError> {
        let range = start..start.saturating_add(cells.len());
        check_range(self.dims, &range)?;
        self.cells[range].copy_from_slice(cells);
        Ok(())
    }

    /// All cells in linear index order.
    pub fn cells(&self) -> &[GridCell] {
        &self.cells
    }

    pub(crate) fn cells_mut(&mut self) -> &mut [GridCell] {
        &mut self.cells
    }

    /// Number of non-empty cells.
    pub fn occupied_count(&self) -> usize {
        self.cells.iter().filter(|cell| !cell.is_empty()).count()
    }
}

impl Grid for TileGrid {
    fn dimensions(&self) -> GridDims {
        self.dims
    }

    fn cell_at(&self, index: usize) -> Result<GridCell, GridError> {
        self.cells
            .get(index)
            .copied()
            .ok_or_else(|| GridError::OutOfRange {
                what: format!("index {index}"),
                dims: self.dims,
            })
    }

    fn snapshot(&self, range: Range<usize>) -> Result<Vec<GridCell>, GridError> {
        check_range(self.dims, &range)?;
        Ok(self.cells[range].to_vec())
    }
}
