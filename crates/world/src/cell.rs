//! Per-cell tile payload.

/// Number of bytes a [`GridCell`] occupies on the wire.
pub const CELL_WIRE_SIZE: usize = 6;

/// Ground type of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TileKind {
    /// No tile placed.
    #[default]
    Empty = 0,
    /// Grass ground.
    Grass = 1,
    /// Sand ground.
    Sand = 2,
    /// Water surface.
    Water = 3,
    /// Bare stone.
    Stone = 4,
}

impl TileKind {
    /// Stable numeric tag used on the wire.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`TileKind::as_u8`].
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Empty),
            1 => Some(Self::Grass),
            2 => Some(Self::Sand),
            3 => Some(Self::Water),
            4 => Some(Self::Stone),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    /// Features stacked on a tile and occupancy state.
    pub struct CellFlags: u8 {
        /// Mountain scenery.
        const MOUNTAIN = 0b0000_0001;
        /// A stand of trees.
        const TREES = 0b0000_0010;
        /// A house.
        const HOUSE = 0b0000_0100;
        /// An entity currently stands on this tile.
        const OCCUPIED = 0b1000_0000;
    }
}

/// RGBA tint applied to a tile's ground sprite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tint(pub [u8; 4]);

impl Tint {
    /// Untinted.
    pub const WHITE: Self = Self([255, 255, 255, 255]);

    /// Scale the colour channels by `factor`, leaving alpha untouched.
    pub fn light_shift(self, factor: f32) -> Self {
        let [r, g, b, a] = self.0;
        let scale = |c: u8| (f32::from(c) * factor).clamp(0.0, 255.0) as u8;
        Self([scale(r), scale(g), scale(b), a])
    }

    /// Channel-wise multiply with another tint.
    pub fn multiply(self, other: Tint) -> Self {
        let mut out = [0u8; 4];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = ((u16::from(self.0[i]) * u16::from(other.0[i])) / 255) as u8;
        }
        Self(out)
    }
}

impl Default for Tint {
    fn default() -> Self {
        Self::WHITE
    }
}

/// Content of one grid position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GridCell {
    /// Ground type.
    pub kind: TileKind,
    /// Feature and occupancy bits.
    pub flags: CellFlags,
    /// Ground tint.
    pub tint: Tint,
}

impl GridCell {
    /// An empty cell.
    pub const EMPTY: Self = Self {
        kind: TileKind::Empty,
        flags: CellFlags::empty(),
        tint: Tint::WHITE,
    };

    /// A cell of the given kind with no features.
    pub fn new(kind: TileKind) -> Self {
        Self {
            kind,
            ..Self::EMPTY
        }
    }

    /// Whether nothing is placed here.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.kind == TileKind::Empty
    }

    /// Wire layout: `[kind][flags][r][g][b][a]`.
    pub fn to_wire(&self) -> [u8; CELL_WIRE_SIZE] {
        let [r, g, b, a] = self.tint.0;
        [self.kind.as_u8(), self.flags.bits(), r, g, b, a]
    }

    /// Parse the wire layout. Returns `None` for unknown tile kinds or flag bits.
    pub fn from_wire(bytes: [u8; CELL_WIRE_SIZE]) -> Option<Self> {
        let kind = TileKind::from_u8(bytes[0])?;
        let flags = CellFlags::from_bits(bytes[1])?;
        Some(Self {
            kind,
            flags,
            tint: Tint([bytes[2], bytes[3], bytes[4], bytes[5]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_layout_is_stable() {
        let cell = GridCell {
            kind: TileKind::Sand,
            flags: CellFlags::TREES | CellFlags::OCCUPIED,
            tint: Tint([1, 2, 3, 4]),
        };
        assert_eq!(cell.to_wire(), [2, 0b1000_0010, 1, 2, 3, 4]);
        assert_eq!(GridCell::from_wire(cell.to_wire()), Some(cell));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert_eq!(GridCell::from_wire([9, 0, 0, 0, 0, 0]), None);
        assert_eq!(GridCell::from_wire([1, 0b0100_0000, 0, 0, 0, 0]), None);
    }

    #[test]
    fn light_shift_keeps_alpha() {
        let tint = Tint([200, 100, 50, 128]).light_shift(0.5);
        assert_eq!(tint, Tint([100, 50, 25, 128]));
    }
}
