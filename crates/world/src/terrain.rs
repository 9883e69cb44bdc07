//! Seeded terrain generation for freshly hosted worlds.

use isoworld_core::{scoped_rng, SimTick};
use noise::{NoiseFn, Perlin};
use rand::Rng;

use crate::{CellFlags, Grid, GridCell, GridDims, TileGrid, TileKind, Tint};

/// Horizontal and vertical noise scale.
const NOISE_SCALE: f64 = 0.035;
/// Noise-space offset so small maps do not all sample the origin.
const NOISE_OFFSET: [f64; 2] = [500.0, 300.0];
/// Noise value above which a layer above the ground is filled.
const STACK_THRESHOLD: f64 = 0.7;
/// Ground-layer noise below this becomes water.
const WATER_LEVEL: f64 = 0.5;
/// Noise below this (and above water) becomes sand.
const SAND_LEVEL: f64 = 0.55;

const WATER_TINT: Tint = Tint([0, 191, 255, 255]);
const CHECKER_TINT: Tint = Tint([242, 242, 242, 255]);

/// Generation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerrainConfig {
    /// World seed.
    pub seed: u32,
    /// Chance an exposed grass tile gets a mountain.
    pub mountain_chance: f64,
    /// Chance an exposed grass tile gets trees.
    pub trees_chance: f64,
    /// Chance an exposed grass tile gets a house.
    pub house_chance: f64,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            seed: 400,
            mountain_chance: 0.1,
            trees_chance: 0.15,
            house_chance: 0.02,
        }
    }
}

/// Generate a world: a noise-shaped ground layer with stacked grass/sand
/// above it, then features scattered on exposed grass.
pub fn generate_terrain(dims: GridDims, config: &TerrainConfig) -> TileGrid {
    let perlin = Perlin::new(config.seed);
    let mut grid = TileGrid::new(dims);
    let layer = dims.layer_size();
    let cells = grid.cells_mut();

    // Loops run in linear index order, so `index` tracks (x, y, z).
    let mut index: usize = 0;
    for z in 0..dims.height() {
        for y in 0..dims.depth() {
            for x in 0..dims.width() {
                let below = index.checked_sub(layer).map(|i| cells[i]);
                let sample = sample(&perlin, x, y, z);
                if should_place(below, sample) {
                    cells[index] = ground_cell(dims, x, y, z, sample);
                }
                index += 1;
            }
        }
    }

    scatter_features(&mut grid, config);
    tracing::info!(
        dims = %dims,
        seed = config.seed,
        tiles = grid.occupied_count(),
        "generated terrain"
    );
    grid
}

fn ground_cell(dims: GridDims, x: u32, y: u32, z: u32, sample: f64) -> GridCell {
    let kind = if z == 0 && sample < WATER_LEVEL {
        TileKind::Water
    } else if sample < SAND_LEVEL {
        TileKind::Sand
    } else {
        TileKind::Grass
    };
    let base = if (x + y) % 2 == 0 {
        Tint::WHITE
    } else {
        CHECKER_TINT
    };
    let layer_light = 0.85 + 0.15 * ((z as f32 + 1.0) / dims.height() as f32);
    let mut tint = base.light_shift(layer_light);
    if kind == TileKind::Water {
        tint = tint
            .multiply(WATER_TINT)
            .light_shift(0.45 + (sample / WATER_LEVEL) as f32 * 0.8);
    }
    GridCell {
        kind,
        flags: CellFlags::empty(),
        tint,
    }
}

fn sample(perlin: &Perlin, x: u32, y: u32, z: u32) -> f64 {
    let raw = perlin.get([
        f64::from(x) * NOISE_SCALE + NOISE_OFFSET[0],
        f64::from(y) * NOISE_SCALE + NOISE_OFFSET[1],
        f64::from(z) * NOISE_SCALE,
    ]);
    ((raw + 1.0) * 0.5).clamp(0.0, 1.0)
}

/// `below` is `None` on the ground layer.
fn should_place(below: Option<GridCell>, sample: f64) -> bool {
    // No floating tiles, and nothing stacked on water.
    match below {
        None => true,
        Some(below) if !below.is_empty() && below.kind != TileKind::Water => {
            sample >= STACK_THRESHOLD
        }
        Some(_) => false,
    }
}

fn scatter_features(grid: &mut TileGrid, config: &TerrainConfig) {
    let layer = grid.dimensions().layer_size();
    let mut rng = scoped_rng(u64::from(config.seed), 0xFEA7, SimTick::ZERO);
    let cells = grid.cells_mut();

    for index in 0..cells.len() {
        if cells[index].kind != TileKind::Grass {
            continue;
        }
        let exposed = cells.get(index + layer).map_or(true, |above| above.is_empty());
        if !exposed {
            continue;
        }
        let flags = &mut cells[index].flags;
        if rng.gen_bool(config.mountain_chance) {
            flags.insert(CellFlags::MOUNTAIN);
        } else if rng.gen_bool(config.trees_chance) {
            flags.insert(CellFlags::TREES);
        } else if rng.gen_bool(config.house_chance) {
            flags.insert(CellFlags::HOUSE);
        }
    }
}
