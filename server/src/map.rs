//! Tile maps: an immutable byte height grid plus a derived cluster grid.
//!
//! Height 0 marks a non-walkable tile. Two adjacent tiles (8-directional)
//! connect only if both are walkable and their height difference is at most
//! [`MAX_STEP_HEIGHT`]. Clusters are maximal connected components under that
//! relation, assigned once at load time by an explicit-stack flood fill and
//! never recomputed; the pathfinder uses them to reject unreachable
//! destinations in O(1).

use log::info;

/// A tile coordinate pair (column, row).
pub type Tile = (u16, u16);

/// Cluster id given to every non-walkable tile. Real clusters start at 1.
pub const NO_CLUSTER: u16 = 0;

/// Largest height difference a single step may cross.
pub const MAX_STEP_HEIGHT: i16 = 2;

/// The eight neighbor offsets, axis moves first.
pub const DIRECTIONS: [(i32, i32); 8] = [
    (0, -1),
    (0, 1),
    (-1, 0),
    (1, 0),
    (-1, -1),
    (1, -1),
    (-1, 1),
    (1, 1),
];

#[derive(Debug)]
pub enum MapError {
    /// Height blob length does not equal width * height.
    DimensionMismatch {
        width: u16,
        height: u16,
        bytes: usize,
    },
}

impl std::fmt::Display for MapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapError::DimensionMismatch {
                width,
                height,
                bytes,
            } => write!(
                f,
                "map blob is {} bytes, expected {}x{} = {}",
                bytes,
                width,
                height,
                *width as usize * *height as usize
            ),
        }
    }
}

impl std::error::Error for MapError {}

/// An immutable loaded map: height grid plus precomputed cluster grid.
pub struct Map {
    name: String,
    width: u16,
    height: u16,
    heights: Vec<u8>,
    clusters: Vec<u16>,
    cluster_count: u16,
}

impl Map {
    /// Builds a map from a raw height blob and assigns clusters.
    ///
    /// Map-definition-file parsing happens upstream; this accepts the
    /// already-extracted `(name, dimensions, heights)` triple.
    pub fn new(name: &str, width: u16, height: u16, heights: Vec<u8>) -> Result<Self, MapError> {
        if heights.len() != width as usize * height as usize {
            return Err(MapError::DimensionMismatch {
                width,
                height,
                bytes: heights.len(),
            });
        }
        let mut map = Self {
            name: name.to_string(),
            width,
            height,
            heights,
            clusters: vec![NO_CLUSTER; width as usize * height as usize],
            cluster_count: 0,
        };
        map.assign_clusters();
        info!(
            "Loaded map '{}' ({}x{}, {} clusters)",
            map.name, map.width, map.height, map.cluster_count
        );
        Ok(map)
    }

    /// Convenience constructor for a uniform-height map.
    pub fn flat(name: &str, width: u16, height: u16, tile_height: u8) -> Self {
        let heights = vec![tile_height; width as usize * height as usize];
        // Cannot fail: the blob length is width * height by construction.
        match Self::new(name, width, height, heights) {
            Ok(map) => map,
            Err(_) => unreachable!("flat map dimensions always match"),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn cluster_count(&self) -> u16 {
        self.cluster_count
    }

    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.width as i32 && y < self.height as i32
    }

    fn idx(&self, x: u16, y: u16) -> usize {
        y as usize * self.width as usize + x as usize
    }

    /// Tile height; 0 for non-walkable and out-of-bounds tiles alike.
    pub fn height_at(&self, x: i32, y: i32) -> u8 {
        if self.in_bounds(x, y) {
            self.heights[self.idx(x as u16, y as u16)]
        } else {
            0
        }
    }

    pub fn walkable(&self, tile: Tile) -> bool {
        self.height_at(tile.0 as i32, tile.1 as i32) > 0
    }

    /// Cluster id of a tile; [`NO_CLUSTER`] if non-walkable or out of bounds.
    pub fn cluster(&self, tile: Tile) -> u16 {
        if self.in_bounds(tile.0 as i32, tile.1 as i32) {
            self.clusters[self.idx(tile.0, tile.1)]
        } else {
            NO_CLUSTER
        }
    }

    /// Whether a single step from `from` to `to` is allowed: both walkable
    /// and within the step-height limit.
    pub fn can_step(&self, from: Tile, to: Tile) -> bool {
        let hf = self.height_at(from.0 as i32, from.1 as i32);
        let ht = self.height_at(to.0 as i32, to.1 as i32);
        hf > 0 && ht > 0 && (hf as i16 - ht as i16).abs() <= MAX_STEP_HEIGHT
    }

    /// Flood-fills cluster ids over all walkable tiles.
    ///
    /// Explicit stack rather than recursion: large open maps would otherwise
    /// blow the call stack.
    fn assign_clusters(&mut self) {
        let mut next = NO_CLUSTER;
        let mut stack: Vec<Tile> = Vec::new();
        for y in 0..self.height {
            for x in 0..self.width {
                let i = self.idx(x, y);
                if self.heights[i] == 0 || self.clusters[i] != NO_CLUSTER {
                    continue;
                }
                next += 1;
                self.clusters[i] = next;
                stack.push((x, y));
                while let Some((cx, cy)) = stack.pop() {
                    for (dx, dy) in DIRECTIONS {
                        let nx = cx as i32 + dx;
                        let ny = cy as i32 + dy;
                        if !self.in_bounds(nx, ny) {
                            continue;
                        }
                        let ni = self.idx(nx as u16, ny as u16);
                        if self.clusters[ni] != NO_CLUSTER {
                            continue;
                        }
                        if self.can_step((cx, cy), (nx as u16, ny as u16)) {
                            self.clusters[ni] = next;
                            stack.push((nx as u16, ny as u16));
                        }
                    }
                }
            }
        }
        self.cluster_count = next;
    }
}
