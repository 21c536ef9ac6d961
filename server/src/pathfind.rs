//! Clustered A* pathfinding over a loaded [`Map`].
//!
//! Every query runs a reachability pre-check against the map's cluster grid
//! before any search: a destination in a different cluster is rejected in
//! O(1) instead of exhausting the frontier. The search itself is classic A*
//! over the eight directions with squared-Euclidean step costs (1 for axis
//! moves, 2 for diagonals) and a squared-Euclidean heuristic; frontier ties
//! break by insertion order, so results are deterministic.

use crate::map::{Map, Tile, DIRECTIONS};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Outcome of a path query. A closed set: callers branch on all four.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathOutcome {
    /// A walkable path; its first tile equals the supplied start.
    Valid(Vec<Tile>),
    /// The start tile itself is non-walkable.
    StartNotWalkable,
    /// The target tile (or every tile of the target area) is non-walkable.
    EndNotWalkable,
    /// Both ends are walkable but no route connects them.
    NoPath,
}

/// Where a path should lead: a single tile or a rectangular area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Tile(Tile),
    /// Inclusive corners; reaching any tile inside terminates the search.
    Area { min: Tile, max: Tile },
}

impl Target {
    pub fn contains(&self, tile: Tile) -> bool {
        match *self {
            Target::Tile(t) => t == tile,
            Target::Area { min, max } => {
                tile.0 >= min.0 && tile.0 <= max.0 && tile.1 >= min.1 && tile.1 <= max.1
            }
        }
    }

    /// Nearest point of the target to `tile` (the tile itself, or the
    /// clamped point of the rectangle).
    fn nearest_point(&self, tile: Tile) -> Tile {
        match *self {
            Target::Tile(t) => t,
            Target::Area { min, max } => {
                (tile.0.clamp(min.0, max.0), tile.1.clamp(min.1, max.1))
            }
        }
    }
}

/// Squared Euclidean distance between two tiles.
fn dist_sq(a: Tile, b: Tile) -> u64 {
    let dx = a.0 as i64 - b.0 as i64;
    let dy = a.1 as i64 - b.1 as i64;
    (dx * dx + dy * dy) as u64
}

/// Frontier entry ordered by estimated cost, then insertion sequence.
struct Open {
    estimate: u64,
    seq: u64,
    tile: Tile,
}

impl PartialEq for Open {
    fn eq(&self, other: &Self) -> bool {
        self.estimate == other.estimate && self.seq == other.seq
    }
}

impl Eq for Open {}

impl Ord for Open {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the cheapest (and on ties the
        // earliest-inserted) entry pops first.
        other
            .estimate
            .cmp(&self.estimate)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Open {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Computes a walkable path from `start` into `target`.
pub fn find_path(map: &Map, start: Tile, target: &Target) -> PathOutcome {
    if !map.walkable(start) {
        return PathOutcome::StartNotWalkable;
    }
    if let Some(outcome) = precheck(map, start, target) {
        return outcome;
    }
    if target.contains(start) {
        return PathOutcome::Valid(vec![start]);
    }
    search(map, start, target)
}

/// Cluster-based rejection. `None` means the search may proceed.
fn precheck(map: &Map, start: Tile, target: &Target) -> Option<PathOutcome> {
    let start_cluster = map.cluster(start);
    match *target {
        Target::Tile(end) => {
            if !map.walkable(end) {
                Some(PathOutcome::EndNotWalkable)
            } else if map.cluster(end) != start_cluster {
                Some(PathOutcome::NoPath)
            } else {
                None
            }
        }
        Target::Area { min, max } => {
            // Two independent conditions: the area may hold walkable tiles
            // that all sit in a foreign cluster.
            let mut any_walkable = false;
            let mut any_same_cluster = false;
            for y in min.1..=max.1 {
                for x in min.0..=max.0 {
                    if map.walkable((x, y)) {
                        any_walkable = true;
                        if map.cluster((x, y)) == start_cluster {
                            any_same_cluster = true;
                        }
                    }
                }
            }
            if !any_walkable {
                Some(PathOutcome::EndNotWalkable)
            } else if !any_same_cluster {
                Some(PathOutcome::NoPath)
            } else {
                None
            }
        }
    }
}

fn search(map: &Map, start: Tile, target: &Target) -> PathOutcome {
    let mut open = BinaryHeap::new();
    let mut best_cost: HashMap<Tile, u64> = HashMap::new();
    let mut parent: HashMap<Tile, Tile> = HashMap::new();
    let mut seq: u64 = 0;

    best_cost.insert(start, 0);
    open.push(Open {
        estimate: dist_sq(start, target.nearest_point(start)),
        seq,
        tile: start,
    });

    while let Some(Open { tile, .. }) = open.pop() {
        if target.contains(tile) {
            return PathOutcome::Valid(reconstruct(&parent, start, tile));
        }
        let cost_here = best_cost[&tile];
        for (dx, dy) in DIRECTIONS {
            let nx = tile.0 as i32 + dx;
            let ny = tile.1 as i32 + dy;
            if !map.in_bounds(nx, ny) {
                continue;
            }
            let next = (nx as u16, ny as u16);
            if !map.can_step(tile, next) {
                continue;
            }
            // Axis steps cost 1, diagonals 2 (squared Euclidean).
            let step = (dx * dx + dy * dy) as u64;
            let cost = cost_here + step;
            let known = best_cost.get(&next).copied();
            if known.map_or(true, |k| cost < k) {
                best_cost.insert(next, cost);
                parent.insert(next, tile);
                seq += 1;
                open.push(Open {
                    estimate: cost + dist_sq(next, target.nearest_point(next)),
                    seq,
                    tile: next,
                });
            }
        }
    }

    // The frontier ran dry inside a reachable cluster; distinct from the
    // non-walkable rejections so callers can word their replies differently.
    PathOutcome::NoPath
}

fn reconstruct(parent: &HashMap<Tile, Tile>, start: Tile, end: Tile) -> Vec<Tile> {
    let mut path = vec![end];
    let mut cursor = end;
    while cursor != start {
        match parent.get(&cursor) {
            Some(&prev) => {
                path.push(prev);
                cursor = prev;
            }
            None => break,
        }
    }
    path.reverse();
    path
}
