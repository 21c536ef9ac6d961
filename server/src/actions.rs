//! Concrete time-based actions.
//!
//! Only movement lives here for now; combat/harvest actions follow the same
//! [`TimedAction`] shape.

use crate::map::Tile;
use crate::scheduler::{ActionCtx, TimedAction};
use crate::entity::EntityId;
use crate::world::{COLOR_GREY, SERVER_CHANNEL};
use shared::ServerMessage;

/// Milliseconds between walk steps.
pub const STEP_INTERVAL_MS: u64 = 250;

/// Follows a pathfinder result one tile per interval.
///
/// The path's first element is the actor's current tile, so stepping starts
/// at index 1. The first step runs on the first pass after registration
/// regardless of the interval.
pub struct PathWalk {
    path: Vec<Tile>,
    next_idx: usize,
}

impl PathWalk {
    pub fn new(path: Vec<Tile>) -> Self {
        Self { path, next_idx: 1 }
    }

    pub fn remaining_steps(&self) -> usize {
        self.path.len().saturating_sub(self.next_idx)
    }
}

impl TimedAction for PathWalk {
    fn interval_ms(&self) -> u64 {
        STEP_INTERVAL_MS
    }

    fn run_on_first_tick(&self) -> bool {
        true
    }

    fn execute(&mut self, actor: EntityId, ctx: &mut ActionCtx<'_>) -> bool {
        let Some(&(x, y)) = self.path.get(self.next_idx) else {
            return false;
        };
        self.next_idx += 1;

        let (announce, observers) = {
            let Some(entity) = ctx.entities.get_mut(actor) else {
                return false;
            };
            entity.pos.rotation = facing(entity.pos.x, entity.pos.y, x, y);
            entity.pos.x = x;
            entity.pos.y = y;
            entity.pos.sitting = false;
            let observers: Vec<EntityId> = entity.visible_now.iter().copied().collect();
            (entity.add_actor_message(), observers)
        };

        // Observers see the step as a refreshed actor announcement.
        for id in observers {
            if let Some(other) = ctx.entities.get(id) {
                other.send(announce.clone());
            }
        }
        if let Some(entity) = ctx.entities.get(actor) {
            entity.send(announce);
        }

        self.next_idx < self.path.len()
    }

    fn cancel(&mut self, actor: EntityId, ctx: &mut ActionCtx<'_>) {
        if let Some(entity) = ctx.entities.get(actor) {
            entity.send(ServerMessage::RawText {
                channel: SERVER_CHANNEL,
                color: COLOR_GREY,
                text: "You stop walking.".to_string(),
            });
        }
    }
}

/// Facing in degrees for a single-tile step, 0 = north, clockwise.
fn facing(from_x: u16, from_y: u16, to_x: u16, to_y: u16) -> u16 {
    let dx = to_x as i32 - from_x as i32;
    let dy = to_y as i32 - from_y as i32;
    match (dx.signum(), dy.signum()) {
        (0, -1) => 0,
        (1, -1) => 45,
        (1, 0) => 90,
        (1, 1) => 135,
        (0, 1) => 180,
        (-1, 1) => 225,
        (-1, 0) => 270,
        (-1, -1) => 315,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityArena, IdAllocator, Position};
    use shared::Appearance;

    fn arena_with_walker(x: u16, y: u16) -> (EntityArena, EntityId) {
        let mut arena = EntityArena::new(IdAllocator::new());
        let id = arena
            .stage(|id| {
                Entity::new_npc(
                    id,
                    "walker",
                    Appearance::default(),
                    Position {
                        x,
                        y,
                        z: 0,
                        rotation: 0,
                        sitting: true,
                        map: "m".to_string(),
                    },
                )
            })
            .unwrap();
        arena.merge_staged();
        (arena, id)
    }

    #[test]
    fn walks_path_one_step_per_execution() {
        let (mut arena, id) = arena_with_walker(2, 2);
        let mut walk = PathWalk::new(vec![(2, 2), (3, 2), (4, 2), (4, 3)]);
        let mut now = 0;
        let mut steps = 0;
        loop {
            let mut ctx = ActionCtx {
                entities: &mut arena,
                now_ms: now,
            };
            let more = walk.execute(id, &mut ctx);
            steps += 1;
            now += STEP_INTERVAL_MS;
            if !more {
                break;
            }
        }
        assert_eq!(steps, 3);
        let e = arena.get(id).unwrap();
        assert_eq!((e.pos.x, e.pos.y), (4, 3));
        assert!(!e.pos.sitting, "walking stands the actor up");
    }

    #[test]
    fn rotation_follows_step_direction() {
        let (mut arena, id) = arena_with_walker(2, 2);
        let mut walk = PathWalk::new(vec![(2, 2), (3, 1)]);
        let mut ctx = ActionCtx {
            entities: &mut arena,
            now_ms: 0,
        };
        walk.execute(id, &mut ctx);
        assert_eq!(arena.get(id).unwrap().pos.rotation, 45);
    }

    #[test]
    fn trivial_path_finishes_immediately() {
        let (mut arena, id) = arena_with_walker(2, 2);
        let mut walk = PathWalk::new(vec![(2, 2)]);
        let mut ctx = ActionCtx {
            entities: &mut arena,
            now_ms: 0,
        };
        assert!(!walk.execute(id, &mut ctx));
        let e = arena.get(id).unwrap();
        assert_eq!((e.pos.x, e.pos.y), (2, 2));
        assert!(e.pos.sitting, "no step taken, no state touched");
    }
}
