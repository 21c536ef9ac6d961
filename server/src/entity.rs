//! World entities and the arena that owns them.
//!
//! Entities are numbered with 16-bit ids handed out by an injected
//! [`IdAllocator`] and live in one central arena; every cross-entity
//! reference (visibility, follow targets, attackers) is a plain id into that
//! arena rather than a smart pointer, which keeps the observer/follower
//! cycles harmless. Only the world tick loop mutates entities — the
//! connection layer never sees them.

use crate::connection::ConnectionShared;
use crate::scheduler::ActionHandle;
use shared::{Appearance, ServerMessage};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub type EntityId = u16;

/// Where a connection-backed entity sits in its session lifecycle. Most
/// message handlers are only valid for `LoggedIn` entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    LoggedIn,
    LoggingOff,
}

/// Position of an entity on a named map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub x: u16,
    pub y: u16,
    pub z: u8,
    /// Facing in degrees, multiples of 45.
    pub rotation: u16,
    pub sitting: bool,
    pub map: String,
}

/// A uniquely numbered world object: player character or NPC.
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub appearance: Appearance,
    pub pos: Position,
    /// Entities seen this tick; rebuilt every tick by proximity.
    pub visible_now: HashSet<EntityId>,
    /// Last tick's visibility set, for add/remove deltas.
    pub visible_prev: HashSet<EntityId>,
    /// Non-owning back-reference to a followed entity.
    pub following: Option<EntityId>,
    /// Handle of the entity's single current (cancellable) action.
    pub current_action: Option<ActionHandle>,
    /// Entities whose actions currently target this one.
    attackers: HashSet<EntityId>,
    pub login_state: LoginState,
    /// `None` for NPCs; the world loop only ever touches the queues.
    pub conn: Option<Arc<ConnectionShared>>,
}

impl Entity {
    pub fn new_player(
        id: EntityId,
        name: &str,
        appearance: Appearance,
        pos: Position,
        conn: Arc<ConnectionShared>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            appearance,
            pos,
            visible_now: HashSet::new(),
            visible_prev: HashSet::new(),
            following: None,
            current_action: None,
            attackers: HashSet::new(),
            login_state: LoginState::LoggedIn,
            conn: Some(conn),
        }
    }

    pub fn new_npc(id: EntityId, name: &str, appearance: Appearance, pos: Position) -> Self {
        Self {
            id,
            name: name.to_string(),
            appearance,
            pos,
            visible_now: HashSet::new(),
            visible_prev: HashSet::new(),
            following: None,
            current_action: None,
            attackers: HashSet::new(),
            login_state: LoginState::LoggedIn,
            conn: None,
        }
    }

    pub fn is_npc(&self) -> bool {
        self.conn.is_none()
    }

    /// Queues a message for this entity's connection. No-op for NPCs.
    pub fn send(&self, msg: ServerMessage) {
        if let Some(conn) = &self.conn {
            conn.queue(msg);
        }
    }

    /// The add-actor announcement describing this entity.
    pub fn add_actor_message(&self) -> ServerMessage {
        ServerMessage::AddActor {
            id: self.id,
            x: self.pos.x,
            y: self.pos.y,
            z: self.pos.z,
            rotation: self.pos.rotation,
            appearance: self.appearance,
            name: self.name.clone(),
        }
    }

    pub fn add_attacker(&mut self, attacker: EntityId) {
        self.attackers.insert(attacker);
    }

    /// Removing an attacker that was never registered would mean a negative
    /// concurrent count — a programming error, so it aborts loudly.
    pub fn remove_attacker(&mut self, attacker: EntityId) {
        let present = self.attackers.remove(&attacker);
        assert!(
            present,
            "entity {} asked to remove unregistered attacker {}",
            self.id, attacker
        );
    }

    pub fn attacker_count(&self) -> usize {
        self.attackers.len()
    }
}

/// Hands out 16-bit entity ids, recycling released ones.
pub struct IdAllocator {
    next: u16,
    free: Vec<u16>,
}

impl IdAllocator {
    pub fn new() -> Self {
        // Id 0 stays unused so it can serve as "nobody" on the wire.
        Self {
            next: 1,
            free: Vec::new(),
        }
    }

    pub fn allocate(&mut self) -> Option<EntityId> {
        if let Some(id) = self.free.pop() {
            return Some(id);
        }
        if self.next == u16::MAX {
            return None;
        }
        let id = self.next;
        self.next += 1;
        Some(id)
    }

    pub fn release(&mut self, id: EntityId) {
        self.free.push(id);
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Central owner of all live entities plus the staged-entity list.
///
/// Entities created mid-tick land in staging and join the active set at the
/// end of the tick, so nothing mutates the active map while it is iterated.
pub struct EntityArena {
    entities: HashMap<EntityId, Entity>,
    staged: Vec<Entity>,
    ids: IdAllocator,
}

impl EntityArena {
    pub fn new(ids: IdAllocator) -> Self {
        Self {
            entities: HashMap::new(),
            staged: Vec::new(),
            ids,
        }
    }

    /// Allocates an id, builds the entity with it and stages it for the
    /// end-of-tick merge. `None` when the id space is exhausted.
    pub fn stage(&mut self, build: impl FnOnce(EntityId) -> Entity) -> Option<EntityId> {
        let id = self.ids.allocate()?;
        self.staged.push(build(id));
        Some(id)
    }

    /// Moves staged entities into the active set, returning their ids.
    pub fn merge_staged(&mut self) -> Vec<EntityId> {
        let mut merged = Vec::with_capacity(self.staged.len());
        for entity in self.staged.drain(..) {
            merged.push(entity.id);
            self.entities.insert(entity.id, entity);
        }
        merged
    }

    /// Removes an entity and releases its id for reuse.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.entities.remove(&id)?;
        self.ids.release(id);
        Some(entity)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Finds a live or staged entity by case-insensitive name (players only;
    /// used to refuse duplicate logins).
    pub fn find_player_by_name(&self, name: &str) -> Option<EntityId> {
        self.entities
            .values()
            .chain(self.staged.iter())
            .find(|e| !e.is_npc() && e.name.eq_ignore_ascii_case(name))
            .map(|e| e.id)
    }
}
