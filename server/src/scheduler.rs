//! Cooperative per-entity action scheduling.
//!
//! A time-based action is an interval-gated unit of work bound to one acting
//! entity and driven by the tick loop; nothing here owns a thread. New
//! registrations land in a staging list and only join the active set after
//! the current pass, so an action registered while handling a player message
//! takes its first step on the next tick, and the active list is never
//! mutated while it is being iterated.

use crate::entity::{EntityArena, EntityId};
use log::debug;

pub type ActionHandle = u64;

/// What an executing action may touch: the entity arena (connections hang
/// off entities, so sending messages works through it) and the tick clock.
pub struct ActionCtx<'a> {
    pub entities: &'a mut EntityArena,
    pub now_ms: u64,
}

/// A cooperative, interval-gated unit of work bound to one acting entity.
pub trait TimedAction: Send {
    /// Minimum milliseconds between executions; 0 means every tick.
    fn interval_ms(&self) -> u64;

    /// When true, the first execution ignores the interval and happens on
    /// the first pass after registration (movement uses this: the first
    /// step must not wait).
    fn run_on_first_tick(&self) -> bool {
        false
    }

    /// Runs the action's effect. Returns whether it should keep running.
    fn execute(&mut self, actor: EntityId, ctx: &mut ActionCtx<'_>) -> bool;

    /// Cleanup hook invoked synchronously at cancellation time (e.g. a
    /// cancel-notification message), never deferred to the next tick.
    fn cancel(&mut self, _actor: EntityId, _ctx: &mut ActionCtx<'_>) {}
}

struct Entry {
    handle: ActionHandle,
    actor: EntityId,
    action: Box<dyn TimedAction>,
    last_run_ms: u64,
    ran_once: bool,
    cancelled: bool,
}

/// Tick-driven scheduler over all registered actions.
pub struct ActionScheduler {
    active: Vec<Entry>,
    staged: Vec<Entry>,
    next_handle: ActionHandle,
}

impl ActionScheduler {
    pub fn new() -> Self {
        Self {
            active: Vec::new(),
            staged: Vec::new(),
            next_handle: 1,
        }
    }

    /// Stages an action for `actor`. It becomes active after the current
    /// pass and first executes on the following one.
    pub fn register(
        &mut self,
        actor: EntityId,
        action: Box<dyn TimedAction>,
        now_ms: u64,
    ) -> ActionHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.staged.push(Entry {
            handle,
            actor,
            action,
            last_run_ms: now_ms,
            ran_once: false,
            cancelled: false,
        });
        handle
    }

    /// Cancels an action: runs its cleanup hook now and guarantees the
    /// effect never executes again. Idempotent — a second cancel of the
    /// same handle does nothing. Returns whether this call deactivated it.
    pub fn cancel(&mut self, handle: ActionHandle, ctx: &mut ActionCtx<'_>) -> bool {
        let entry = self
            .active
            .iter_mut()
            .chain(self.staged.iter_mut())
            .find(|e| e.handle == handle);
        match entry {
            Some(e) if !e.cancelled => {
                e.cancelled = true;
                e.action.cancel(e.actor, ctx);
                true
            }
            _ => false,
        }
    }

    /// One scheduler pass: runs due actions, removes finished and cancelled
    /// ones, then merges the staging list for the next pass.
    pub fn run_pass(&mut self, ctx: &mut ActionCtx<'_>) {
        let mut i = 0;
        while i < self.active.len() {
            let entry = &mut self.active[i];
            let keep = if entry.cancelled || !ctx.entities.contains(entry.actor) {
                // A cancelled (or orphaned) action reports "do not continue"
                // on its scheduled check without executing its effect.
                false
            } else {
                let first_shot = !entry.ran_once && entry.action.run_on_first_tick();
                let due = ctx.now_ms.saturating_sub(entry.last_run_ms)
                    >= entry.action.interval_ms();
                if first_shot || due {
                    entry.ran_once = true;
                    entry.last_run_ms = ctx.now_ms;
                    entry.action.execute(entry.actor, ctx)
                } else {
                    true
                }
            };
            if keep {
                i += 1;
            } else {
                let entry = self.active.remove(i);
                debug!(
                    "Action {} of entity {} removed from scheduler",
                    entry.handle, entry.actor
                );
                if let Some(e) = ctx.entities.get_mut(entry.actor) {
                    if e.current_action == Some(entry.handle) {
                        e.current_action = None;
                    }
                }
            }
        }
        // Entries staged during this tick first get a chance to run on the
        // next pass.
        self.active.append(&mut self.staged);
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty() && self.staged.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.active.len() + self.staged.len()
    }
}

impl Default for ActionScheduler {
    fn default() -> Self {
        Self::new()
    }
}
