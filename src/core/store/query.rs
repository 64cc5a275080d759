//! One predicate for "should this entity take part in automatic work".

use super::types::{CommandRecord, ConfigState, RepositoryRecord, ServerRecord, ServerState};

pub trait Activatable {
    fn is_active(&self) -> bool;
}

impl Activatable for RepositoryRecord {
    fn is_active(&self) -> bool {
        self.active
    }
}

impl Activatable for CommandRecord {
    fn is_active(&self) -> bool {
        self.active
    }
}

/// Unreachable servers stay out of probing until an operator reactivates them.
impl Activatable for ServerRecord {
    fn is_active(&self) -> bool {
        self.state != ServerState::Unreachable
    }
}

pub fn active<T: Activatable>(items: &[T]) -> impl Iterator<Item = &T> {
    items.iter().filter(|item| item.is_active())
}

impl ConfigState {
    /// Active commands bound to `repo`, in enrollment order.
    pub fn active_commands_for(&self, repo: &str) -> Vec<&CommandRecord> {
        active(&self.commands).filter(|c| c.repo == repo).collect()
    }
}
