//! Change notifications published by the store after every committed write.

use crate::object::{Kind, Object};

/// Buffered events per subscriber before it is considered lagged.
pub const WATCH_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: EventType,
    /// The object after the write (before it, for deletions).
    pub object: Object,
}

impl WatchEvent {
    pub fn kind(&self) -> Kind {
        self.object.kind()
    }

    pub fn key(&self) -> String {
        self.object.key()
    }
}
