//! Room membership tracking.
//!
//! Keeps a forward index (`room -> handles`, for broadcast) and a reverse
//! index (`handle -> rooms`, for disconnect cleanup) under a single lock so the
//! two never disagree. Rooms are created on first join and dropped as soon as
//! their last member leaves.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use shared::domain::{ConnectionId, RoomId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
    Full,
}

#[derive(Debug, Default)]
struct RoomsInner {
    members: HashMap<RoomId, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<RoomId>>,
}

impl RoomsInner {
    fn insert(&mut self, room: &RoomId, connection: ConnectionId) -> bool {
        let added = self
            .members
            .entry(room.clone())
            .or_default()
            .insert(connection);
        if added {
            self.memberships
                .entry(connection)
                .or_default()
                .insert(room.clone());
        }
        added
    }

    fn remove_member(&mut self, room: &RoomId, connection: ConnectionId) -> bool {
        let Some(members) = self.members.get_mut(room) else {
            return false;
        };
        let removed = members.remove(&connection);
        if members.is_empty() {
            self.members.remove(room);
        }
        removed
    }
}

#[derive(Debug, Default)]
pub struct RoomTracker {
    inner: Mutex<RoomsInner>,
}

impl RoomTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RoomsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if the handle was not already a member.
    pub fn join(&self, room: &RoomId, connection: ConnectionId) -> bool {
        self.lock().insert(room, connection)
    }

    /// Joins unless the room already holds `capacity` other members. The
    /// check and the insert happen under one lock.
    pub fn join_with_capacity(
        &self,
        room: &RoomId,
        connection: ConnectionId,
        capacity: usize,
    ) -> JoinOutcome {
        let mut inner = self.lock();
        if let Some(members) = inner.members.get(room) {
            if members.contains(&connection) {
                return JoinOutcome::AlreadyMember;
            }
            if members.len() >= capacity {
                return JoinOutcome::Full;
            }
        }
        inner.insert(room, connection);
        JoinOutcome::Joined
    }

    /// Returns `true` if the handle was a member.
    pub fn leave(&self, room: &RoomId, connection: ConnectionId) -> bool {
        let mut inner = self.lock();
        let removed = inner.remove_member(room, connection);
        if let Some(rooms) = inner.memberships.get_mut(&connection) {
            rooms.remove(room);
            if rooms.is_empty() {
                inner.memberships.remove(&connection);
            }
        }
        removed
    }

    /// Evicts the handle from every room it is in and returns those rooms.
    pub fn leave_all(&self, connection: ConnectionId) -> Vec<RoomId> {
        let mut inner = self.lock();
        let rooms: Vec<RoomId> = inner
            .memberships
            .remove(&connection)
            .map(|rooms| rooms.into_iter().collect())
            .unwrap_or_default();
        for room in &rooms {
            inner.remove_member(room, connection);
        }
        rooms
    }

    /// Snapshot of the room's members. The set may change as soon as the
    /// lock is released; callers broadcast from the copy.
    pub fn members_of(&self, room: &RoomId) -> HashSet<ConnectionId> {
        self.lock().members.get(room).cloned().unwrap_or_default()
    }

    pub fn rooms_of(&self, connection: ConnectionId) -> HashSet<RoomId> {
        self.lock()
            .memberships
            .get(&connection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, room: &RoomId, connection: ConnectionId) -> bool {
        self.lock()
            .members
            .get(room)
            .is_some_and(|members| members.contains(&connection))
    }

    pub fn room_exists(&self, room: &RoomId) -> bool {
        self.lock().members.contains_key(room)
    }

    pub fn room_count(&self) -> usize {
        self.lock().members.len()
    }
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
