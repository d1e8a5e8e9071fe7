//! In-memory rooms and sessions.
//!
//! All state lives in a [`RoomTable`] behind the single mutex of an
//! [`EntityStore`]. Callers take the lock once per request and run their
//! whole check-then-act sequence under it.

use huddle_protocol::ErrorCode;
use huddle_transport::ConnectionId;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Entity store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A room with this name already exists.
    #[error("Room already exists: {0}")]
    AlreadyExists(String),

    /// No room with this name.
    #[error("Room not found: {0}")]
    NotFound(String),

    /// The display name is already used in the room.
    #[error("User {name:?} already exists in room {room:?}")]
    NameTaken { room: String, name: String },

    /// No session matches the token.
    #[error("Token is invalid")]
    InvalidToken,
}

impl StoreError {
    /// The error code reported to the client.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::AlreadyExists(_) => ErrorCode::RoomAlreadyExists,
            StoreError::NotFound(_) => ErrorCode::RoomNotFound,
            StoreError::NameTaken { .. } => ErrorCode::UsernameTaken,
            StoreError::InvalidToken => ErrorCode::InvalidToken,
        }
    }
}

/// Reconnect credential for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    /// Generate a fresh random (128-bit) token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A participant in one room.
#[derive(Debug, Clone)]
pub struct User {
    name: String,
    token: Token,
    connection: ConnectionId,
}

impl User {
    /// Display name, unique within the room.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reconnect credential.
    #[must_use]
    pub fn token(&self) -> &Token {
        &self.token
    }

    /// The connection currently bound to this session. May be stale.
    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

/// A named room. Members are kept in join order.
#[derive(Debug, Clone)]
pub struct Room {
    name: String,
    members: Vec<User>,
}

impl Room {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    /// Get the room name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Members in join order.
    #[must_use]
    pub fn members(&self) -> &[User] {
        &self.members
    }

    /// Number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Find a member by display name.
    #[must_use]
    pub fn member(&self, name: &str) -> Option<&User> {
        self.members.iter().find(|u| u.name == name)
    }

    /// Find a member by token.
    #[must_use]
    pub fn find_user_by_token(&self, token: &Token) -> Option<&User> {
        self.members.iter().find(|u| &u.token == token)
    }

    /// Connections of all current members, in join order.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.members.iter().map(|u| u.connection).collect()
    }
}

/// Reconnect index entry: where a token's session lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seat {
    pub room: String,
    pub username: String,
}

/// Read-only view of one room, for the HTTP side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub name: String,
    pub members: Vec<String>,
}

/// Store statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of rooms.
    pub room_count: usize,
    /// Number of sessions across all rooms.
    pub member_count: usize,
    /// Number of reconnect index entries, including dangling ones.
    pub token_count: usize,
}

/// Rooms plus the derived token index.
#[derive(Debug, Default)]
pub struct RoomTable {
    rooms: HashMap<String, Room>,
    tokens: HashMap<Token, Seat>,
}

impl RoomTable {
    /// Create a room.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the name is taken.
    pub fn create_room(&mut self, name: &str) -> Result<&Room, StoreError> {
        if self.rooms.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        debug!(room = %name, "Creating room");
        Ok(self
            .rooms
            .entry(name.to_string())
            .or_insert_with(|| Room::new(name)))
    }

    /// Get a room by name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if absent.
    pub fn room(&self, name: &str) -> Result<&Room, StoreError> {
        self.rooms
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// Add a user to a room under a fresh token.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the room is absent, or
    /// [`StoreError::NameTaken`] if a member already has `name`.
    pub fn add_user(
        &mut self,
        room_name: &str,
        name: &str,
        connection: ConnectionId,
    ) -> Result<&User, StoreError> {
        let room = self
            .rooms
            .get_mut(room_name)
            .ok_or_else(|| StoreError::NotFound(room_name.to_string()))?;

        if room.member(name).is_some() {
            return Err(StoreError::NameTaken {
                room: room_name.to_string(),
                name: name.to_string(),
            });
        }

        let token = Token::generate();
        self.tokens.insert(
            token.clone(),
            Seat {
                room: room_name.to_string(),
                username: name.to_string(),
            },
        );
        room.members.push(User {
            name: name.to_string(),
            token,
            connection,
        });

        debug!(
            room = %room_name,
            user = %name,
            connection = %connection,
            members = room.members.len(),
            "User joined"
        );

        let user = &room.members[room.members.len() - 1];
        Ok(user)
    }

    /// Remove the member holding `token`.
    ///
    /// Returns the removed user; absence is not an error. The token index
    /// is left alone and stale entries are rejected when used.
    pub fn remove_user(&mut self, room_name: &str, token: &Token) -> Option<User> {
        let room = self.rooms.get_mut(room_name)?;
        let index = room.members.iter().position(|u| &u.token == token)?;
        let user = room.members.remove(index);
        debug!(
            room = %room_name,
            user = %user.name,
            members = room.members.len(),
            "User left"
        );
        Some(user)
    }

    /// Find a member of `room_name` by token.
    #[must_use]
    pub fn find_user_by_token(&self, room_name: &str, token: &Token) -> Option<&User> {
        self.rooms.get(room_name)?.find_user_by_token(token)
    }

    /// Bind the member holding `token` to a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidToken`] if no member of the room holds it.
    pub fn rebind(
        &mut self,
        room_name: &str,
        token: &Token,
        connection: ConnectionId,
    ) -> Result<&User, StoreError> {
        let user = self
            .rooms
            .get_mut(room_name)
            .and_then(|room| room.members.iter_mut().find(|u| &u.token == token))
            .ok_or(StoreError::InvalidToken)?;

        debug!(
            room = %room_name,
            user = %user.name,
            from = %user.connection,
            to = %connection,
            "Session rebound"
        );
        user.connection = connection;
        Ok(user)
    }

    /// Look up a token in the reconnect index.
    ///
    /// The entry may be stale; callers must re-check membership.
    #[must_use]
    pub fn resolve_token(&self, token: &Token) -> Option<&Seat> {
        self.tokens.get(token)
    }

    /// Drop a reconnect index entry.
    pub fn forget_token(&mut self, token: &Token) -> Option<Seat> {
        self.tokens.remove(token)
    }

    /// Snapshot of all rooms and their member names, keyed by room name.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, RoomSummary> {
        self.rooms
            .values()
            .map(|room| {
                (
                    room.name.clone(),
                    RoomSummary {
                        name: room.name.clone(),
                        members: room.members.iter().map(|u| u.name.clone()).collect(),
                    },
                )
            })
            .collect()
    }

    /// Get store statistics.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            room_count: self.rooms.len(),
            member_count: self.rooms.values().map(Room::member_count).sum(),
            token_count: self.tokens.len(),
        }
    }
}

/// Shared, serialized access to the [`RoomTable`].
#[derive(Debug, Default)]
pub struct EntityStore {
    table: Mutex<RoomTable>,
}

impl EntityStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the table.
    ///
    /// Do not hold the guard across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, RoomTable> {
        // A panic under the lock leaves the table structurally valid.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of all rooms, for the HTTP side channel.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, RoomSummary> {
        self.lock().snapshot()
    }

    /// Get store statistics.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const C1: ConnectionId = ConnectionId::new(1);
    const C2: ConnectionId = ConnectionId::new(2);

    #[test]
    fn test_create_room() {
        let store = EntityStore::new();
        let mut table = store.lock();

        let room = table.create_room("r1").unwrap();
        assert_eq!(room.name(), "r1");
        assert!(room.is_empty());

        assert_eq!(
            table.create_room("r1").unwrap_err(),
            StoreError::AlreadyExists("r1".to_string())
        );
        assert!(matches!(table.room("r2"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_add_user_keeps_join_order_and_unique_names() {
        let store = EntityStore::new();
        let mut table = store.lock();
        table.create_room("r1").unwrap();

        let alice = table.add_user("r1", "alice", C1).unwrap().token().clone();
        let bob = table.add_user("r1", "bob", C2).unwrap().token().clone();
        assert_ne!(alice, bob);

        let err = table.add_user("r1", "alice", C2).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UsernameTaken);

        let room = table.room("r1").unwrap();
        let names: Vec<_> = room.members().iter().map(User::name).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(room.connections(), vec![C1, C2]);

        assert_eq!(
            table.resolve_token(&alice),
            Some(&Seat {
                room: "r1".to_string(),
                username: "alice".to_string()
            })
        );
    }

    #[test]
    fn test_add_user_to_missing_room() {
        let store = EntityStore::new();
        let err = store.lock().add_user("nope", "alice", C1).unwrap_err();
        assert_eq!(err, StoreError::NotFound("nope".to_string()));
    }

    #[test]
    fn test_same_name_in_different_rooms() {
        let store = EntityStore::new();
        let mut table = store.lock();
        table.create_room("r1").unwrap();
        table.create_room("r2").unwrap();

        assert!(table.add_user("r1", "alice", C1).is_ok());
        assert!(table.add_user("r2", "alice", C2).is_ok());
    }

    #[test]
    fn test_remove_user_is_idempotent_and_leaves_index() {
        let store = EntityStore::new();
        let mut table = store.lock();
        table.create_room("r1").unwrap();
        let token = table.add_user("r1", "alice", C1).unwrap().token().clone();

        assert_eq!(table.remove_user("r1", &token).unwrap().name(), "alice");
        assert!(table.remove_user("r1", &token).is_none());
        assert!(table.remove_user("missing", &token).is_none());

        assert!(table.find_user_by_token("r1", &token).is_none());
        // Lazily invalidated: the index still has the entry
        assert!(table.resolve_token(&token).is_some());

        // The name is free again
        assert!(table.add_user("r1", "alice", C2).is_ok());
    }

    #[test]
    fn test_rebind() {
        let store = EntityStore::new();
        let mut table = store.lock();
        table.create_room("r1").unwrap();
        let token = table.add_user("r1", "alice", C1).unwrap().token().clone();

        let user = table.rebind("r1", &token, C2).unwrap();
        assert_eq!(user.connection(), C2);
        assert_eq!(table.find_user_by_token("r1", &token).unwrap().connection(), C2);

        assert_eq!(
            table.rebind("r1", &Token::from("bogus"), C1).unwrap_err(),
            StoreError::InvalidToken
        );
        assert_eq!(
            table.rebind("r9", &token, C1).unwrap_err(),
            StoreError::InvalidToken
        );
    }

    #[test]
    fn test_snapshot_and_stats() {
        let store = EntityStore::new();
        {
            let mut table = store.lock();
            table.create_room("b").unwrap();
            table.create_room("a").unwrap();
            table.add_user("a", "alice", C1).unwrap();
            table.add_user("a", "bob", C2).unwrap();
        }

        let snapshot = store.snapshot();
        let names: Vec<_> = snapshot.keys().cloned().collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(snapshot["a"].members, vec!["alice", "bob"]);
        assert!(snapshot["b"].members.is_empty());

        let stats = store.stats();
        assert_eq!(stats.room_count, 2);
        assert_eq!(stats.member_count, 2);
        assert_eq!(stats.token_count, 2);
    }

    #[test]
    fn test_tokens_are_unique() {
        let tokens: std::collections::HashSet<_> = (0..1000).map(|_| Token::generate()).collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn test_concurrent_joins_with_same_name() {
        let store = Arc::new(EntityStore::new());
        store.lock().create_room("r1").unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let joined = store
                        .lock()
                        .add_user("r1", "alice", ConnectionId::new(i))
                        .map(|u| u.token().clone());
                    joined
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Result::is_ok)
            .count();

        assert_eq!(successes, 1);
        assert_eq!(store.lock().room("r1").unwrap().member_count(), 1);
    }
}
