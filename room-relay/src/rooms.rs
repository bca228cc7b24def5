//! Room registry: room table plus per-user presence.
//!
//! Rooms are created lazily on first join and never destroyed. Membership
//! accumulates across joins; only the active room receives a user's
//! broadcasts. `global` always exists, is public, and cannot be left.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::Mutex;

use crate::{
    error::{Reason, RelayError},
    record::RoomSummary,
};

pub const GLOBAL_ROOM: &str = "global";

#[derive(Debug, Default)]
struct Room {
    password: Option<String>,
    members: BTreeSet<String>,
}

#[derive(Debug)]
struct Presence {
    active: String,
    joined: BTreeSet<String>,
}

impl Presence {
    fn in_global() -> Self {
        Self {
            active: GLOBAL_ROOM.to_string(),
            joined: BTreeSet::from([GLOBAL_ROOM.to_string()]),
        }
    }
}

#[derive(Debug)]
struct RoomTable {
    rooms: HashMap<String, Room>,
    presence: HashMap<String, Presence>,
}

impl RoomTable {
    /// Presence for `user`, entering `global` first if the user is unknown.
    fn presence_mut(&mut self, user: &str) -> &mut Presence {
        if !self.presence.contains_key(user) {
            self.rooms
                .entry(GLOBAL_ROOM.to_string())
                .or_default()
                .members
                .insert(user.to_string());
        }
        self.presence
            .entry(user.to_string())
            .or_insert_with(Presence::in_global)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Canonical (trimmed) room name.
    pub room: String,
    /// False when the user was already a member (re-entry).
    pub first_membership: bool,
    pub previous_active: String,
}

#[derive(Debug)]
pub struct RoomRegistry {
    table: Mutex<RoomTable>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        let mut rooms = HashMap::new();
        rooms.insert(GLOBAL_ROOM.to_string(), Room::default());
        Self {
            table: Mutex::new(RoomTable {
                rooms,
                presence: HashMap::new(),
            }),
        }
    }

    /// Makes a freshly registered user a member of `global` with it active.
    pub async fn enter_global(&self, user: &str) {
        let mut table = self.table.lock().await;
        table.presence_mut(user);
    }

    pub async fn join_room(
        &self,
        user: &str,
        room: &str,
        password: Option<&str>,
    ) -> Result<JoinOutcome, RelayError> {
        let room = validate_room_name(room)?;
        let password = password.filter(|password| !password.is_empty());

        let mut table = self.table.lock().await;
        table.presence_mut(user);

        let first_membership = match table.rooms.get(&room) {
            Some(existing) => {
                let already_member = existing.members.contains(user);
                if !already_member {
                    if let Some(stored) = existing.password.as_deref() {
                        if password != Some(stored) {
                            return Err(RelayError::conflict(
                                Reason::WrongPassword,
                                format!("Wrong password for room '{room}'."),
                            ));
                        }
                    }
                }
                !already_member
            }
            None => {
                table.rooms.insert(
                    room.clone(),
                    Room {
                        password: password.map(str::to_string),
                        members: BTreeSet::new(),
                    },
                );
                true
            }
        };

        if let Some(entry) = table.rooms.get_mut(&room) {
            entry.members.insert(user.to_string());
        }
        let presence = table.presence_mut(user);
        presence.joined.insert(room.clone());
        let previous_active = std::mem::replace(&mut presence.active, room.clone());

        Ok(JoinOutcome {
            room,
            first_membership,
            previous_active,
        })
    }

    /// Leaves `room`, returning the user's active room afterwards.
    pub async fn leave_room(&self, user: &str, room: &str) -> Result<String, RelayError> {
        let room = room.trim();
        if room == GLOBAL_ROOM {
            return Err(RelayError::validation(
                Reason::CannotLeaveGlobal,
                "You cannot leave the global room.",
            ));
        }

        let mut table = self.table.lock().await;
        let is_member = table
            .presence
            .get(user)
            .is_some_and(|presence| presence.joined.contains(room));
        if !is_member {
            return Err(RelayError::validation(
                Reason::NotMember,
                format!("You are not in room '{room}'."),
            ));
        }

        if let Some(entry) = table.rooms.get_mut(room) {
            entry.members.remove(user);
        }
        let presence = table.presence_mut(user);
        presence.joined.remove(room);
        if presence.active == room {
            presence.active = GLOBAL_ROOM.to_string();
        }
        Ok(presence.active.clone())
    }

    /// Password-less rooms with member counts, sorted case-insensitively.
    pub async fn list_public_rooms(&self) -> Vec<RoomSummary> {
        let table = self.table.lock().await;
        let mut rooms: Vec<RoomSummary> = table
            .rooms
            .iter()
            .filter(|(_, room)| room.password.is_none())
            .map(|(name, room)| RoomSummary {
                name: name.clone(),
                members: room.members.len(),
            })
            .collect();
        rooms.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name))
        });
        rooms
    }

    /// Purges `user` from every room and forgets its presence. Returns the
    /// rooms the user belonged to, sorted by name.
    pub async fn remove_user_everywhere(&self, user: &str) -> Vec<String> {
        let mut table = self.table.lock().await;
        let mut affected: BTreeSet<String> = table
            .presence
            .remove(user)
            .map(|presence| presence.joined)
            .unwrap_or_default();
        for (name, room) in table.rooms.iter_mut() {
            if room.members.remove(user) {
                affected.insert(name.clone());
            }
        }
        affected.into_iter().collect()
    }

    /// Users whose active room is `room` right now.
    pub async fn active_members(&self, room: &str) -> Vec<String> {
        let table = self.table.lock().await;
        table
            .presence
            .iter()
            .filter(|(_, presence)| presence.active == room)
            .map(|(user, _)| user.clone())
            .collect()
    }

    pub async fn active_room(&self, user: &str) -> Option<String> {
        let table = self.table.lock().await;
        table.presence.get(user).map(|presence| presence.active.clone())
    }

    pub async fn joined_rooms(&self, user: &str) -> BTreeSet<String> {
        let table = self.table.lock().await;
        table
            .presence
            .get(user)
            .map(|presence| presence.joined.clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) async fn members(&self, room: &str) -> Option<BTreeSet<String>> {
        let table = self.table.lock().await;
        table.rooms.get(room).map(|room| room.members.clone())
    }

    #[cfg(test)]
    pub(crate) async fn is_protected(&self, room: &str) -> Option<bool> {
        let table = self.table.lock().await;
        table.rooms.get(room).map(|room| room.password.is_some())
    }
}

fn validate_room_name(room: &str) -> Result<String, RelayError> {
    let room = room.trim();
    if room.is_empty() {
        return Err(RelayError::validation(
            Reason::InvalidName,
            "Room name cannot be empty.",
        ));
    }
    if room.chars().any(char::is_control) {
        return Err(RelayError::validation(
            Reason::InvalidName,
            "Room name cannot contain control characters.",
        ));
    }
    Ok(room.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(result: Result<impl std::fmt::Debug, RelayError>) -> Reason {
        result
            .expect_err("operation should fail")
            .reason()
            .expect("reportable error")
    }

    #[tokio::test]
    async fn global_exists_and_is_public() {
        let rooms = RoomRegistry::new();
        assert_eq!(rooms.is_protected(GLOBAL_ROOM).await, Some(false));
        rooms.enter_global("alice").await;
        assert_eq!(rooms.active_room("alice").await.as_deref(), Some(GLOBAL_ROOM));
        assert_eq!(
            rooms.list_public_rooms().await,
            vec![RoomSummary {
                name: GLOBAL_ROOM.into(),
                members: 1
            }]
        );
    }

    #[tokio::test]
    async fn first_join_creates_room_with_password() {
        let rooms = RoomRegistry::new();
        rooms.enter_global("alice").await;

        let outcome = rooms
            .join_room("alice", "secret", Some("pw1"))
            .await
            .expect("create room");
        assert!(outcome.first_membership);
        assert_eq!(outcome.previous_active, GLOBAL_ROOM);
        assert_eq!(rooms.active_room("alice").await.as_deref(), Some("secret"));
        assert_eq!(rooms.is_protected("secret").await, Some(true));
        assert!(rooms.list_public_rooms().await.iter().all(|r| r.name != "secret"));
    }

    #[tokio::test]
    async fn password_gate_rejects_missing_and_wrong_passwords() {
        let rooms = RoomRegistry::new();
        rooms.join_room("alice", "secret", Some("pw1")).await.expect("create");
        rooms.enter_global("bob").await;

        assert_eq!(reason(rooms.join_room("bob", "secret", None).await), Reason::WrongPassword);
        assert_eq!(
            reason(rooms.join_room("bob", "secret", Some("nope")).await),
            Reason::WrongPassword
        );
        assert_eq!(rooms.active_room("bob").await.as_deref(), Some(GLOBAL_ROOM));
        assert_eq!(
            rooms.members("secret").await,
            Some(BTreeSet::from(["alice".to_string()]))
        );

        rooms.join_room("bob", "secret", Some("pw1")).await.expect("correct password");
        assert_eq!(rooms.active_room("bob").await.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn rejoin_skips_password_and_keeps_membership_single() {
        let rooms = RoomRegistry::new();
        rooms.join_room("alice", "secret", Some("pw1")).await.expect("create");
        rooms.join_room("alice", "lobby", None).await.expect("switch");

        let outcome = rooms
            .join_room("alice", "secret", Some("other"))
            .await
            .expect("re-entry ignores password");
        assert!(!outcome.first_membership);
        assert_eq!(outcome.previous_active, "lobby");
        assert_eq!(rooms.members("secret").await.map(|m| m.len()), Some(1));

        rooms.enter_global("bob").await;
        assert_eq!(
            reason(rooms.join_room("bob", "secret", Some("other")).await),
            Reason::WrongPassword
        );
        rooms.join_room("bob", "secret", Some("pw1")).await.expect("stored password unchanged");
    }

    #[tokio::test]
    async fn membership_accumulates_across_switches() {
        let rooms = RoomRegistry::new();
        rooms.enter_global("alice").await;
        rooms.join_room("alice", "one", None).await.expect("join one");
        rooms.join_room("alice", "two", None).await.expect("join two");

        assert_eq!(
            rooms.joined_rooms("alice").await,
            BTreeSet::from(["global".to_string(), "one".to_string(), "two".to_string()])
        );
        assert_eq!(rooms.active_members("one").await, Vec::<String>::new());
        assert_eq!(rooms.active_members("two").await, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn leave_rules() {
        let rooms = RoomRegistry::new();
        rooms.enter_global("alice").await;
        rooms.join_room("alice", "one", None).await.expect("join one");
        rooms.join_room("alice", "two", None).await.expect("join two");

        assert_eq!(reason(rooms.leave_room("alice", GLOBAL_ROOM).await), Reason::CannotLeaveGlobal);
        assert_eq!(reason(rooms.leave_room("alice", "nowhere").await), Reason::NotMember);

        // Leaving a non-active room keeps the active room.
        assert_eq!(rooms.leave_room("alice", "one").await.expect("leave one"), "two");
        // Leaving the active room falls back to global.
        assert_eq!(rooms.leave_room("alice", "two").await.expect("leave two"), GLOBAL_ROOM);
        assert_eq!(reason(rooms.leave_room("alice", "two").await), Reason::NotMember);
        assert!(rooms.members(GLOBAL_ROOM).await.expect("global").contains("alice"));
    }

    #[tokio::test]
    async fn empty_rooms_persist_and_are_listed_as_empty() {
        let rooms = RoomRegistry::new();
        rooms.enter_global("alice").await;
        rooms.join_room("alice", "Lobby", None).await.expect("join");
        rooms.join_room("alice", "attic", None).await.expect("join");
        rooms.leave_room("alice", "Lobby").await.expect("leave");

        let listing = rooms.list_public_rooms().await;
        let names: Vec<(&str, usize)> = listing.iter().map(|r| (r.name.as_str(), r.members)).collect();
        assert_eq!(names, vec![("attic", 1), ("global", 1), ("Lobby", 0)]);
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let rooms = RoomRegistry::new();
        assert_eq!(reason(rooms.join_room("alice", "   ", None).await), Reason::InvalidName);
        assert_eq!(reason(rooms.join_room("alice", "a\u{7}b", None).await), Reason::InvalidName);
    }

    #[tokio::test]
    async fn remove_everywhere_reports_all_rooms() {
        let rooms = RoomRegistry::new();
        rooms.enter_global("alice").await;
        rooms.join_room("alice", "secret", Some("pw1")).await.expect("join");

        let affected = rooms.remove_user_everywhere("alice").await;
        assert_eq!(affected, vec!["global".to_string(), "secret".to_string()]);
        assert_eq!(rooms.active_room("alice").await, None);
        assert_eq!(rooms.members("secret").await, Some(BTreeSet::new()));
        assert!(rooms.remove_user_everywhere("alice").await.is_empty());
    }
}
