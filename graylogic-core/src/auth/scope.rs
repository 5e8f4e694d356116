//! Room scoping
//!
//! `RoomScope::Unrestricted` is the admin/owner case. For `user`-role
//! accounts the scope materializes from explicit grants; for panels it
//! derives from the panel's room set. An empty grant set means locked out:
//! list endpoints return empty and direct access is 403.

use std::collections::HashMap;

use crate::auth::panels::PanelContext;
use crate::auth::roles::Role;
use crate::auth::users::RoomGrant;
use crate::error::{Error, Result};

/// The set of rooms a caller may observe and operate
#[derive(Debug, Clone)]
pub enum RoomScope {
    /// Admin and owner: no filtering
    Unrestricted,
    /// Explicit room set with per-room scene-management bits
    Rooms {
        room_ids: Vec<String>,
        can_manage_scenes: HashMap<String, bool>,
    },
}

impl RoomScope {
    /// Build from user grants
    #[must_use]
    pub fn from_grants(grants: &[RoomGrant]) -> Self {
        Self::Rooms {
            room_ids: grants.iter().map(|g| g.room_id.clone()).collect(),
            can_manage_scenes: grants
                .iter()
                .map(|g| (g.room_id.clone(), g.can_manage_scenes))
                .collect(),
        }
    }

    /// Build from a panel context; panels never manage scenes
    #[must_use]
    pub fn from_panel(panel: &PanelContext) -> Self {
        Self::Rooms {
            room_ids: panel.room_ids.clone(),
            can_manage_scenes: HashMap::new(),
        }
    }

    /// Scope for a role with no materialized grants
    #[must_use]
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Admin | Role::Owner => Self::Unrestricted,
            Role::User | Role::Panel => Self::Rooms {
                room_ids: Vec::new(),
                can_manage_scenes: HashMap::new(),
            },
        }
    }

    /// Whether a room is visible. `None` room ids (unplaced devices or
    /// site-wide scenes) are visible only to unrestricted callers.
    #[must_use]
    pub fn admits(&self, room_id: Option<&str>) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Rooms { room_ids, .. } => match room_id {
                Some(room_id) => room_ids.iter().any(|r| r == room_id),
                None => false,
            },
        }
    }

    /// Whether the caller may manage scenes in a room
    #[must_use]
    pub fn can_manage_scenes(&self, room_id: &str) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Rooms {
                can_manage_scenes, ..
            } => can_manage_scenes.get(room_id).copied().unwrap_or(false),
        }
    }

    /// 403 unless the room is admitted
    pub fn require(&self, room_id: Option<&str>) -> Result<()> {
        if self.admits(room_id) {
            Ok(())
        } else {
            Err(Error::Forbidden("room outside caller scope".to_string()))
        }
    }

    /// Filter a slice of items by their room id
    pub fn filter<T>(&self, items: Vec<T>, room_of: impl Fn(&T) -> Option<String>) -> Vec<T> {
        match self {
            Self::Unrestricted => items,
            Self::Rooms { .. } => items
                .into_iter()
                .filter(|item| self.admits(room_of(item).as_deref()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scoped(rooms: &[&str]) -> RoomScope {
        RoomScope::from_grants(
            &rooms
                .iter()
                .map(|r| RoomGrant {
                    room_id: (*r).to_string(),
                    can_manage_scenes: false,
                })
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn unrestricted_admits_everything() {
        let scope = RoomScope::Unrestricted;
        assert!(scope.admits(Some("any")));
        assert!(scope.admits(None));
        assert!(scope.can_manage_scenes("any"));
    }

    #[test]
    fn empty_scope_locks_out() {
        let scope = scoped(&[]);
        assert!(!scope.admits(Some("r1")));
        assert!(!scope.admits(None));
        assert!(scope.require(Some("r1")).is_err());
        let filtered = scope.filter(vec!["a", "b"], |_| Some("r1".to_string()));
        assert!(filtered.is_empty());
    }

    #[test]
    fn scoped_rooms_filter_exactly() {
        let scope = scoped(&["r1", "r2"]);
        assert!(scope.admits(Some("r1")));
        assert!(!scope.admits(Some("r3")));
        // Unplaced entities are not visible to scoped callers
        assert!(!scope.admits(None));

        let items = vec![("a", Some("r1")), ("b", Some("r3")), ("c", None)];
        let filtered = scope.filter(items, |(_, room)| room.map(str::to_string));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].0, "a");
    }

    #[test]
    fn scene_management_bit_is_per_room() {
        let scope = RoomScope::from_grants(&[
            RoomGrant {
                room_id: "r1".into(),
                can_manage_scenes: true,
            },
            RoomGrant {
                room_id: "r2".into(),
                can_manage_scenes: false,
            },
        ]);
        assert!(scope.can_manage_scenes("r1"));
        assert!(!scope.can_manage_scenes("r2"));
        assert!(!scope.can_manage_scenes("r3"));
    }

    #[test]
    fn panel_scope_never_manages_scenes() {
        let panel = PanelContext {
            panel_id: "p1".into(),
            name: "Hall".into(),
            room_ids: vec!["r1".into()],
        };
        let scope = RoomScope::from_panel(&panel);
        assert!(scope.admits(Some("r1")));
        assert!(!scope.can_manage_scenes("r1"));
    }
}
