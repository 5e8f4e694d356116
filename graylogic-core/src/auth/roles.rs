//! Roles and the permission matrix
//!
//! Roles are strictly ordered `panel < user < admin < owner`. The matrix is
//! static; `owner` holds a strict superset of `admin`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Account role, ordered by privilege
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Panel,
    User,
    Admin,
    Owner,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Panel => "panel",
            Self::User => "user",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "panel" => Ok(Self::Panel),
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            "owner" => Ok(Self::Owner),
            other => Err(Error::Validation(format!("unknown role '{other}'"))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    DeviceRead,
    DeviceWrite,
    DeviceConfigure,
    SceneRead,
    SceneActivate,
    SceneManage,
    UsersManage,
    PanelManage,
    SystemAdmin,
    SystemDangerous,
}

impl Permission {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceRead => "device:read",
            Self::DeviceWrite => "device:write",
            Self::DeviceConfigure => "device:configure",
            Self::SceneRead => "scene:read",
            Self::SceneActivate => "scene:activate",
            Self::SceneManage => "scene:manage",
            Self::UsersManage => "users:manage",
            Self::PanelManage => "panel:manage",
            Self::SystemAdmin => "system:admin",
            Self::SystemDangerous => "system:dangerous",
        }
    }
}

const PANEL_PERMS: &[Permission] = &[
    Permission::DeviceRead,
    Permission::DeviceWrite,
    Permission::SceneRead,
    Permission::SceneActivate,
];

const USER_PERMS: &[Permission] = &[
    Permission::DeviceRead,
    Permission::DeviceWrite,
    Permission::SceneRead,
    Permission::SceneActivate,
    Permission::SceneManage,
];

const ADMIN_PERMS: &[Permission] = &[
    Permission::DeviceRead,
    Permission::DeviceWrite,
    Permission::DeviceConfigure,
    Permission::SceneRead,
    Permission::SceneActivate,
    Permission::SceneManage,
    Permission::UsersManage,
    Permission::PanelManage,
    Permission::SystemAdmin,
];

const OWNER_PERMS: &[Permission] = &[
    Permission::DeviceRead,
    Permission::DeviceWrite,
    Permission::DeviceConfigure,
    Permission::SceneRead,
    Permission::SceneActivate,
    Permission::SceneManage,
    Permission::UsersManage,
    Permission::PanelManage,
    Permission::SystemAdmin,
    Permission::SystemDangerous,
];

/// Permissions granted to a role
#[must_use]
pub fn permissions_for(role: Role) -> &'static [Permission] {
    match role {
        Role::Panel => PANEL_PERMS,
        Role::User => USER_PERMS,
        Role::Admin => ADMIN_PERMS,
        Role::Owner => OWNER_PERMS,
    }
}

/// Whether a role holds a permission
#[must_use]
pub fn role_has(role: Role, permission: Permission) -> bool {
    permissions_for(role).contains(&permission)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_strictly_ordered() {
        assert!(Role::Panel < Role::User);
        assert!(Role::User < Role::Admin);
        assert!(Role::Admin < Role::Owner);
    }

    #[test]
    fn owner_is_strict_superset_of_admin() {
        for perm in permissions_for(Role::Admin) {
            assert!(role_has(Role::Owner, *perm), "owner missing {perm:?}");
        }
        assert!(role_has(Role::Owner, Permission::SystemDangerous));
        assert!(!role_has(Role::Admin, Permission::SystemDangerous));
    }

    #[test]
    fn panel_cannot_manage() {
        assert!(!role_has(Role::Panel, Permission::SceneManage));
        assert!(!role_has(Role::Panel, Permission::UsersManage));
        assert!(!role_has(Role::Panel, Permission::DeviceConfigure));
        assert!(role_has(Role::Panel, Permission::DeviceWrite));
    }

    #[test]
    fn user_cannot_configure_devices() {
        assert!(!role_has(Role::User, Permission::DeviceConfigure));
        assert!(role_has(Role::User, Permission::SceneManage));
    }

    #[test]
    fn role_round_trip() {
        for role in [Role::Panel, Role::User, Role::Admin, Role::Owner] {
            assert_eq!(Role::from_str(role.as_str()).unwrap(), role);
        }
        assert!(Role::from_str("root").is_err());
    }
}
