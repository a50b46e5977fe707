//! Connection permissions
//!
//! A connection's effective permissions are the configured global tier,
//! narrowed by the network tier for non-loopback peers, by the intents the
//! client asked for, and by the unauthenticated tier until it proves it
//! knows the shared secret.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, Not};

use serde::{Deserialize, Serialize};

use crate::config::WebSocketSettings;

/// Permission bit set
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    /// Watch properties and receive session lists
    pub const READ: Permissions = Permissions(1);
    /// Set writable properties
    pub const WRITE_PROPERTIES: Permissions = Permissions(2);
    /// Add, remove, reconfigure and restart sessions; see invalid sessions
    pub const CONFIGURE_SESSIONS: Permissions = Permissions(4);
    /// Receive raw tap data
    pub const TAP_STREAM: Permissions = Permissions(8);
    pub const ALL: Permissions = Permissions(15);

    pub const fn from_bits(bits: u32) -> Self {
        Permissions(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when every bit of `other` is present
    pub fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitAnd for Permissions {
    type Output = Permissions;

    fn bitand(self, rhs: Self) -> Self {
        Permissions(self.0 & rhs.0)
    }
}

impl BitAndAssign for Permissions {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Self) -> Self {
        Permissions(self.0 | rhs.0)
    }
}

impl Not for Permissions {
    type Output = Permissions;

    fn not(self) -> Self {
        Permissions(!self.0 & Self::ALL.0)
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::READ, "Read"),
            (Self::WRITE_PROPERTIES, "WriteProperties"),
            (Self::CONFIGURE_SESSIONS, "ConfigureSessions"),
            (Self::TAP_STREAM, "TapStream"),
        ]
        .into_iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, name)| name)
        .collect();
        write!(f, "Permissions({})", names.join("|"))
    }
}

/// Outcome of evaluating the tiers for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectivePermissions {
    pub permissions: Permissions,
    /// Whether `Authenticate` could grant more than the connection has now
    pub can_authenticate: bool,
}

/// Combine the configured tiers for one connection
pub fn evaluate(
    settings: &WebSocketSettings,
    intents: Permissions,
    is_local: bool,
    authenticated: bool,
) -> EffectivePermissions {
    let mut permissions = settings.global_permissions & intents;
    if !is_local {
        permissions &= settings.network_permissions;
    }

    let mut can_authenticate = false;
    if !authenticated {
        let unauthenticated = settings.unauthenticated_permissions;
        can_authenticate = settings.secret.as_deref().is_some_and(|s| !s.is_empty())
            && (permissions & unauthenticated) != permissions;
        permissions &= unauthenticated;
    }

    EffectivePermissions {
        permissions,
        can_authenticate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(secret: Option<&str>) -> WebSocketSettings {
        WebSocketSettings {
            secret: secret.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_local_unauthenticated_without_secret() {
        let result = evaluate(&settings(None), Permissions::ALL, true, false);
        assert_eq!(result.permissions, Permissions::READ | Permissions::TAP_STREAM);
        assert!(!result.can_authenticate);
    }

    #[test]
    fn test_secret_unlocks_gap() {
        let s = settings(Some("hunter2"));
        let before = evaluate(&s, Permissions::ALL, true, false);
        assert!(before.can_authenticate);
        let after = evaluate(&s, Permissions::ALL, true, true);
        assert_eq!(after.permissions, Permissions::ALL);
        assert!(!after.can_authenticate);
    }

    #[test]
    fn test_network_tier_applies_to_remote_only() {
        let s = settings(Some("x"));
        let remote = evaluate(&s, Permissions::ALL, false, true);
        assert_eq!(remote.permissions, Permissions::READ | Permissions::WRITE_PROPERTIES);
        let local = evaluate(&s, Permissions::ALL, true, true);
        assert!(local.permissions.contains(Permissions::CONFIGURE_SESSIONS));
    }

    #[test]
    fn test_intents_narrow_and_hide_auth() {
        let s = settings(Some("x"));
        let result = evaluate(&s, Permissions::READ, true, false);
        assert_eq!(result.permissions, Permissions::READ);
        assert!(!result.can_authenticate);
    }

    #[test]
    fn test_bit_ops() {
        assert_eq!(!Permissions::READ, Permissions::from_bits(14));
        assert_eq!(Permissions::from_bits(0xFF), Permissions::ALL);
        assert_eq!(format!("{:?}", Permissions::READ | Permissions::TAP_STREAM), "Permissions(Read|TapStream)");
    }
}
