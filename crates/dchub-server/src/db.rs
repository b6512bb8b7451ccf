//! User and profile database interface.
//!
//! The hub consumes this as an external collaborator: a key-value
//! provider with two key spaces, `profiles` (name → permission map with
//! transitive `parent` merge) and `users` (nick → registration record).
//! The trait is synchronous and `Clone`-free on purpose; implementations
//! share state behind `Arc` and the hub holds an `Arc<dyn UserDatabase>`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Database errors. The hub maps these to [`crate::HubError::Database`].
#[derive(Debug, Error)]
pub enum DbError {
    /// Stored bytes failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serde(String),
    /// Backend failure.
    #[error("storage error: {0}")]
    Storage(String),
    /// A profile's `parent` chain loops.
    #[error("profile parent cycle at {0:?}")]
    ParentCycle(String),
}

/// A user profile: a free-form permission map plus an optional parent
/// profile whose permissions are merged in transitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Profile {
    /// Parent profile name; its permissions apply unless overridden.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Permission flags and settings.
    #[serde(flatten)]
    pub perms: serde_json::Map<String, serde_json::Value>,
}

impl Profile {
    /// Boolean permission lookup on this (already resolved) profile.
    #[must_use]
    pub fn can(&self, perm: &str) -> bool {
        matches!(self.perms.get(perm), Some(serde_json::Value::Bool(true)))
    }
}

/// Built-in profile names the hub knows about.
pub mod profiles {
    /// Hub owner.
    pub const ROOT: &str = "root";
    /// Operator.
    pub const OPERATOR: &str = "op";
    /// Registered user with no extra rights.
    pub const USER: &str = "user";
}

/// Permission names used by the hub core.
pub mod perms {
    /// Shown in op lists, may kick.
    pub const OP: &str = "hub.op";
    /// Owner; implies everything.
    pub const OWNER: &str = "hub.owner";
}

/// A registered user's record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserRecord {
    /// Login secret. Kept cleartext because the ADC password proof is
    /// `Tiger(password || nonce)` and needs the original bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    /// Profile name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    /// Ban expiry, seconds since the Unix epoch. A value in the past
    /// is ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ban_until: Option<u64>,
    /// Operator notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl UserRecord {
    /// Whether the record carries an active ban.
    #[must_use]
    pub fn is_banned(&self) -> bool {
        let Some(until) = self.ban_until else { return false };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        until > now
    }
}

/// The storage interface the hub consumes.
pub trait UserDatabase: Send + Sync + 'static {
    /// Load a profile by name.
    fn get_profile(&self, name: &str) -> Result<Option<Profile>, DbError>;
    /// Store a profile.
    fn put_profile(&self, name: &str, profile: &Profile) -> Result<(), DbError>;
    /// Delete a profile. Deleting a missing profile is a no-op.
    fn del_profile(&self, name: &str) -> Result<(), DbError>;
    /// List profile names. Order is not guaranteed.
    fn list_profiles(&self) -> Result<Vec<String>, DbError>;

    /// Load a user record by nick.
    fn get_user(&self, nick: &str) -> Result<Option<UserRecord>, DbError>;
    /// Store a user record.
    fn put_user(&self, nick: &str, rec: &UserRecord) -> Result<(), DbError>;
    /// Delete a user record. Deleting a missing record is a no-op.
    fn del_user(&self, nick: &str) -> Result<(), DbError>;
    /// List registered nicks. Order is not guaranteed.
    fn list_users(&self) -> Result<Vec<String>, DbError>;
}

/// Resolve a profile with its transitive parents merged in.
///
/// Child keys win over parent keys. A `parent` cycle is an error.
pub fn resolve_profile(
    db: &dyn UserDatabase,
    name: &str,
) -> Result<Option<Profile>, DbError> {
    let Some(mut profile) = db.get_profile(name)? else {
        return Ok(None);
    };
    let mut seen = vec![name.to_string()];
    let mut parent = profile.parent.clone();
    while let Some(pname) = parent {
        if seen.contains(&pname) {
            return Err(DbError::ParentCycle(pname));
        }
        seen.push(pname.clone());
        let Some(p) = db.get_profile(&pname)? else { break };
        for (k, v) in &p.perms {
            profile.perms.entry(k.clone()).or_insert_with(|| v.clone());
        }
        parent = p.parent.clone();
    }
    profile.parent = None;
    Ok(Some(profile))
}

/// In-memory database, the default when no backend is configured.
///
/// Seeds the built-in `root`, `op` and `user` profiles.
#[derive(Default)]
pub struct MemoryDatabase {
    profiles: RwLock<HashMap<String, Profile>>,
    users: RwLock<HashMap<String, UserRecord>>,
}

impl MemoryDatabase {
    /// Empty database with the built-in profiles seeded.
    #[must_use]
    pub fn new() -> MemoryDatabase {
        let db = MemoryDatabase::default();
        {
            let mut p = db.profiles.write().expect("profiles lock poisoned");
            p.insert(profiles::USER.to_string(), Profile::default());
            let mut op = Profile {
                parent: Some(profiles::USER.to_string()),
                perms: serde_json::Map::new(),
            };
            op.perms.insert(perms::OP.to_string(), serde_json::Value::Bool(true));
            p.insert(profiles::OPERATOR.to_string(), op);
            let mut root = Profile {
                parent: Some(profiles::OPERATOR.to_string()),
                perms: serde_json::Map::new(),
            };
            root.perms.insert(perms::OWNER.to_string(), serde_json::Value::Bool(true));
            p.insert(profiles::ROOT.to_string(), root);
        }
        db
    }
}

impl UserDatabase for MemoryDatabase {
    fn get_profile(&self, name: &str) -> Result<Option<Profile>, DbError> {
        Ok(self.profiles.read().expect("profiles lock poisoned").get(name).cloned())
    }

    fn put_profile(&self, name: &str, profile: &Profile) -> Result<(), DbError> {
        self.profiles
            .write()
            .expect("profiles lock poisoned")
            .insert(name.to_string(), profile.clone());
        Ok(())
    }

    fn del_profile(&self, name: &str) -> Result<(), DbError> {
        self.profiles.write().expect("profiles lock poisoned").remove(name);
        Ok(())
    }

    fn list_profiles(&self) -> Result<Vec<String>, DbError> {
        Ok(self.profiles.read().expect("profiles lock poisoned").keys().cloned().collect())
    }

    fn get_user(&self, nick: &str) -> Result<Option<UserRecord>, DbError> {
        Ok(self.users.read().expect("users lock poisoned").get(nick).cloned())
    }

    fn put_user(&self, nick: &str, rec: &UserRecord) -> Result<(), DbError> {
        self.users.write().expect("users lock poisoned").insert(nick.to_string(), rec.clone());
        Ok(())
    }

    fn del_user(&self, nick: &str) -> Result<(), DbError> {
        self.users.write().expect("users lock poisoned").remove(nick);
        Ok(())
    }

    fn list_users(&self) -> Result<Vec<String>, DbError> {
        Ok(self.users.read().expect("users lock poisoned").keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_json_round_trip() {
        let mut p = Profile { parent: Some("user".to_string()), perms: serde_json::Map::new() };
        p.perms.insert("hub.op".to_string(), serde_json::Value::Bool(true));
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"parent\":\"user\""));
        assert!(json.contains("\"hub.op\":true"));
        let back: Profile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn resolve_merges_parents() {
        let db = MemoryDatabase::new();
        let root = resolve_profile(&db, profiles::ROOT).unwrap().unwrap();
        assert!(root.can(perms::OWNER));
        assert!(root.can(perms::OP), "op permission inherited through parent chain");
        assert!(root.parent.is_none());
    }

    #[test]
    fn resolve_detects_cycles() {
        let db = MemoryDatabase::new();
        db.put_profile(
            "a",
            &Profile { parent: Some("b".to_string()), perms: serde_json::Map::new() },
        )
        .unwrap();
        db.put_profile(
            "b",
            &Profile { parent: Some("a".to_string()), perms: serde_json::Map::new() },
        )
        .unwrap();
        assert!(matches!(resolve_profile(&db, "a"), Err(DbError::ParentCycle(_))));
    }

    #[test]
    fn child_overrides_parent() {
        let db = MemoryDatabase::new();
        let mut limited = Profile {
            parent: Some(profiles::OPERATOR.to_string()),
            perms: serde_json::Map::new(),
        };
        limited.perms.insert(perms::OP.to_string(), serde_json::Value::Bool(false));
        db.put_profile("limited", &limited).unwrap();
        let resolved = resolve_profile(&db, "limited").unwrap().unwrap();
        assert!(!resolved.can(perms::OP));
    }

    #[test]
    fn ban_expiry() {
        let expired = UserRecord { ban_until: Some(1), ..UserRecord::default() };
        assert!(!expired.is_banned());
        let future = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600;
        let active = UserRecord { ban_until: Some(future), ..UserRecord::default() };
        assert!(active.is_banned());
    }
}
