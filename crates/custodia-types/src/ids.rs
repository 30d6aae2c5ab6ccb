//! Identifiers used throughout Custodia.
//!
//! Engine-generated IDs use UUIDv7 for time-ordered lexicographic sorting.
//! `ReferenceId` is caller-supplied (trade id, withdrawal id, ...) and doubles
//! as the idempotency key.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// UserId
// ---------------------------------------------------------------------------

/// Unique identifier for a platform user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// OwnerId
// ---------------------------------------------------------------------------

/// Owner of an account. Accounts are keyed by `(OwnerId, currency)`, so the
/// single `LiquidityPool` owner yields one pool account per currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum OwnerId {
    /// An ordinary platform user.
    User(UserId),
    /// Platform fee revenue.
    AdminRevenue,
    /// Platform-owned reserves that fund payouts.
    LiquidityPool,
}

impl OwnerId {
    /// The user behind this owner, if it is a user account.
    #[must_use]
    pub fn user(&self) -> Option<UserId> {
        match self {
            Self::User(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether this owner is the platform's reserve pool.
    #[must_use]
    pub fn is_pool(&self) -> bool {
        matches!(self, Self::LiquidityPool)
    }
}

impl From<UserId> for OwnerId {
    fn from(id: UserId) -> Self {
        Self::User(id)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::AdminRevenue => write!(f, "admin:revenue"),
            Self::LiquidityPool => write!(f, "admin:liquidity_pool"),
        }
    }
}

// ---------------------------------------------------------------------------
// ReferenceId
// ---------------------------------------------------------------------------

/// Caller-supplied correlation key (trade id, withdrawal id, payout id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ReferenceId(pub String);

impl ReferenceId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive a child reference, e.g. `wd-1` → `wd-1:fee`.
    #[must_use]
    pub fn child(&self, suffix: &str) -> Self {
        Self(format!("{}:{suffix}", self.0))
    }
}

impl From<&str> for ReferenceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ReferenceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// EntryId / LockId
// ---------------------------------------------------------------------------

/// Identifier of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct EntryId(pub Uuid);

impl EntryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry:{}", self.0)
    }
}

/// Identifier of an escrow lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct LockId(pub Uuid);

impl LockId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ActorId
// ---------------------------------------------------------------------------

/// Identity of an operator acting on the engine (dispute resolution,
/// withdrawal approval). Authentication happens outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ActorId(pub Uuid);

impl ActorId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_ordering() {
        let a = UserId::new();
        let b = UserId::new();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn owner_display() {
        assert_eq!(OwnerId::AdminRevenue.to_string(), "admin:revenue");
        assert_eq!(OwnerId::LiquidityPool.to_string(), "admin:liquidity_pool");
        let user = UserId::new();
        assert_eq!(OwnerId::from(user).to_string(), format!("user:{user}"));
        assert_eq!(OwnerId::from(user).user(), Some(user));
        assert!(OwnerId::LiquidityPool.is_pool());
    }

    #[test]
    fn reference_child() {
        let r = ReferenceId::from("wd-1");
        assert_eq!(r.child("fee").as_str(), "wd-1:fee");
    }

    #[test]
    fn owner_serde_is_tagged() {
        let json = serde_json::to_string(&OwnerId::AdminRevenue).unwrap();
        assert!(json.contains(r#""type":"admin_revenue""#), "Got: {json}");
        let back: OwnerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, OwnerId::AdminRevenue);
        let user = OwnerId::User(UserId::new());
        let back: OwnerId = serde_json::from_str(&serde_json::to_string(&user).unwrap()).unwrap();
        assert_eq!(user, back);
    }
}
