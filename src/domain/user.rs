// =============================================================================
// User — identity record
// =============================================================================
//
// The core treats `user_id` as an opaque, non-empty string supplied by the
// out-of-scope registration/auth surface. Every user-scoped record carries
// it, and every persistence query must filter by it (see `persistence::Store`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    /// Never logged or serialized back out over the wire in full; kept here
    /// only because the persistence store owns the row.
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    /// Soft-delete flag — users are never hard-deleted.
    #[serde(default)]
    pub deleted: bool,
}

impl User {
    pub fn is_active(&self) -> bool {
        !self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_deleted_user_is_not_active() {
        let user = User {
            id: "u1".into(),
            email: "a@example.com".into(),
            password_hash: "x".into(),
            created_at: Utc::now(),
            deleted: true,
        };
        assert!(!user.is_active());
    }
}
