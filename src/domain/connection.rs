// =============================================================================
// Connection — an encrypted set of exchange API credentials owned by one user
// =============================================================================
//
// Credentials are stored only in encrypted form, tagged with the key version
// used to encrypt them (`crypto::KeyManager`). Decryption happens on demand
// inside `gateway::pool::GatewayPool::get_or_create`, never eagerly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which concrete exchange a connection talks to. The engine only ever
/// depends on the abstract `Gateway` capability; this tag selects which
/// concrete implementation the gateway factory builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeType {
    Binance,
    Mock,
}

impl std::fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binance => write!(f, "BINANCE"),
            Self::Mock => write!(f, "MOCK"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub exchange_type: ExchangeType,
    /// Base64-encoded ciphertext; never the plaintext key.
    pub encrypted_api_key: String,
    /// Base64-encoded ciphertext; never the plaintext secret.
    pub encrypted_api_secret: String,
    pub key_version: u32,
    pub active: bool,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    pub fn is_usable_by(&self, user_id: &str) -> bool {
        self.active && self.user_id == user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Connection {
        Connection {
            id: "conn-1".into(),
            user_id: "user-1".into(),
            exchange_type: ExchangeType::Binance,
            encrypted_api_key: "cipher-key".into(),
            encrypted_api_secret: "cipher-secret".into(),
            key_version: 1,
            active: true,
            name: "main".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn usable_only_by_owning_active_user() {
        let conn = sample();
        assert!(conn.is_usable_by("user-1"));
        assert!(!conn.is_usable_by("user-2"));
    }

    #[test]
    fn inactive_connection_is_never_usable() {
        let mut conn = sample();
        conn.active = false;
        assert!(!conn.is_usable_by("user-1"));
    }
}
