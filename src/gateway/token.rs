//! A per-owner cache of gateway access tokens.

use std::{collections::HashMap, sync::RwLock};

use time::{Duration, OffsetDateTime};

use crate::UserID;

/// How long a freshly issued token is treated as valid.
///
/// The gateway issues tokens for an hour, they are refreshed five minutes early.
pub const TOKEN_LIFETIME: Duration = Duration::seconds(3300);

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: OffsetDateTime,
}

/// Access tokens keyed by the owner of the credentials they were issued for.
///
/// Concurrent callers may both miss the cache and fetch a token, the last
/// write wins. Both tokens are valid so this only costs an extra request.
#[derive(Debug, Default)]
pub struct TokenCache {
    tokens: RwLock<HashMap<UserID, CachedToken>>,
}

impl TokenCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached token for `owner` if it is still valid at `now`.
    pub fn get(&self, owner: UserID, now: OffsetDateTime) -> Option<String> {
        let tokens = match self.tokens.read() {
            Ok(tokens) => tokens,
            Err(poisoned) => poisoned.into_inner(),
        };

        tokens
            .get(&owner)
            .filter(|token| now < token.expires_at)
            .map(|token| token.access_token.clone())
    }

    /// Cache `access_token` for `owner`, issued at `issued_at`.
    pub fn insert(&self, owner: UserID, access_token: String, issued_at: OffsetDateTime) {
        let mut tokens = match self.tokens.write() {
            Ok(tokens) => tokens,
            Err(poisoned) => poisoned.into_inner(),
        };

        tokens.insert(
            owner,
            CachedToken {
                access_token,
                expires_at: issued_at + TOKEN_LIFETIME,
            },
        );
    }

    /// Drop the cached token for `owner`, e.g. after their credentials change.
    pub fn invalidate(&self, owner: UserID) {
        let mut tokens = match self.tokens.write() {
            Ok(tokens) => tokens,
            Err(poisoned) => poisoned.into_inner(),
        };

        tokens.remove(&owner);
    }
}
