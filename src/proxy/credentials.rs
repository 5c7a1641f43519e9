// Credential store - upstream key pool with round-robin selection, plus the
// bearer-token allow-list clients authenticate with

use parking_lot::{Mutex, RwLock};

#[derive(Debug, Default)]
struct KeyPool {
    keys: Vec<String>,
    cursor: usize,
}

/// In-memory credential pools. Built once at startup and shared through the
/// server state; nothing is persisted.
#[derive(Debug, Default)]
pub struct CredentialStore {
    api_keys: Mutex<KeyPool>,
    auth_tokens: RwLock<Vec<String>>,
}

impl CredentialStore {
    pub fn new<K, T>(api_keys: K, auth_tokens: T) -> Self
    where
        K: IntoIterator<Item = String>,
        T: IntoIterator<Item = String>,
    {
        let store = Self::default();
        for key in api_keys {
            store.add_api_key(&key);
        }
        for token in auth_tokens {
            store.add_auth_token(&token);
        }
        store
    }

    /// Next upstream key in round-robin order, `None` when the pool is empty.
    pub fn next_api_key(&self) -> Option<String> {
        let mut pool = self.api_keys.lock();
        if pool.keys.is_empty() {
            return None;
        }
        if pool.cursor >= pool.keys.len() {
            pool.cursor = 0;
        }
        let key = pool.keys[pool.cursor].clone();
        pool.cursor = (pool.cursor + 1) % pool.keys.len();
        Some(key)
    }

    /// Returns `true` if the key was not already pooled.
    pub fn add_api_key(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        let mut pool = self.api_keys.lock();
        if pool.keys.iter().any(|k| k == key) {
            return false;
        }
        pool.keys.push(key.to_string());
        tracing::info!("Added API Key: {}", mask_credential(key));
        true
    }

    /// Returns `true` if the key was pooled.
    pub fn remove_api_key(&self, key: &str) -> bool {
        let mut pool = self.api_keys.lock();
        let Some(index) = pool.keys.iter().position(|k| k == key) else {
            return false;
        };
        pool.keys.remove(index);
        if pool.cursor >= pool.keys.len() {
            pool.cursor = 0;
        }
        tracing::info!("Removed API Key: {}", mask_credential(key));
        true
    }

    pub fn list_api_keys(&self) -> Vec<String> {
        self.api_keys.lock().keys.clone()
    }

    pub fn add_auth_token(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let mut tokens = self.auth_tokens.write();
        if tokens.iter().any(|t| t == token) {
            return false;
        }
        tokens.push(token.to_string());
        tracing::info!("Added auth token: {}", mask_credential(token));
        true
    }

    pub fn remove_auth_token(&self, token: &str) -> bool {
        let mut tokens = self.auth_tokens.write();
        let before = tokens.len();
        tokens.retain(|t| t != token);
        let removed = tokens.len() != before;
        if removed {
            tracing::info!("Removed auth token: {}", mask_credential(token));
        }
        removed
    }

    pub fn list_auth_tokens(&self) -> Vec<String> {
        self.auth_tokens.read().clone()
    }

    pub fn is_valid_auth_token(&self, token: &str) -> bool {
        self.auth_tokens.read().iter().any(|t| t == token)
    }
}

/// `first8...last4`, or `first4...` for credentials of 12 characters or fewer.
pub fn mask_credential(credential: &str) -> String {
    let chars: Vec<char> = credential.chars().collect();
    if chars.len() <= 12 {
        let head: String = chars.iter().take(4).collect();
        return format!("{}...", head);
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
