use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub id: String,
    pub scopes: HashSet<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub claims: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub scopes: HashSet<String>,
    pub claims: BTreeMap<String, String>,
}

fn token_hash(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Splits a scope string on any of `,`, space, `\n`, `\t` into a set.
pub fn parse_scopes(raw: &str) -> HashSet<String> {
    raw.split(|c: char| c == ',' || c == ' ' || c == '\n' || c == '\t')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

pub fn format_scopes(scopes: &HashSet<String>) -> String {
    let mut sorted: Vec<&String> = scopes.iter().collect();
    sorted.sort();
    sorted
        .into_iter()
        .cloned()
        .collect::<Vec<_>>()
        .join(",")
}

pub fn has_scope(scopes: &HashSet<String>, want: &str) -> bool {
    scopes.contains("*") || scopes.contains(want)
}

/// SHA-256-indexed bearer token registry. A single `RwLock` guards both reads
/// (lookup) and writes (create); expired records are evicted lazily on
/// lookup rather than swept on a timer.
pub struct TokenStore {
    by_hash: RwLock<HashMap<String, TokenRecord>>,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore {
    pub fn new() -> Self {
        Self {
            by_hash: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent: creating a token whose raw value already has a stored
    /// record silently succeeds without overwriting it.
    pub fn create(
        &self,
        id: &str,
        raw: &str,
        scopes: HashSet<String>,
        expires_at: Option<DateTime<Utc>>,
        claims: BTreeMap<String, String>,
    ) -> Result<(), &'static str> {
        if id.is_empty() {
            return Err("token id must not be empty");
        }
        if raw.is_empty() {
            return Err("token value must not be empty");
        }
        if scopes.is_empty() {
            return Err("token must have at least one scope");
        }
        let hash = token_hash(raw);
        let mut store = self.by_hash.write().expect("token store lock poisoned");
        if store.contains_key(&hash) {
            return Ok(());
        }
        store.insert(
            hash,
            TokenRecord {
                id: id.to_string(),
                scopes,
                expires_at,
                claims,
            },
        );
        Ok(())
    }

    /// No-op if `raw` is empty; otherwise creates an unscoped-expiry,
    /// wildcard-scoped `"bootstrap"` token the way an operator-supplied
    /// bootstrap secret does.
    pub fn ensure_bootstrap_token(&self, raw: &str) {
        if raw.is_empty() {
            return;
        }
        let _ = self.create(
            "bootstrap",
            raw,
            HashSet::from(["*".to_string()]),
            None,
            BTreeMap::new(),
        );
    }

    pub fn lookup(&self, raw: &str) -> Option<Principal> {
        if raw.is_empty() {
            return None;
        }
        let hash = token_hash(raw);
        let record = {
            let store = self.by_hash.read().expect("token store lock poisoned");
            store.get(&hash).cloned()
        }?;
        if let Some(expires_at) = record.expires_at
            && expires_at <= Utc::now()
        {
            let mut store = self.by_hash.write().expect("token store lock poisoned");
            store.remove(&hash);
            return None;
        }
        Some(Principal {
            id: record.id,
            scopes: record.scopes,
            claims: record.claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn parse_scopes_splits_on_all_delimiters() {
        let scopes = parse_scopes("a, b\tc\nd   e");
        assert_eq!(
            scopes,
            HashSet::from(["a", "b", "c", "d", "e"].map(String::from))
        );
    }

    #[test]
    fn parse_scopes_then_format_scopes_round_trips_as_a_set() {
        let original = HashSet::from(["harness-run:read", "audit:read"].map(String::from));
        let formatted = format_scopes(&original);
        let reparsed = parse_scopes(&formatted);
        assert_eq!(reparsed, original);
    }

    #[test]
    fn has_scope_recognizes_wildcard() {
        let scopes = HashSet::from(["*".to_string()]);
        assert!(has_scope(&scopes, "anything:at-all"));
    }

    #[test]
    fn has_scope_requires_exact_match_without_wildcard() {
        let scopes = HashSet::from(["harness-run:read".to_string()]);
        assert!(has_scope(&scopes, "harness-run:read"));
        assert!(!has_scope(&scopes, "harness-run:write"));
    }

    #[test]
    fn create_then_lookup_round_trips_scopes_and_claims() {
        let store = TokenStore::new();
        let mut claims = BTreeMap::new();
        claims.insert("sessionID".to_string(), "abc".to_string());
        store
            .create(
                "tok-1",
                "raw-secret",
                HashSet::from(["harness-run:read".to_string()]),
                None,
                claims.clone(),
            )
            .unwrap();
        let principal = store.lookup("raw-secret").unwrap();
        assert_eq!(principal.id, "tok-1");
        assert_eq!(principal.claims, claims);
    }

    #[test]
    fn create_is_idempotent_for_the_same_raw_value() {
        let store = TokenStore::new();
        store
            .create("a", "raw", HashSet::from(["x".to_string()]), None, BTreeMap::new())
            .unwrap();
        store
            .create("b", "raw", HashSet::from(["y".to_string()]), None, BTreeMap::new())
            .unwrap();
        let principal = store.lookup("raw").unwrap();
        assert_eq!(principal.id, "a");
    }

    #[test]
    fn lookup_evicts_expired_tokens() {
        let store = TokenStore::new();
        store
            .create(
                "a",
                "raw",
                HashSet::from(["x".to_string()]),
                Some(Utc::now() - Duration::seconds(1)),
                BTreeMap::new(),
            )
            .unwrap();
        assert!(store.lookup("raw").is_none());
        assert!(store.lookup("raw").is_none());
    }

    #[test]
    fn ensure_bootstrap_token_is_a_no_op_when_raw_is_empty() {
        let store = TokenStore::new();
        store.ensure_bootstrap_token("");
        assert!(store.lookup("").is_none());
    }

    #[test]
    fn ensure_bootstrap_token_grants_wildcard_scope() {
        let store = TokenStore::new();
        store.ensure_bootstrap_token("bootstrap-secret");
        let principal = store.lookup("bootstrap-secret").unwrap();
        assert!(has_scope(&principal.scopes, "anything"));
    }

    #[test]
    fn create_rejects_empty_fields() {
        let store = TokenStore::new();
        assert!(store.create("", "raw", HashSet::from(["x".to_string()]), None, BTreeMap::new()).is_err());
        assert!(store.create("id", "", HashSet::from(["x".to_string()]), None, BTreeMap::new()).is_err());
        assert!(store.create("id", "raw", HashSet::new(), None, BTreeMap::new()).is_err());
    }
}
