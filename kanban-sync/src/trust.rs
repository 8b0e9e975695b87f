//! Trusted-token set consulted before a connection reaches the dispatcher.
//!
//! Tokens are opaque strings presented in the `trust` cookie of the upgrade
//! request. How they are issued is up to the deployment; the server only
//! checks membership.

use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Cookie carrying the trust token.
pub const TRUST_COOKIE: &str = "trust";

#[derive(Debug, Default)]
pub struct TrustStore {
    tokens: RwLock<HashSet<String>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        for token in tokens {
            store.trust(token);
        }
        store
    }

    /// Add a token. Empty tokens are ignored. Returns `true` if it was new.
    pub fn trust(&self, token: impl Into<String>) -> bool {
        let token = token.into();
        if token.is_empty() {
            return false;
        }
        self.write().insert(token)
    }

    pub fn is_trusted(&self, token: &str) -> bool {
        self.read().contains(token)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check a raw `Cookie` header for a trusted `trust` cookie.
    pub fn admits(&self, cookie_header: Option<&str>) -> bool {
        cookie_header
            .and_then(|header| cookie_value(header, TRUST_COOKIE))
            .is_some_and(|token| self.is_trusted(token))
    }

    fn read(&self) -> RwLockReadGuard<'_, HashSet<String>> {
        self.tokens.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashSet<String>> {
        self.tokens.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Value of cookie `name` in a `a=1; b=2` header.
fn cookie_value<'h>(header: &'h str, name: &str) -> Option<&'h str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key.trim() == name).then(|| value.trim().trim_matches('"'))
    })
}
