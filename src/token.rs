//! Shared bearer-token slot.
//!
//! One [`TokenStore`] belongs to a client instance; every clone of the client (and
//! every in-flight request or stream) reads the same slot. Reads are lock-free and
//! always observe either the previous or the new token.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Thread-safe holder for the current bearer token.
#[derive(Clone, Default)]
pub struct TokenStore {
    slot: Arc<ArcSwapOption<String>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with an initial token (empty strings are ignored).
    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::new();
        store.set(token);
        store
    }

    /// Replace the token. Re-setting the current value leaves the slot untouched;
    /// an empty or whitespace-only token clears it.
    pub fn set(&self, token: impl Into<String>) {
        let token = token.into();
        if token.trim().is_empty() {
            self.clear();
            return;
        }
        let current = self.slot.load();
        if current.as_deref().map(String::as_str) == Some(token.as_str()) {
            #[cfg(feature = "tracing")]
            tracing::debug!(token = %redact(&token), "token unchanged");
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(
            previous = %current.as_deref().map(|t| redact(t)).unwrap_or_else(|| "none".into()),
            token = %redact(&token),
            "token updated"
        );
        self.slot.store(Some(Arc::new(token)));
    }

    /// `Some` sets, `None` clears.
    pub fn set_optional(&self, token: Option<&str>) {
        match token {
            Some(token) => self.set(token),
            None => self.clear(),
        }
    }

    pub fn get(&self) -> Option<String> {
        self.slot.load().as_deref().cloned()
    }

    pub fn clear(&self) {
        let previous = self.slot.swap(None);
        #[cfg(feature = "tracing")]
        if let Some(previous) = previous.as_deref() {
            tracing::debug!(previous = %redact(previous), "token cleared");
        }
        #[cfg(not(feature = "tracing"))]
        let _ = previous;
    }

    pub fn is_set(&self) -> bool {
        self.slot.load().is_some()
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("token", &self.slot.load().as_deref().map(|t| redact(t)))
            .finish()
    }
}

/// First few characters followed by an ellipsis; never the full secret.
pub(crate) fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{prefix}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_clear() {
        let store = TokenStore::new();
        assert_eq!(store.get(), None);
        store.set("bearer abc");
        assert_eq!(store.get().as_deref(), Some("bearer abc"));
        assert!(store.is_set());
        store.clear();
        assert_eq!(store.get(), None);
        assert!(!store.is_set());
    }

    #[test]
    fn setting_same_value_twice_is_a_no_op() {
        let store = TokenStore::with_token("tok-1");
        let before = store.slot.load_full();
        store.set("tok-1");
        let after = store.slot.load_full();
        assert_eq!(store.get().as_deref(), Some("tok-1"));
        // Same allocation: no state change was published.
        assert!(Arc::ptr_eq(
            before.as_ref().expect("token"),
            after.as_ref().expect("token")
        ));
    }

    #[test]
    fn none_and_blank_clear() {
        let store = TokenStore::with_token("tok");
        store.set_optional(None);
        assert_eq!(store.get(), None);

        store.set_optional(Some("tok"));
        store.set("   ");
        assert_eq!(store.get(), None);
    }

    #[test]
    fn clones_share_state() {
        let store = TokenStore::new();
        let other = store.clone();
        store.set("shared");
        assert_eq!(other.get().as_deref(), Some("shared"));
    }

    #[test]
    fn concurrent_readers_see_whole_values() {
        let store = TokenStore::with_token("old-token");
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let seen = store.get().expect("token present");
                        assert!(seen == "old-token" || seen == "new-token");
                    }
                })
            })
            .collect();
        store.set("new-token");
        for reader in readers {
            reader.join().expect("reader thread");
        }
        assert_eq!(store.get().as_deref(), Some("new-token"));
    }

    #[test]
    fn debug_output_redacts_token() {
        let store = TokenStore::with_token("supersecretvalue");
        let rendered = format!("{store:?}");
        assert!(rendered.contains("supersec..."));
        assert!(!rendered.contains("supersecretvalue"));
    }
}
