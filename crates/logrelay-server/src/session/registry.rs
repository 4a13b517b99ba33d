//! Registry of all live tokens.
//!
//! Tokens are kept in a plain vector and looked up by linear scan: their count
//! is bounded by the connection rate limits, so it stays small.

use super::token::{TokenMetadata, TokenType};
use tracing::{debug, info};

/// Owns every [`TokenMetadata`] known to the relay.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    tokens: Vec<TokenMetadata>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { tokens: Vec::new() }
    }

    /// Create and register a new token, returning a reference to it.
    pub fn create(
        &mut self,
        token_type: TokenType,
        id: impl Into<String>,
        history_size: usize,
        expiration_delay: u64,
    ) -> &mut TokenMetadata {
        let token = TokenMetadata::new(token_type, id, history_size, expiration_delay);
        info!(token = %token.id, kind = ?token_type, "token created");
        self.insert(token)
    }

    /// Register an already-built token (e.g. one restored from disk).
    pub fn insert(&mut self, token: TokenMetadata) -> &mut TokenMetadata {
        let index = self.tokens.len();
        self.tokens.push(token);
        &mut self.tokens[index]
    }

    pub fn find_index(&self, id: &str) -> Option<usize> {
        self.tokens.iter().position(|t| t.id == id)
    }

    pub fn find(&self, id: &str) -> Option<&TokenMetadata> {
        self.tokens.iter().find(|t| t.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut TokenMetadata> {
        self.tokens.iter_mut().find(|t| t.id == id)
    }

    pub fn get_from_index(&self, index: usize) -> Option<&TokenMetadata> {
        self.tokens.get(index)
    }

    /// Remove the token at `index`. Out-of-range indexes are ignored.
    pub fn remove_index(&mut self, index: usize) -> Option<TokenMetadata> {
        if index < self.tokens.len() {
            let token = self.tokens.remove(index);
            debug!(token = %token.id, "token removed");
            Some(token)
        } else {
            None
        }
    }

    /// Remove `id` if it is ephemeral and nobody is attached any more.
    pub fn remove_if_idle(&mut self, id: &str) -> bool {
        match self.find_index(id) {
            Some(index) if self.tokens[index].should_remove_when_idle() => {
                self.remove_index(index);
                info!(token = %id, "idle token removed");
                true
            }
            _ => false,
        }
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TokenMetadata> {
        self.tokens.iter()
    }

    /// Remove and return every token matching `pred`, keeping the others in order.
    pub fn drain_where<F>(&mut self, mut pred: F) -> Vec<TokenMetadata>
    where
        F: FnMut(&TokenMetadata) -> bool,
    {
        let mut removed = Vec::new();
        let mut index = 0;
        while index < self.tokens.len() {
            if pred(&self.tokens[index]) {
                removed.push(self.tokens.remove(index));
            } else {
                index += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_find_remove() {
        let mut registry = SessionRegistry::new();
        registry.create(TokenType::EphemeralFromInspector, "a", 10, 1000);
        registry.create(TokenType::EphemeralFromDevice, "b", 10, 1000);

        assert_eq!(registry.size(), 2);
        assert_eq!(registry.find_index("b"), Some(1));
        assert_eq!(registry.get_from_index(0).map(|t| t.id.as_str()), Some("a"));
        assert!(registry.find("missing").is_none());
        assert!(registry.find_index("missing").is_none());

        let removed = registry.remove_index(0).unwrap();
        assert_eq!(removed.id, "a");
        assert_eq!(registry.find_index("b"), Some(0));
        assert!(registry.remove_index(5).is_none());
    }

    #[test]
    fn remove_if_idle_spares_persistent_tokens() {
        let mut registry = SessionRegistry::new();
        registry.create(TokenType::EphemeralFromInspector, "eph", 10, 1000);
        registry.create(TokenType::Persistent, "keep", 10, 1000);

        assert!(registry.remove_if_idle("eph"));
        assert!(!registry.remove_if_idle("keep"));
        assert!(!registry.remove_if_idle("missing"));
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn drain_where_preserves_order() {
        let mut registry = SessionRegistry::new();
        for id in ["a", "b", "c", "d"] {
            registry.create(TokenType::EphemeralFromDevice, id, 0, 1000);
        }
        let removed = registry.drain_where(|t| t.id == "b" || t.id == "d");
        let removed_ids: Vec<_> = removed.iter().map(|t| t.id.as_str()).collect();
        let kept: Vec<_> = registry.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(removed_ids, vec!["b", "d"]);
        assert_eq!(kept, vec!["a", "c"]);
    }
}
