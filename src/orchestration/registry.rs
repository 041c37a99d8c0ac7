//! Parents waiting on their children.
//!
//! Each fan-out parks the parent under an integer token; children carry the
//! token and report back to it. Tokens are the smallest integers not
//! currently in use, so the key space stays dense.

use std::collections::BTreeMap;

use crate::core::Token;

#[derive(Debug)]
pub struct WaitingRegistry<T> {
    entries: BTreeMap<Token, T>,
}

impl<T> Default for WaitingRegistry<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> WaitingRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `value` under the smallest free token.
    pub fn register(&mut self, value: T) -> Token {
        let token = self.next_free();
        self.entries.insert(token, value);
        token
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        self.entries.get_mut(&token)
    }

    /// Remove the entry, freeing its token for reuse.
    pub fn release(&mut self, token: Token) -> Option<T> {
        self.entries.remove(&token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    fn next_free(&self) -> Token {
        // Keys iterate in order; the first gap is the smallest free token.
        let mut candidate = 0;
        for key in self.entries.keys() {
            if key.0 != candidate {
                break;
            }
            candidate += 1;
        }
        Token(candidate)
    }
}
