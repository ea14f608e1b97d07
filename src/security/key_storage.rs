// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Security-group key storage (SKS).
//!
//! A KeyStorage holds the current and future key sets of one security
//! group. Several ReaderGroups may share it; the storage is reference
//! counted and dropped by the manager once the last group detaches.

use super::{KeySet, SecurityPolicy};
use crate::pubsub::{Error, Result};
use std::sync::Arc;

/// Key material of one security group, current plus pre-distributed
/// future tokens.
pub struct KeyStorage {
    security_group_id: String,
    policy: Arc<dyn SecurityPolicy>,
    current_token_id: u32,
    /// (token id, key set), ordered by token id. Contains the current
    /// token and any future ones.
    keys: Vec<(u32, KeySet)>,
    reference_count: usize,
}

impl KeyStorage {
    #[must_use]
    pub fn new(security_group_id: impl Into<String>, policy: Arc<dyn SecurityPolicy>) -> Self {
        KeyStorage {
            security_group_id: security_group_id.into(),
            policy,
            current_token_id: 0,
            keys: Vec::new(),
            reference_count: 0,
        }
    }

    #[must_use]
    pub fn security_group_id(&self) -> &str {
        &self.security_group_id
    }

    #[must_use]
    pub fn policy(&self) -> &Arc<dyn SecurityPolicy> {
        &self.policy
    }

    #[must_use]
    pub fn reference_count(&self) -> usize {
        self.reference_count
    }

    pub(crate) fn attach(&mut self) {
        self.reference_count += 1;
    }

    /// Detach one referencing group. Returns true when no references
    /// remain and the storage can be dropped.
    pub(crate) fn detach(&mut self) -> bool {
        self.reference_count = self.reference_count.saturating_sub(1);
        self.reference_count == 0
    }

    /// Install the current key and any future keys, replacing previous
    /// material.
    pub fn set_keys(&mut self, current_token_id: u32, mut keys: Vec<(u32, KeySet)>) -> Result<()> {
        if !keys.iter().any(|(t, _)| *t == current_token_id) {
            return Err(Error::InvalidArgument(
                "current token id has no matching key set".into(),
            ));
        }
        keys.sort_by_key(|(t, _)| *t);
        self.current_token_id = current_token_id;
        self.keys = keys;
        Ok(())
    }

    #[must_use]
    pub fn current_token_id(&self) -> u32 {
        self.current_token_id
    }

    /// Current key set, if any keys were distributed yet.
    #[must_use]
    pub fn current_keys(&self) -> Option<&KeySet> {
        self.key_for(self.current_token_id)
    }

    /// Key set for a specific token id (current or future).
    #[must_use]
    pub fn key_for(&self, token_id: u32) -> Option<&KeySet> {
        self.keys
            .iter()
            .find(|(t, _)| *t == token_id)
            .map(|(_, k)| k)
    }

    /// Advance to the next distributed token, dropping superseded keys.
    pub fn advance(&mut self) -> Result<u32> {
        let next = self
            .keys
            .iter()
            .map(|(t, _)| *t)
            .find(|t| *t > self.current_token_id)
            .ok_or_else(|| Error::NotSupported("no future key available".into()))?;
        self.keys.retain(|(t, _)| *t >= next);
        self.current_token_id = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::Aes256Sha256Policy;

    fn ks(token: u32) -> KeySet {
        KeySet::new(vec![token as u8; 32], vec![0x22; 32], vec![1, 2, 3, 4])
    }

    fn storage() -> KeyStorage {
        KeyStorage::new("sg-1", Arc::new(Aes256Sha256Policy::new()))
    }

    #[test]
    fn test_set_and_lookup() {
        let mut s = storage();
        s.set_keys(1, vec![(1, ks(1)), (2, ks(2))]).expect("set");
        assert_eq!(s.current_token_id(), 1);
        assert!(s.current_keys().is_some());
        assert!(s.key_for(2).is_some());
        assert!(s.key_for(3).is_none());
    }

    #[test]
    fn test_rejects_current_without_key() {
        let mut s = storage();
        assert!(s.set_keys(5, vec![(1, ks(1))]).is_err());
    }

    #[test]
    fn test_advance_drops_superseded() {
        let mut s = storage();
        s.set_keys(1, vec![(1, ks(1)), (2, ks(2)), (3, ks(3))])
            .expect("set");
        assert_eq!(s.advance().expect("advance"), 2);
        assert!(s.key_for(1).is_none());
        assert_eq!(s.advance().expect("advance"), 3);
        assert!(s.advance().is_err());
    }

    #[test]
    fn test_refcount() {
        let mut s = storage();
        s.attach();
        s.attach();
        assert_eq!(s.reference_count(), 2);
        assert!(!s.detach());
        assert!(s.detach());
    }
}
