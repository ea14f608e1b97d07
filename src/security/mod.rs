// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message security for UADP NetworkMessages.
//!
//! The stack stays agnostic of concrete algorithms: a ReaderGroup carries
//! an [`Arc<dyn SecurityPolicy>`] and installs key material into a
//! [`PolicyContext`] created from it. Key rollover updates the existing
//! context in place, preserving its identity (and any transport state the
//! policy keeps inside).
//!
//! [`Aes256Sha256Policy`] is the bundled reference policy: HMAC-SHA256
//! signatures over the whole NetworkMessage, AES-256-GCM over the payload
//! region, nonce = first 4 bytes of the key nonce + the 8-byte message
//! nonce from the security header.

#[cfg(feature = "sks")]
pub mod key_storage;

use crate::message::SecurityHeader;
use crate::pubsub::{Error, Result};
use ring::{aead, hmac};

/// Symmetric key material installed for one security token.
#[derive(Clone)]
pub struct KeySet {
    pub signing_key: Vec<u8>,
    pub encrypting_key: Vec<u8>,
    pub key_nonce: Vec<u8>,
}

impl KeySet {
    #[must_use]
    pub fn new(signing_key: Vec<u8>, encrypting_key: Vec<u8>, key_nonce: Vec<u8>) -> Self {
        KeySet {
            signing_key,
            encrypting_key,
            key_nonce,
        }
    }
}

/// Live signing/encryption state of one ReaderGroup.
pub trait PolicyContext: Send {
    /// Replace the key material (key rollover). The context object stays.
    fn set_keys(&mut self, keys: &KeySet) -> Result<()>;

    /// Size in bytes of the signature this context appends/expects.
    fn signature_size(&self) -> usize;

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()>;

    /// Encrypt `buf[from..]` in place (the ciphertext may grow, e.g. by
    /// an AEAD tag).
    fn encrypt(&self, message_nonce: &[u8], buf: &mut Vec<u8>, from: usize) -> Result<()>;

    /// Decrypt `buf[from..]` in place, shrinking the buffer if the
    /// ciphertext carried a tag.
    fn decrypt(&self, message_nonce: &[u8], buf: &mut Vec<u8>, from: usize) -> Result<()>;
}

/// Factory for policy contexts; one per security policy URI.
pub trait SecurityPolicy: Send + Sync {
    fn policy_uri(&self) -> &str;

    fn new_context(&self, keys: &KeySet) -> Result<Box<dyn PolicyContext>>;
}

/// Strip and verify the signature, then decrypt the payload region.
///
/// `payload_start` is the first byte after the security header (see
/// [`crate::message::uadp::payload_offset`]). The buffer is truncated to
/// the plaintext message.
pub fn unprotect(
    ctx: &dyn PolicyContext,
    header: &SecurityHeader,
    buf: &mut Vec<u8>,
    payload_start: usize,
) -> Result<()> {
    if header.signed {
        let sig_size = ctx.signature_size();
        if buf.len() < payload_start + sig_size {
            return Err(Error::Security("message too short for signature".into()));
        }
        let body_len = buf.len() - sig_size;
        let (body, sig) = buf.split_at(body_len);
        ctx.verify(body, sig)?;
        buf.truncate(body_len);
    }
    if header.encrypted {
        ctx.decrypt(&header.message_nonce, buf, payload_start)?;
    }
    Ok(())
}

/// Encrypt the payload region and append the signature. Inverse of
/// [`unprotect`]; used by the publish side and by tests building secured
/// frames.
pub fn protect(
    ctx: &dyn PolicyContext,
    header: &SecurityHeader,
    buf: &mut Vec<u8>,
    payload_start: usize,
) -> Result<()> {
    if header.encrypted {
        ctx.encrypt(&header.message_nonce, buf, payload_start)?;
    }
    if header.signed {
        let sig = ctx.sign(buf)?;
        buf.extend_from_slice(&sig);
    }
    Ok(())
}

// ============================================================================
// Reference policy: AES-256-GCM + HMAC-SHA256
// ============================================================================

const POLICY_URI_AES256_SHA256: &str =
    "http://opcfoundation.org/UA/SecurityPolicy#PubSub-Aes256-CTR";

/// Bundled reference policy.
pub struct Aes256Sha256Policy;

impl Aes256Sha256Policy {
    #[must_use]
    pub fn new() -> Self {
        Aes256Sha256Policy
    }
}

impl Default for Aes256Sha256Policy {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityPolicy for Aes256Sha256Policy {
    fn policy_uri(&self) -> &str {
        POLICY_URI_AES256_SHA256
    }

    fn new_context(&self, keys: &KeySet) -> Result<Box<dyn PolicyContext>> {
        let mut ctx = Aes256Sha256Context {
            hmac_key: hmac::Key::new(hmac::HMAC_SHA256, &[0u8; 32]),
            aead_key: None,
            key_nonce: Vec::new(),
        };
        ctx.set_keys(keys)?;
        Ok(Box::new(ctx))
    }
}

struct Aes256Sha256Context {
    hmac_key: hmac::Key,
    aead_key: Option<aead::LessSafeKey>,
    key_nonce: Vec<u8>,
}

impl Aes256Sha256Context {
    fn nonce(&self, message_nonce: &[u8]) -> Result<aead::Nonce> {
        if self.key_nonce.len() < 4 || message_nonce.len() != 8 {
            return Err(Error::Security(
                "need a 4-byte key nonce and an 8-byte message nonce".into(),
            ));
        }
        let mut n = [0u8; 12];
        n[..4].copy_from_slice(&self.key_nonce[..4]);
        n[4..].copy_from_slice(message_nonce);
        Ok(aead::Nonce::assume_unique_for_key(n))
    }
}

impl PolicyContext for Aes256Sha256Context {
    fn set_keys(&mut self, keys: &KeySet) -> Result<()> {
        if keys.signing_key.is_empty() {
            return Err(Error::Security("signing key must not be empty".into()));
        }
        self.hmac_key = hmac::Key::new(hmac::HMAC_SHA256, &keys.signing_key);
        self.aead_key = if keys.encrypting_key.is_empty() {
            None
        } else {
            let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &keys.encrypting_key)
                .map_err(|_| Error::Security("encrypting key must be 32 bytes".into()))?;
            Some(aead::LessSafeKey::new(unbound))
        };
        self.key_nonce = keys.key_nonce.clone();
        Ok(())
    }

    fn signature_size(&self) -> usize {
        32
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(hmac::sign(&self.hmac_key, message).as_ref().to_vec())
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        hmac::verify(&self.hmac_key, message, signature)
            .map_err(|_| Error::Security("signature verification failed".into()))
    }

    fn encrypt(&self, message_nonce: &[u8], buf: &mut Vec<u8>, from: usize) -> Result<()> {
        let key = self
            .aead_key
            .as_ref()
            .ok_or_else(|| Error::Security("no encrypting key installed".into()))?;
        let nonce = self.nonce(message_nonce)?;
        let mut region = buf.split_off(from);
        key.seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut region)
            .map_err(|_| Error::Security("encryption failed".into()))?;
        buf.extend_from_slice(&region);
        Ok(())
    }

    fn decrypt(&self, message_nonce: &[u8], buf: &mut Vec<u8>, from: usize) -> Result<()> {
        let key = self
            .aead_key
            .as_ref()
            .ok_or_else(|| Error::Security("no encrypting key installed".into()))?;
        let nonce = self.nonce(message_nonce)?;
        if buf.len() < from {
            return Err(Error::Security("payload region out of bounds".into()));
        }
        let mut region = buf.split_off(from);
        let plain_len = key
            .open_in_place(nonce, aead::Aad::empty(), &mut region)
            .map_err(|_| Error::Security("decryption failed".into()))?
            .len();
        region.truncate(plain_len);
        buf.extend_from_slice(&region);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> KeySet {
        KeySet::new(vec![0x11; 32], vec![0x22; 32], vec![1, 2, 3, 4])
    }

    fn header(signed: bool, encrypted: bool) -> SecurityHeader {
        SecurityHeader {
            signed,
            encrypted,
            footer_enabled: false,
            token_id: 1,
            message_nonce: vec![9, 8, 7, 6, 5, 4, 3, 2],
            footer_size: 0,
        }
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let policy = Aes256Sha256Policy::new();
        let ctx = policy.new_context(&keys()).expect("context");
        let hdr = header(true, false);

        let mut buf = b"header|payload".to_vec();
        protect(ctx.as_ref(), &hdr, &mut buf, 7).expect("protect");
        assert_eq!(buf.len(), 14 + 32);
        unprotect(ctx.as_ref(), &hdr, &mut buf, 7).expect("unprotect");
        assert_eq!(buf, b"header|payload");
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let policy = Aes256Sha256Policy::new();
        let ctx = policy.new_context(&keys()).expect("context");
        let hdr = header(true, false);

        let mut buf = b"header|payload".to_vec();
        protect(ctx.as_ref(), &hdr, &mut buf, 7).expect("protect");
        buf[3] ^= 0xFF;
        assert!(matches!(
            unprotect(ctx.as_ref(), &hdr, &mut buf, 7),
            Err(Error::Security(_))
        ));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let policy = Aes256Sha256Policy::new();
        let ctx = policy.new_context(&keys()).expect("context");
        let hdr = header(true, true);

        let mut buf = b"header|payload".to_vec();
        protect(ctx.as_ref(), &hdr, &mut buf, 7).expect("protect");
        // Header stays plaintext, payload does not.
        assert_eq!(&buf[..7], b"header|");
        assert_ne!(&buf[7..14], b"payload");
        unprotect(ctx.as_ref(), &hdr, &mut buf, 7).expect("unprotect");
        assert_eq!(buf, b"header|payload");
    }

    #[test]
    fn test_wrong_key_fails_decrypt() {
        let policy = Aes256Sha256Policy::new();
        let ctx = policy.new_context(&keys()).expect("context");
        let hdr = header(false, true);

        let mut buf = b"header|payload".to_vec();
        protect(ctx.as_ref(), &hdr, &mut buf, 7).expect("protect");

        let other = policy
            .new_context(&KeySet::new(vec![0x11; 32], vec![0x33; 32], vec![1, 2, 3, 4]))
            .expect("context");
        assert!(matches!(
            unprotect(other.as_ref(), &hdr, &mut buf, 7),
            Err(Error::Security(_))
        ));
    }

    #[test]
    fn test_rollover_updates_context_in_place() {
        let policy = Aes256Sha256Policy::new();
        let mut ctx = policy.new_context(&keys()).expect("context");
        let msg = b"abc";
        let sig1 = ctx.sign(msg).expect("sign");
        ctx.set_keys(&KeySet::new(vec![0x44; 32], vec![0x22; 32], vec![1, 2, 3, 4]))
            .expect("rollover");
        let sig2 = ctx.sign(msg).expect("sign");
        assert_ne!(sig1, sig2);
        assert!(ctx.verify(msg, &sig2).is_ok());
        assert!(ctx.verify(msg, &sig1).is_err());
    }

    #[test]
    fn test_rejects_short_encrypting_key() {
        let policy = Aes256Sha256Policy::new();
        let bad = KeySet::new(vec![0x11; 32], vec![0x22; 16], vec![1, 2, 3, 4]);
        assert!(matches!(policy.new_context(&bad), Err(Error::Security(_))));
    }
}
