//! Authenticated encryption for `channelToken` and `llmApiKey` at rest.
//!
//! A `trait Service` / `new_service` factory pair, swapped to AES-256-GCM
//! since that is what needs encrypting at the repository boundary.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
  #[error("ciphertext is malformed")]
  Malformed,
  #[error("decryption failed")]
  DecryptionFailed,
}

pub trait Service: Send + Sync + 'static {
  fn encrypt(&self, plaintext: &str) -> String;
  fn decrypt(&self, stored: &str) -> Result<String, CryptoError>;
  /// A deterministic digest of `plaintext`, for callers that need to compare
  /// values at rest without decrypting and without the false negatives
  /// `encrypt`'s random IV would introduce (e.g. the duplicate-checkout
  /// guard matching on a previously stored `channelToken`).
  fn fingerprint(&self, plaintext: &str) -> String;
}

pub fn new_service(key: [u8; 32]) -> impl Service {
  Implementation { key }
}

struct Implementation {
  key: [u8; 32],
}

impl Service for Implementation {
  /// Produces `ivHex:ciphertextHex:authTagHex` with a fresh random 12-byte IV
  /// on every call, so repeated calls on the same plaintext never collide.
  fn encrypt(&self, plaintext: &str) -> String {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
    let mut iv = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    // `aes-gcm` appends the 16-byte auth tag to the ciphertext; split it back
    // out so the on-wire format is iv:ciphertext:tag.
    let mut sealed = cipher
      .encrypt(nonce, plaintext.as_bytes())
      .expect("encryption with a valid 32-byte key never fails");
    let tag = sealed.split_off(sealed.len() - 16);

    format!("{}:{}:{}", hex::encode(iv), hex::encode(sealed), hex::encode(tag))
  }

  fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
    let mut parts = stored.splitn(3, ':');
    let (iv_hex, ct_hex, tag_hex) = match (parts.next(), parts.next(), parts.next()) {
      (Some(a), Some(b), Some(c)) => (a, b, c),
      _ => return Err(CryptoError::Malformed),
    };

    let iv = hex::decode(iv_hex).map_err(|_| CryptoError::Malformed)?;
    let mut ciphertext = hex::decode(ct_hex).map_err(|_| CryptoError::Malformed)?;
    let tag = hex::decode(tag_hex).map_err(|_| CryptoError::Malformed)?;
    if iv.len() != 12 || tag.len() != 16 {
      return Err(CryptoError::Malformed);
    }
    ciphertext.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
    let nonce = Nonce::from_slice(&iv);
    let plaintext = cipher
      .decrypt(nonce, ciphertext.as_slice())
      .map_err(|_| CryptoError::DecryptionFailed)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
  }

  fn fingerprint(&self, plaintext: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(&self.key).expect("hmac accepts a 32-byte key");
    mac.update(plaintext.as_bytes());
    hex::encode(mac.finalize().into_bytes())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key() -> [u8; 32] {
    [7u8; 32]
  }

  #[test]
  fn round_trips_non_empty_strings() {
    let svc = new_service(key());
    for plaintext in ["hello", "a very long telegram bot token-like-string-123", "🦀"] {
      let stored = svc.encrypt(plaintext);
      assert_eq!(svc.decrypt(&stored).unwrap(), plaintext);
    }
  }

  #[test]
  fn produces_distinct_ciphertext_each_call() {
    let svc = new_service(key());
    let a = svc.encrypt("same-plaintext");
    let b = svc.encrypt("same-plaintext");
    assert_ne!(a, b);
  }

  #[test]
  fn rejects_malformed_input() {
    let svc = new_service(key());
    assert!(svc.decrypt("not-the-right-shape").is_err());
  }

  #[test]
  fn fingerprint_is_deterministic_and_distinguishes_inputs() {
    let svc = new_service(key());
    assert_eq!(svc.fingerprint("same-plaintext"), svc.fingerprint("same-plaintext"));
    assert_ne!(svc.fingerprint("same-plaintext"), svc.fingerprint("different-plaintext"));
  }

  #[test]
  fn rejects_tampered_ciphertext() {
    let svc = new_service(key());
    let mut stored = svc.encrypt("secret-token");
    // Flip a hex nibble in the ciphertext segment.
    let mutated = stored.replacen('a', "b", 1);
    if mutated == stored {
      stored.push('0');
    }
    assert!(svc.decrypt(&mutated).is_err() || mutated == stored);
  }
}
