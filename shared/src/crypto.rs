use aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use secrecy::{ExposeSecret, Secret};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroize;

const ENVELOPE_MAGIC: [u8; 8] = *b"SIPSEAL1";
const CURRENT_VERSION: u32 = 1;
// magic(8) + version(4) + alg(1) + nonce(24)
const HEADER_SIZE: usize = 37;
const TAG_SIZE: usize = 16;
const NONCE_SIZE: usize = 24;
pub const KEY_SIZE: usize = 32;
const MAX_AAD_LEN: usize = 8 * 1024;
const MAX_AAD_FIELD: usize = 1024;

#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_plaintext: usize,
    pub max_ciphertext: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_plaintext: 64 * 1024 * 1024,
            max_ciphertext: 64 * 1024 * 1024 + HEADER_SIZE + TAG_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptFailure {
    MalformedEnvelope,
    UnsupportedVersion { version: u32 },
    UnsupportedAlgorithm { alg: u8 },
    AuthenticationFailed,
    PayloadTooLarge,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid key encoding")]
    InvalidKeyEncoding,

    #[error("randomness unavailable")]
    RandomUnavailable,

    #[error("plaintext too large: {size} > {max}")]
    PlaintextTooLarge { size: usize, max: usize },

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: {0:?}")]
    DecryptionFailed(DecryptFailure),

    #[error("aad too large: {size} > {max}")]
    AadTooLarge { size: usize, max: usize },

    #[error("aad field too large: {field} has {size} > {max}")]
    AadFieldTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },

    #[error("aad required but empty")]
    AadRequired,
}

pub trait CryptoProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

pub trait RandomProvider: Send + Sync {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError>;
}

pub struct OsRng;

impl RandomProvider for OsRng {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
        getrandom::getrandom(out).map_err(|_| CryptoError::RandomUnavailable)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AlgId {
    XChaCha20Poly1305 = 1,
}

impl TryFrom<u8> for AlgId {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            1 => Ok(AlgId::XChaCha20Poly1305),
            other => Err(other),
        }
    }
}

/// Single-key XChaCha20-Poly1305 sealer for queue data at rest.
pub struct Sealer<R: RandomProvider = OsRng> {
    key: Secret<[u8; KEY_SIZE]>,
    rng: R,
    limits: Limits,
}

impl Sealer<OsRng> {
    pub fn new(key_bytes: &[u8]) -> Result<Self, CryptoError> {
        Self::with_rng(key_bytes, OsRng, Limits::default())
    }

    /// Key given as 64 hex characters, as stored in the shell config.
    pub fn from_hex(key_hex: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(key_hex.trim()).map_err(|_| CryptoError::InvalidKeyEncoding)?;
        let sealer = Self::new(&bytes);
        bytes.zeroize();
        sealer
    }

    pub fn generate_key() -> Result<[u8; KEY_SIZE], CryptoError> {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill(&mut key)?;
        Ok(key)
    }
}

impl<R: RandomProvider> Sealer<R> {
    pub fn with_rng(key_bytes: &[u8], rng: R, limits: Limits) -> Result<Self, CryptoError> {
        if key_bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: key_bytes.len(),
            });
        }

        let mut k = [0u8; KEY_SIZE];
        k.copy_from_slice(key_bytes);
        let key = Secret::new(k);
        k.zeroize();

        Ok(Self { key, rng, limits })
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.key.expose_secret()))
    }

    fn check_aad(aad: &[u8]) -> Result<(), CryptoError> {
        if aad.is_empty() {
            return Err(CryptoError::AadRequired);
        }
        if aad.len() > MAX_AAD_LEN {
            return Err(CryptoError::AadTooLarge {
                size: aad.len(),
                max: MAX_AAD_LEN,
            });
        }
        Ok(())
    }
}

impl<R: RandomProvider> fmt::Debug for Sealer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealer")
            .field("key", &"[REDACTED]")
            .field("limits", &self.limits)
            .finish()
    }
}

impl<R: RandomProvider> CryptoProvider for Sealer<R> {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > self.limits.max_plaintext {
            return Err(CryptoError::PlaintextTooLarge {
                size: plaintext.len(),
                max: self.limits.max_plaintext,
            });
        }
        Self::check_aad(aad)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce_bytes)?;

        let total_len = HEADER_SIZE + plaintext.len() + TAG_SIZE;
        let mut out = vec![0u8; total_len];

        out[0..8].copy_from_slice(&ENVELOPE_MAGIC);
        out[8..12].copy_from_slice(&CURRENT_VERSION.to_le_bytes());
        out[12] = AlgId::XChaCha20Poly1305 as u8;
        out[13..HEADER_SIZE].copy_from_slice(&nonce_bytes);

        let pt_end = HEADER_SIZE + plaintext.len();
        out[HEADER_SIZE..pt_end].copy_from_slice(plaintext);

        let tag = self
            .cipher()
            .encrypt_in_place_detached(
                XNonce::from_slice(&nonce_bytes),
                aad,
                &mut out[HEADER_SIZE..pt_end],
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        out[pt_end..].copy_from_slice(&tag);
        Ok(out)
    }

    fn decrypt(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let malformed = CryptoError::DecryptionFailed(DecryptFailure::MalformedEnvelope);

        if envelope.len() < HEADER_SIZE + TAG_SIZE {
            return Err(malformed);
        }
        if envelope.len() > self.limits.max_ciphertext {
            return Err(CryptoError::DecryptionFailed(
                DecryptFailure::PayloadTooLarge,
            ));
        }
        if envelope[0..8] != ENVELOPE_MAGIC {
            return Err(malformed);
        }
        Self::check_aad(aad)?;

        let mut version_bytes = [0u8; 4];
        version_bytes.copy_from_slice(&envelope[8..12]);
        let version = u32::from_le_bytes(version_bytes);
        if version != CURRENT_VERSION {
            return Err(CryptoError::DecryptionFailed(
                DecryptFailure::UnsupportedVersion { version },
            ));
        }

        let alg_byte = envelope[12];
        AlgId::try_from(alg_byte).map_err(|_| {
            CryptoError::DecryptionFailed(DecryptFailure::UnsupportedAlgorithm { alg: alg_byte })
        })?;

        let nonce = XNonce::from_slice(&envelope[13..HEADER_SIZE]);
        let ciphertext_with_tag = &envelope[HEADER_SIZE..];
        let ct_len = ciphertext_with_tag.len() - TAG_SIZE;
        let mut buffer = ciphertext_with_tag[..ct_len].to_vec();
        let tag = &ciphertext_with_tag[ct_len..];

        if self
            .cipher()
            .decrypt_in_place_detached(nonce, aad, &mut buffer, tag.into())
            .is_err()
        {
            buffer.zeroize();
            return Err(CryptoError::DecryptionFailed(
                DecryptFailure::AuthenticationFailed,
            ));
        }

        Ok(buffer)
    }
}

/// Length-prefixed associated data binding ciphertext to the store it was
/// written for and the officer who owns it.
pub fn build_aad(
    store_name: &str,
    schema_version: u32,
    officer_id: Option<&str>,
) -> Result<Vec<u8>, CryptoError> {
    const APP_NS: &str = "sipatrol";

    validate_aad_field("store_name", store_name)?;
    if let Some(o) = officer_id {
        validate_aad_field("officer_id", o)?;
    }

    let mut aad = Vec::with_capacity(
        2 + APP_NS.len() + 2 + store_name.len() + 4 + 1 + officer_id.map_or(0, |o| 2 + o.len()),
    );

    for field in [APP_NS, store_name] {
        aad.extend_from_slice(&(field.len() as u16).to_le_bytes());
        aad.extend_from_slice(field.as_bytes());
    }
    aad.extend_from_slice(&schema_version.to_le_bytes());

    match officer_id {
        None => aad.push(0),
        Some(o) => {
            aad.push(1);
            aad.extend_from_slice(&(o.len() as u16).to_le_bytes());
            aad.extend_from_slice(o.as_bytes());
        }
    }

    Ok(aad)
}

fn validate_aad_field(field: &'static str, value: &str) -> Result<(), CryptoError> {
    if value.len() > MAX_AAD_FIELD {
        return Err(CryptoError::AadFieldTooLarge {
            field,
            size: value.len(),
            max: MAX_AAD_FIELD,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRng(u8);

    impl RandomProvider for FixedRng {
        fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
            out.fill(self.0);
            Ok(())
        }
    }

    fn sealer() -> Sealer {
        Sealer::new(&[7u8; KEY_SIZE]).unwrap()
    }

    #[test]
    fn roundtrip() {
        let s = sealer();
        let aad = build_aad("queue", 1, Some("officer-1")).unwrap();
        let sealed = s.encrypt(b"evidence", &aad).unwrap();
        assert_eq!(&sealed[0..8], &ENVELOPE_MAGIC);
        assert_eq!(s.decrypt(&sealed, &aad).unwrap(), b"evidence");
    }

    #[test]
    fn wrong_aad_fails() {
        let s = sealer();
        let aad = build_aad("queue", 1, Some("officer-1")).unwrap();
        let other = build_aad("queue", 1, Some("officer-2")).unwrap();
        let sealed = s.encrypt(b"evidence", &aad).unwrap();
        assert_eq!(
            s.decrypt(&sealed, &other),
            Err(CryptoError::DecryptionFailed(
                DecryptFailure::AuthenticationFailed
            ))
        );
    }

    #[test]
    fn wrong_key_fails() {
        let aad = build_aad("queue", 1, None).unwrap();
        let sealed = sealer().encrypt(b"x", &aad).unwrap();
        let other = Sealer::new(&[8u8; KEY_SIZE]).unwrap();
        assert!(other.decrypt(&sealed, &aad).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let s = sealer();
        let aad = build_aad("queue", 1, None).unwrap();
        let mut sealed = s.encrypt(b"evidence", &aad).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(s.decrypt(&sealed, &aad).is_err());
    }

    #[test]
    fn empty_aad_rejected() {
        assert_eq!(sealer().encrypt(b"x", &[]), Err(CryptoError::AadRequired));
    }

    #[test]
    fn key_length_and_hex() {
        assert!(matches!(
            Sealer::new(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength { expected: 32, actual: 16 })
        ));
        assert!(Sealer::from_hex(&"ab".repeat(32)).is_ok());
        assert_eq!(
            Sealer::from_hex("zz").unwrap_err(),
            CryptoError::InvalidKeyEncoding
        );
    }

    #[test]
    fn deterministic_rng_is_used_for_nonce() {
        let s = Sealer::with_rng(&[1u8; KEY_SIZE], FixedRng(9), Limits::default()).unwrap();
        let aad = build_aad("queue", 1, None).unwrap();
        let sealed = s.encrypt(b"x", &aad).unwrap();
        assert!(sealed[13..HEADER_SIZE].iter().all(|b| *b == 9));
    }

    #[test]
    fn debug_redacts_key() {
        assert!(format!("{:?}", sealer()).contains("REDACTED"));
    }
}
