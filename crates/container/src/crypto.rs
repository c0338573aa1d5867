//! Cryptographic primitives for the container format.
//!
//! - AES-256-CBC block encryption with deterministic IVs
//! - SHA-1 digests for per-block integrity
//! - RSA PKCS#1 v1.5 signatures over the TOC
//!
//! IV derivation is position-based: IV = first 16 bytes of
//! SHA-1(container_id LE || partition_index LE || block offset LE).
//! Identical plaintext written at the same position therefore yields
//! identical ciphertext, which the writer's dedup pass relies on. The
//! directory index blob uses `partition_index = u32::MAX, offset = 0`.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use iostore_core::{ContainerId, Error, Result};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use uuid::Uuid;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES cipher block size; encrypted payloads are padded to this boundary.
pub const AES_BLOCK_SIZE: usize = 16;

/// Pseudo partition index used when deriving the directory index IV.
pub const DIRECTORY_INDEX_PARTITION: u32 = u32::MAX;

/// 256-bit AES key material.
pub type AesKey = [u8; 32];

/// Source of AES keys, looked up by the key GUID stored in a container
/// header. The dispatcher's key registry implements this; tests use
/// [`StaticKeys`] or [`NoKeys`].
pub trait EncryptionKeyProvider: Send + Sync {
    /// The key registered for `guid`, if any.
    fn key_for(&self, guid: &Uuid) -> Option<AesKey>;
}

/// Key provider with no keys. Opening an encrypted container through it
/// fails with `InvalidEncryptionKey`.
pub struct NoKeys;

impl EncryptionKeyProvider for NoKeys {
    fn key_for(&self, _guid: &Uuid) -> Option<AesKey> {
        None
    }
}

/// Fixed single-key provider.
pub struct StaticKeys {
    guid: Uuid,
    key: AesKey,
}

impl StaticKeys {
    /// Provider that answers only for the given GUID.
    pub fn new(guid: Uuid, key: AesKey) -> Self {
        StaticKeys { guid, key }
    }
}

impl EncryptionKeyProvider for StaticKeys {
    fn key_for(&self, guid: &Uuid) -> Option<AesKey> {
        (*guid == self.guid).then_some(self.key)
    }
}

/// Round `len` up to the AES block boundary.
pub fn aligned_to_aes(len: usize) -> usize {
    (len + AES_BLOCK_SIZE - 1) / AES_BLOCK_SIZE * AES_BLOCK_SIZE
}

/// Derive the deterministic IV for a block at the given position.
pub fn derive_block_iv(container_id: ContainerId, partition_index: u32, offset: u64) -> [u8; 16] {
    let mut hasher = Sha1::new();
    hasher.update(container_id.value().to_le_bytes());
    hasher.update(partition_index.to_le_bytes());
    hasher.update(offset.to_le_bytes());
    let digest: [u8; 20] = hasher.finalize().into();
    digest[0..16].try_into().unwrap()
}

/// Encrypt `data` in place. Length must be a multiple of [`AES_BLOCK_SIZE`].
pub fn encrypt_in_place(key: &AesKey, iv: &[u8; 16], data: &mut [u8]) -> Result<()> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(Error::InvalidParameter(format!(
            "ciphertext length {} is not a multiple of {}",
            data.len(),
            AES_BLOCK_SIZE
        )));
    }
    let len = data.len();
    Aes256CbcEnc::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(data, len)
        .map_err(|_| Error::InvalidParameter("AES encryption failed".to_string()))?;
    Ok(())
}

/// Decrypt `data` in place. Length must be a multiple of [`AES_BLOCK_SIZE`].
pub fn decrypt_in_place(key: &AesKey, iv: &[u8; 16], data: &mut [u8]) -> Result<()> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(Error::InvalidParameter(format!(
            "ciphertext length {} is not a multiple of {}",
            data.len(),
            AES_BLOCK_SIZE
        )));
    }
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| Error::InvalidParameter("AES decryption failed".to_string()))?;
    Ok(())
}

/// SHA-1 digest of `data`.
pub fn sha1_digest(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// Sign the serialized TOC payload with RSA PKCS#1 v1.5 over SHA-1.
pub fn sign_toc(private_key: &RsaPrivateKey, payload: &[u8]) -> Vec<u8> {
    let signing_key = SigningKey::<Sha1>::new(private_key.clone());
    signing_key.sign(payload).to_vec()
}

/// Verify a TOC signature. Returns false on any mismatch or malformed
/// signature bytes.
pub fn verify_toc(public_key: &RsaPublicKey, payload: &[u8], signature: &[u8]) -> bool {
    let verifying_key = VerifyingKey::<Sha1>::new(public_key.clone());
    match Signature::try_from(signature) {
        Ok(sig) => verifying_key.verify(payload, &sig).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: AesKey = [0x42; 32];

    #[test]
    fn test_iv_is_deterministic_and_position_dependent() {
        let id = ContainerId::from_name("ivtest");
        let a = derive_block_iv(id, 0, 0);
        let b = derive_block_iv(id, 0, 0);
        assert_eq!(a, b);
        assert_ne!(a, derive_block_iv(id, 1, 0));
        assert_ne!(a, derive_block_iv(id, 0, 16));
        assert_ne!(a, derive_block_iv(ContainerId::from_name("other"), 0, 0));
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let iv = derive_block_iv(ContainerId::from_name("c"), 0, 0);
        let plaintext = vec![7u8; 64];
        let mut data = plaintext.clone();
        encrypt_in_place(&KEY, &iv, &mut data).unwrap();
        assert_ne!(data, plaintext);
        decrypt_in_place(&KEY, &iv, &mut data).unwrap();
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_same_position_same_ciphertext() {
        let iv = derive_block_iv(ContainerId::from_name("c"), 2, 4096);
        let mut a = vec![1u8; 32];
        let mut b = vec![1u8; 32];
        encrypt_in_place(&KEY, &iv, &mut a).unwrap();
        encrypt_in_place(&KEY, &iv, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unaligned_length_rejected() {
        let iv = [0u8; 16];
        let mut data = vec![0u8; 15];
        assert!(encrypt_in_place(&KEY, &iv, &mut data).is_err());
        assert!(decrypt_in_place(&KEY, &iv, &mut data).is_err());
    }

    #[test]
    fn test_aligned_to_aes() {
        assert_eq!(aligned_to_aes(0), 0);
        assert_eq!(aligned_to_aes(1), 16);
        assert_eq!(aligned_to_aes(16), 16);
        assert_eq!(aligned_to_aes(17), 32);
    }

    #[test]
    fn test_static_keys_provider() {
        let guid = Uuid::new_v4();
        let keys = StaticKeys::new(guid, KEY);
        assert_eq!(keys.key_for(&guid), Some(KEY));
        assert_eq!(keys.key_for(&Uuid::new_v4()), None);
        assert_eq!(NoKeys.key_for(&guid), None);
    }

    #[test]
    fn test_toc_signature_round_trip() {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_key = private_key.to_public_key();

        let payload = b"toc header and arrays";
        let signature = sign_toc(&private_key, payload);
        assert!(verify_toc(&public_key, payload, &signature));
        assert!(!verify_toc(&public_key, b"tampered payload", &signature));

        let mut broken = signature.clone();
        broken[0] ^= 0xFF;
        assert!(!verify_toc(&public_key, payload, &broken));
    }
}
