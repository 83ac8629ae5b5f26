//! Encryption primitives for the streaming protocol.
//!
//! Three AES modes are in play, keyed per subsystem: ECB for the pairing
//! challenges (exact 16-byte blocks, no padding), CBC for the audio stream,
//! and GCM for video and the modern control channel. Pairing key derivation
//! hashes `salt || PIN` with SHA-256 on modern hosts and SHA-1 on legacy GFE.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{MoonlightError, Result};

pub const AES_BLOCK_SIZE: usize = 16;
pub const GCM_NONCE_SIZE: usize = 12;
pub const GCM_TAG_SIZE: usize = 16;

/// Hash function used for pairing key derivation and challenge hashes,
/// selected from the host generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairHash {
    Sha1,
    Sha256,
}

impl PairHash {
    /// Digest size in bytes; the server challenge response embeds a hash of
    /// this length ahead of the 16-byte challenge.
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Hash the concatenation of `parts`.
    pub fn digest(self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            Self::Sha1 => {
                let mut hasher = Sha1::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
        }
    }
}

/// Derive the AES-128 pairing key: `H(salt || PIN_ascii)[..16]`.
pub fn derive_pair_key(hash: PairHash, salt: &[u8], pin: &str) -> [u8; 16] {
    let digest = hash.digest(&[salt, pin.as_bytes()]);
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// Encrypt exact AES blocks in ECB mode. Pairing material is always a
/// multiple of the block size, so no padding is applied.
pub fn encrypt_ecb(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(MoonlightError::EncryptionFailed);
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = data.to_vec();
    for chunk in out.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

/// Decrypt exact AES blocks in ECB mode.
pub fn decrypt_ecb(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() % AES_BLOCK_SIZE != 0 || data.is_empty() {
        return Err(MoonlightError::DecryptionFailed);
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = data.to_vec();
    for chunk in out.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

/// Per-session crypto context over the remote-input AES key, carrying the GCM
/// and CBC paths used by the media and control streams.
pub struct CryptoContext {
    block: Aes128,
    gcm: Aes128Gcm,
}

impl CryptoContext {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 16 {
            return Err(MoonlightError::InvalidKey);
        }
        Ok(Self {
            block: Aes128::new(GenericArray::from_slice(key)),
            gcm: <Aes128Gcm as aes_gcm::KeyInit>::new_from_slice(key)
                .map_err(|_| MoonlightError::InvalidKey)?,
        })
    }

    /// AES-GCM seal. Returns ciphertext and the 16-byte tag separately, the
    /// way the control and video framings carry them.
    pub fn encrypt_gcm(
        &self,
        plaintext: &[u8],
        iv: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, [u8; GCM_TAG_SIZE])> {
        if iv.len() != GCM_NONCE_SIZE {
            return Err(MoonlightError::EncryptionFailed);
        }
        let sealed = self
            .gcm
            .encrypt(Nonce::from_slice(iv), Payload { msg: plaintext, aad })
            .map_err(|_| MoonlightError::EncryptionFailed)?;
        let split = sealed.len() - GCM_TAG_SIZE;
        let mut tag = [0u8; GCM_TAG_SIZE];
        tag.copy_from_slice(&sealed[split..]);
        Ok((sealed[..split].to_vec(), tag))
    }

    /// AES-GCM open from a detached tag.
    pub fn decrypt_gcm(
        &self,
        ciphertext: &[u8],
        iv: &[u8],
        tag: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        if iv.len() != GCM_NONCE_SIZE || tag.len() != GCM_TAG_SIZE {
            return Err(MoonlightError::DecryptionFailed);
        }
        let mut sealed = Vec::with_capacity(ciphertext.len() + tag.len());
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);
        self.gcm
            .decrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: &sealed,
                    aad,
                },
            )
            .map_err(|_| MoonlightError::DecryptionFailed)
    }

    /// AES-CBC encrypt with PKCS7 padding.
    pub fn encrypt_cbc(&self, plaintext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != AES_BLOCK_SIZE {
            return Err(MoonlightError::EncryptionFailed);
        }
        let padding = AES_BLOCK_SIZE - (plaintext.len() % AES_BLOCK_SIZE);
        let mut padded = Vec::with_capacity(plaintext.len() + padding);
        padded.extend_from_slice(plaintext);
        padded.resize(plaintext.len() + padding, padding as u8);
        self.cbc_blocks_encrypt(&mut padded, iv);
        Ok(padded)
    }

    /// AES-CBC encrypt, zero-padded to the block boundary instead of PKCS7.
    /// Input-stream encryption wants a deterministic output size.
    pub fn encrypt_cbc_pad_to_block(&self, plaintext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != AES_BLOCK_SIZE {
            return Err(MoonlightError::EncryptionFailed);
        }
        let padded_len = plaintext.len().div_ceil(AES_BLOCK_SIZE).max(1) * AES_BLOCK_SIZE;
        let mut padded = vec![0u8; padded_len];
        padded[..plaintext.len()].copy_from_slice(plaintext);
        self.cbc_blocks_encrypt(&mut padded, iv);
        Ok(padded)
    }

    /// AES-CBC decrypt. Valid PKCS7 padding is stripped; payloads that were
    /// zero-padded pass through untouched.
    pub fn decrypt_cbc(&self, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != AES_BLOCK_SIZE
            || ciphertext.is_empty()
            || ciphertext.len() % AES_BLOCK_SIZE != 0
        {
            return Err(MoonlightError::DecryptionFailed);
        }
        let mut plaintext = ciphertext.to_vec();
        let mut prev = [0u8; AES_BLOCK_SIZE];
        prev.copy_from_slice(iv);
        for chunk in plaintext.chunks_exact_mut(AES_BLOCK_SIZE) {
            let mut saved = [0u8; AES_BLOCK_SIZE];
            saved.copy_from_slice(chunk);
            self.block.decrypt_block(GenericArray::from_mut_slice(chunk));
            for (byte, p) in chunk.iter_mut().zip(prev.iter()) {
                *byte ^= p;
            }
            prev = saved;
        }

        let pad = plaintext[plaintext.len() - 1] as usize;
        if pad > 0 && pad <= AES_BLOCK_SIZE && pad <= plaintext.len() {
            let start = plaintext.len() - pad;
            if plaintext[start..].iter().all(|&b| b as usize == pad) {
                plaintext.truncate(start);
            }
        }
        Ok(plaintext)
    }

    fn cbc_blocks_encrypt(&self, data: &mut [u8], iv: &[u8]) {
        let mut prev = [0u8; AES_BLOCK_SIZE];
        prev.copy_from_slice(iv);
        for chunk in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            for (byte, p) in chunk.iter_mut().zip(prev.iter()) {
                *byte ^= p;
            }
            self.block.encrypt_block(GenericArray::from_mut_slice(chunk));
            prev.copy_from_slice(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [0x42; 16];

    #[test]
    fn ecb_round_trip() {
        let challenge = [0xA5u8; 16];
        let sealed = encrypt_ecb(&KEY, &challenge).unwrap();
        assert_ne!(sealed, challenge);
        assert_eq!(decrypt_ecb(&KEY, &sealed).unwrap(), challenge);
    }

    #[test]
    fn ecb_rejects_partial_blocks() {
        assert!(encrypt_ecb(&KEY, &[0u8; 15]).is_err());
    }

    #[test]
    fn pair_key_matches_sha256_of_salt_and_pin() {
        let salt = [0u8; 16];
        let key = derive_pair_key(PairHash::Sha256, &salt, "1234");
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(b"1234");
        assert_eq!(key, hasher.finalize()[..16]);
    }

    #[test]
    fn pair_key_legacy_uses_sha1() {
        let salt = [7u8; 16];
        let key = derive_pair_key(PairHash::Sha1, &salt, "0000");
        let mut hasher = Sha1::new();
        hasher.update(salt);
        hasher.update(b"0000");
        assert_eq!(key, hasher.finalize()[..16]);
    }

    #[test]
    fn gcm_round_trip_with_detached_tag() {
        let ctx = CryptoContext::new(&KEY).unwrap();
        let iv = [1u8; 12];
        let (ciphertext, tag) = ctx.encrypt_gcm(b"control payload", &iv, &[]).unwrap();
        let plaintext = ctx.decrypt_gcm(&ciphertext, &iv, &tag, &[]).unwrap();
        assert_eq!(plaintext, b"control payload");
    }

    #[test]
    fn gcm_rejects_modified_tag() {
        let ctx = CryptoContext::new(&KEY).unwrap();
        let iv = [1u8; 12];
        let (ciphertext, mut tag) = ctx.encrypt_gcm(b"payload", &iv, &[]).unwrap();
        tag[0] ^= 0xFF;
        assert!(ctx.decrypt_gcm(&ciphertext, &iv, &tag, &[]).is_err());
    }

    #[test]
    fn cbc_round_trip_strips_padding() {
        let ctx = CryptoContext::new(&KEY).unwrap();
        let iv = [9u8; 16];
        for len in [1usize, 15, 16, 17, 100] {
            let plaintext = vec![0x33u8; len];
            let ciphertext = ctx.encrypt_cbc(&plaintext, &iv).unwrap();
            assert_eq!(ciphertext.len() % AES_BLOCK_SIZE, 0);
            assert_eq!(ctx.decrypt_cbc(&ciphertext, &iv).unwrap(), plaintext);
        }
    }

    #[test]
    fn cbc_pad_to_block_is_deterministic_size() {
        let ctx = CryptoContext::new(&KEY).unwrap();
        let iv = [0u8; 16];
        assert_eq!(ctx.encrypt_cbc_pad_to_block(&[1, 2, 3], &iv).unwrap().len(), 16);
        assert_eq!(ctx.encrypt_cbc_pad_to_block(&[0; 16], &iv).unwrap().len(), 16);
        assert_eq!(ctx.encrypt_cbc_pad_to_block(&[0; 17], &iv).unwrap().len(), 32);
    }
}
