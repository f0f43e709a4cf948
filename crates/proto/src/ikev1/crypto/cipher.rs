//! CBC bulk encryption for ISAKMP message bodies
//!
//! IKEv1 encrypts with a block cipher in CBC mode and chains IVs
//! across messages (RFC 2409 Appendix B): the IV of the next message
//! is the last ciphertext block of the previous one. Padding is plain
//! zero fill to the block size; the payload chain is self-describing,
//! so no pad-length octet exists.

use super::super::error::{Error, Result};
use aes::{Aes128, Aes192, Aes256};
use cbc::{Decryptor, Encryptor};
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

type Aes128CbcEnc = Encryptor<Aes128>;
type Aes128CbcDec = Decryptor<Aes128>;
type Aes192CbcEnc = Encryptor<Aes192>;
type Aes192CbcDec = Decryptor<Aes192>;
type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

/// Cipher algorithm for ISAKMP message encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// AES-CBC with 128-bit key
    Aes128Cbc,
    /// AES-CBC with 192-bit key
    Aes192Cbc,
    /// AES-CBC with 256-bit key
    Aes256Cbc,
}

impl CipherAlgorithm {
    /// Key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::Aes192Cbc => 24,
            CipherAlgorithm::Aes256Cbc => 32,
        }
    }

    /// Cipher block size in bytes
    pub fn block_size(self) -> usize {
        16
    }

    /// Pick the AES variant for a negotiated key length
    pub fn aes_for_key_len(bits: u16) -> Option<Self> {
        match bits {
            128 => Some(CipherAlgorithm::Aes128Cbc),
            192 => Some(CipherAlgorithm::Aes192Cbc),
            256 => Some(CipherAlgorithm::Aes256Cbc),
            _ => None,
        }
    }

    fn check_args(self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<()> {
        if key.len() != self.key_len() {
            return Err(Error::CryptoError(format!(
                "cipher key must be {} bytes, got {}",
                self.key_len(),
                key.len()
            )));
        }
        if iv.len() < self.block_size() {
            return Err(Error::CryptoError(format!(
                "IV must be at least {} bytes, got {}",
                self.block_size(),
                iv.len()
            )));
        }
        if data.len() % self.block_size() != 0 {
            return Err(Error::CryptoError(format!(
                "data length {} is not a multiple of the block size",
                data.len()
            )));
        }
        Ok(())
    }

    /// Encrypt `data` in place
    ///
    /// Only the first block of `iv` is used, so a longer stored IV
    /// chain can be passed directly.
    ///
    /// # Errors
    ///
    /// Returns error on a wrong key size, short IV, or a body that is
    /// not block aligned.
    pub fn encrypt_in_place(self, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
        self.check_args(key, iv, data)?;
        let iv = &iv[..self.block_size()];
        let len = data.len();
        let fail = |_| Error::CryptoError("CBC encryption failed".to_string());
        match self {
            CipherAlgorithm::Aes128Cbc => {
                let enc = Aes128CbcEnc::new_from_slices(key, iv)
                    .map_err(|_| Error::CryptoError("bad AES-128 key".to_string()))?;
                enc.encrypt_padded_mut::<NoPadding>(data, len).map_err(fail)?;
            }
            CipherAlgorithm::Aes192Cbc => {
                let enc = Aes192CbcEnc::new_from_slices(key, iv)
                    .map_err(|_| Error::CryptoError("bad AES-192 key".to_string()))?;
                enc.encrypt_padded_mut::<NoPadding>(data, len).map_err(fail)?;
            }
            CipherAlgorithm::Aes256Cbc => {
                let enc = Aes256CbcEnc::new_from_slices(key, iv)
                    .map_err(|_| Error::CryptoError("bad AES-256 key".to_string()))?;
                enc.encrypt_padded_mut::<NoPadding>(data, len).map_err(fail)?;
            }
        }
        Ok(())
    }

    /// Decrypt `data` in place
    ///
    /// # Errors
    ///
    /// Returns error on a wrong key size, short IV, or a body that is
    /// not block aligned.
    pub fn decrypt_in_place(self, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
        self.check_args(key, iv, data)?;
        let iv = &iv[..self.block_size()];
        let fail = |_| Error::CryptoError("CBC decryption failed".to_string());
        match self {
            CipherAlgorithm::Aes128Cbc => {
                let dec = Aes128CbcDec::new_from_slices(key, iv)
                    .map_err(|_| Error::CryptoError("bad AES-128 key".to_string()))?;
                dec.decrypt_padded_mut::<NoPadding>(data).map_err(fail)?;
            }
            CipherAlgorithm::Aes192Cbc => {
                let dec = Aes192CbcDec::new_from_slices(key, iv)
                    .map_err(|_| Error::CryptoError("bad AES-192 key".to_string()))?;
                dec.decrypt_padded_mut::<NoPadding>(data).map_err(fail)?;
            }
            CipherAlgorithm::Aes256Cbc => {
                let dec = Aes256CbcDec::new_from_slices(key, iv)
                    .map_err(|_| Error::CryptoError("bad AES-256 key".to_string()))?;
                dec.decrypt_padded_mut::<NoPadding>(data).map_err(fail)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_and_block_sizes() {
        assert_eq!(CipherAlgorithm::Aes128Cbc.key_len(), 16);
        assert_eq!(CipherAlgorithm::Aes192Cbc.key_len(), 24);
        assert_eq!(CipherAlgorithm::Aes256Cbc.key_len(), 32);
        assert_eq!(CipherAlgorithm::Aes128Cbc.block_size(), 16);
    }

    #[test]
    fn test_aes_for_key_len() {
        assert_eq!(
            CipherAlgorithm::aes_for_key_len(128),
            Some(CipherAlgorithm::Aes128Cbc)
        );
        assert_eq!(
            CipherAlgorithm::aes_for_key_len(256),
            Some(CipherAlgorithm::Aes256Cbc)
        );
        assert_eq!(CipherAlgorithm::aes_for_key_len(512), None);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = vec![0x42; 16];
        let iv = vec![0x01; 16];
        let plaintext = b"0123456789abcdef0123456789abcdef".to_vec();

        let mut data = plaintext.clone();
        CipherAlgorithm::Aes128Cbc
            .encrypt_in_place(&key, &iv, &mut data)
            .unwrap();
        assert_ne!(data, plaintext);

        CipherAlgorithm::Aes128Cbc
            .decrypt_in_place(&key, &iv, &mut data)
            .unwrap();
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_iv_chaining_equivalence() {
        // decrypting the second block with the first ciphertext block
        // as IV equals a straight two-block decryption
        let key = vec![0x42; 32];
        let iv = vec![0x07; 16];
        let plaintext = vec![0x5A; 32];

        let mut whole = plaintext.clone();
        CipherAlgorithm::Aes256Cbc
            .encrypt_in_place(&key, &iv, &mut whole)
            .unwrap();

        let chain_iv = whole[..16].to_vec();
        let mut tail = whole[16..].to_vec();
        CipherAlgorithm::Aes256Cbc
            .decrypt_in_place(&key, &chain_iv, &mut tail)
            .unwrap();
        assert_eq!(tail, plaintext[16..]);
    }

    #[test]
    fn test_unaligned_body_rejected() {
        let key = vec![0x42; 16];
        let iv = vec![0x01; 16];
        let mut data = vec![0; 17];
        let result = CipherAlgorithm::Aes128Cbc.encrypt_in_place(&key, &iv, &mut data);
        assert!(matches!(result, Err(Error::CryptoError(_))));
    }

    #[test]
    fn test_wrong_key_size_rejected() {
        let key = vec![0x42; 10];
        let iv = vec![0x01; 16];
        let mut data = vec![0; 16];
        let result = CipherAlgorithm::Aes128Cbc.encrypt_in_place(&key, &iv, &mut data);
        assert!(matches!(result, Err(Error::CryptoError(_))));
    }

    #[test]
    fn test_long_iv_uses_first_block() {
        let key = vec![0x42; 16];
        let short_iv = vec![0x01; 16];
        let mut long_iv = short_iv.clone();
        long_iv.extend_from_slice(&[0xFF; 16]);

        let mut a = vec![0xAB; 16];
        let mut b = a.clone();
        CipherAlgorithm::Aes128Cbc
            .encrypt_in_place(&key, &short_iv, &mut a)
            .unwrap();
        CipherAlgorithm::Aes128Cbc
            .encrypt_in_place(&key, &long_iv, &mut b)
            .unwrap();
        assert_eq!(a, b);
    }
}
