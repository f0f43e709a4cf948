//! Pseudo-Random Function (PRF) and SKEYID derivation
//!
//! Implements the keyed and unkeyed hash operations of RFC 2409
//! Section 5. IKEv1 pairs the PRF with the negotiated hash function:
//! the PRF is HMAC over that hash.

use super::super::error::{Error, Result};
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// PRF algorithm (HMAC over the negotiated hash)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfAlgorithm {
    /// HMAC-SHA1
    HmacSha1,
    /// HMAC-SHA2-256
    HmacSha256,
}

impl PrfAlgorithm {
    /// PRF output length in bytes
    pub fn output_len(self) -> usize {
        match self {
            PrfAlgorithm::HmacSha1 => 20,
            PrfAlgorithm::HmacSha256 => 32,
        }
    }

    /// Compute the PRF over one input
    pub fn compute(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            PrfAlgorithm::HmacSha1 => {
                let mut mac =
                    Hmac::<Sha1>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            PrfAlgorithm::HmacSha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Compute the PRF over concatenated inputs
    pub fn compute_parts(self, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
        let mut data = Vec::new();
        for part in parts {
            data.extend_from_slice(part);
        }
        let out = self.compute(key, &data);
        data.zeroize();
        out
    }

    /// The paired unkeyed hash (used for IVs)
    pub fn digest(self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            PrfAlgorithm::HmacSha1 => {
                let mut h = Sha1::new();
                for part in parts {
                    h.update(part);
                }
                h.finalize().to_vec()
            }
            PrfAlgorithm::HmacSha256 => {
                let mut h = Sha256::new();
                for part in parts {
                    h.update(part);
                }
                h.finalize().to_vec()
            }
        }
    }
}

/// SKEYID for pre-shared key authentication
///
/// ```text
/// SKEYID = prf(pre-shared-key, Ni_b | Nr_b)
/// ```
pub fn skeyid_psk(prf: PrfAlgorithm, psk: &[u8], ni: &[u8], nr: &[u8]) -> Vec<u8> {
    prf.compute_parts(psk, &[ni, nr])
}

/// SKEYID for signature authentication
///
/// ```text
/// SKEYID = prf(Ni_b | Nr_b, g^xy)
/// ```
pub fn skeyid_sig(prf: PrfAlgorithm, ni: &[u8], nr: &[u8], g_xy: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(ni.len() + nr.len());
    key.extend_from_slice(ni);
    key.extend_from_slice(nr);
    let out = prf.compute(&key, g_xy);
    key.zeroize();
    out
}

/// Phase 1 keying material derived from SKEYID
///
/// RFC 2409 Section 5:
/// ```text
/// SKEYID_d = prf(SKEYID, g^xy | CKY-I | CKY-R | 0)
/// SKEYID_a = prf(SKEYID, SKEYID_d | g^xy | CKY-I | CKY-R | 1)
/// SKEYID_e = prf(SKEYID, SKEYID_a | g^xy | CKY-I | CKY-R | 2)
/// ```
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// SKEYID, kept for the Phase 1 authentication hashes
    pub skeyid: Vec<u8>,
    /// Derivation key for IPsec SA keying material
    pub skeyid_d: Vec<u8>,
    /// Authentication key (HASH(1/2/3), informational hashes)
    pub skeyid_a: Vec<u8>,
    /// Encryption key seed
    pub skeyid_e: Vec<u8>,
    /// Cipher key carved out of SKEYID_e (expanded if needed)
    pub enc_key: Vec<u8>,
}

impl KeyMaterial {
    /// Derive the Phase 1 keys
    ///
    /// `enc_key_len` is the negotiated cipher's key size; when
    /// SKEYID_e is too short the key is expanded per Appendix B:
    /// ```text
    /// Ka = K1 | K2 | ...,  K1 = prf(SKEYID_e, 0),  Ki = prf(SKEYID_e, K(i-1))
    /// ```
    ///
    /// # Errors
    ///
    /// Returns error if `enc_key_len` is zero.
    pub fn derive(
        prf: PrfAlgorithm,
        skeyid: Vec<u8>,
        g_xy: &[u8],
        cky_i: &[u8; 8],
        cky_r: &[u8; 8],
        enc_key_len: usize,
    ) -> Result<Self> {
        if enc_key_len == 0 {
            return Err(Error::CryptoError("cipher key length is zero".to_string()));
        }

        let skeyid_d = prf.compute_parts(&skeyid, &[g_xy, cky_i, cky_r, &[0]]);
        let skeyid_a = prf.compute_parts(&skeyid, &[&skeyid_d, g_xy, cky_i, cky_r, &[1]]);
        let skeyid_e = prf.compute_parts(&skeyid, &[&skeyid_a, g_xy, cky_i, cky_r, &[2]]);

        let enc_key = if skeyid_e.len() >= enc_key_len {
            skeyid_e[..enc_key_len].to_vec()
        } else {
            let mut expanded = Vec::with_capacity(enc_key_len + prf.output_len());
            let mut block = prf.compute(&skeyid_e, &[0]);
            while expanded.len() < enc_key_len {
                expanded.extend_from_slice(&block);
                block = prf.compute(&skeyid_e, &block);
            }
            block.zeroize();
            expanded.truncate(enc_key_len);
            expanded
        };

        Ok(KeyMaterial {
            skeyid,
            skeyid_d,
            skeyid_a,
            skeyid_e,
            enc_key,
        })
    }
}

/// Phase 1 authentication hash (RFC 2409 Section 5)
///
/// ```text
/// HASH_I = prf(SKEYID, g^xi | g^xr | CKY-I | CKY-R | SAi_b | IDii_b)
/// HASH_R = prf(SKEYID, g^xr | g^xi | CKY-R | CKY-I | SAi_b | IDir_b)
/// ```
///
/// `of_initiator` selects which of the two is computed; `id_body` is
/// the ID payload body of the side being authenticated.
#[allow(clippy::too_many_arguments)]
pub fn main_mode_hash(
    prf: PrfAlgorithm,
    skeyid: &[u8],
    of_initiator: bool,
    g_xi: &[u8],
    g_xr: &[u8],
    cky_i: &[u8; 8],
    cky_r: &[u8; 8],
    sa_body: &[u8],
    id_body: &[u8],
) -> Vec<u8> {
    if of_initiator {
        prf.compute_parts(skeyid, &[g_xi, g_xr, cky_i, cky_r, sa_body, id_body])
    } else {
        prf.compute_parts(skeyid, &[g_xr, g_xi, cky_r, cky_i, sa_body, id_body])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prf_output_len() {
        assert_eq!(PrfAlgorithm::HmacSha1.output_len(), 20);
        assert_eq!(PrfAlgorithm::HmacSha256.output_len(), 32);
    }

    #[test]
    fn test_prf_deterministic() {
        let a = PrfAlgorithm::HmacSha1.compute(b"key", b"data");
        let b = PrfAlgorithm::HmacSha1.compute(b"key", b"data");
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);

        let c = PrfAlgorithm::HmacSha256.compute(b"key", b"data");
        assert_ne!(a, c);
        assert_eq!(c.len(), 32);
    }

    #[test]
    fn test_compute_parts_equals_concat() {
        let joined = PrfAlgorithm::HmacSha1.compute(b"k", b"abcdef");
        let parts = PrfAlgorithm::HmacSha1.compute_parts(b"k", &[b"abc", b"def"]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn test_skeyid_psk_depends_on_all_inputs() {
        let prf = PrfAlgorithm::HmacSha1;
        let base = skeyid_psk(prf, b"secret", b"ni", b"nr");
        assert_ne!(base, skeyid_psk(prf, b"other", b"ni", b"nr"));
        assert_ne!(base, skeyid_psk(prf, b"secret", b"nx", b"nr"));
        assert_ne!(base, skeyid_psk(prf, b"secret", b"ni", b"nx"));
    }

    #[test]
    fn test_skeyid_sig_differs_from_psk() {
        let prf = PrfAlgorithm::HmacSha1;
        assert_ne!(
            skeyid_psk(prf, b"gxy", b"ni", b"nr"),
            skeyid_sig(prf, b"ni", b"nr", b"gxy")
        );
    }

    #[test]
    fn test_key_material_derivation() {
        let prf = PrfAlgorithm::HmacSha1;
        let skeyid = skeyid_psk(prf, b"secret", b"ni", b"nr");
        let km = KeyMaterial::derive(prf, skeyid, b"shared", &[1; 8], &[2; 8], 16).unwrap();

        assert_eq!(km.skeyid_d.len(), 20);
        assert_eq!(km.skeyid_a.len(), 20);
        assert_eq!(km.skeyid_e.len(), 20);
        assert_eq!(km.enc_key.len(), 16);

        assert_ne!(km.skeyid_d, km.skeyid_a);
        assert_ne!(km.skeyid_a, km.skeyid_e);
        // short enough to be carved straight from SKEYID_e
        assert_eq!(km.enc_key, km.skeyid_e[..16].to_vec());
    }

    #[test]
    fn test_key_material_expansion() {
        // a 32-byte AES key does not fit in one SHA1 output
        let prf = PrfAlgorithm::HmacSha1;
        let skeyid = skeyid_psk(prf, b"secret", b"ni", b"nr");
        let km =
            KeyMaterial::derive(prf, skeyid, b"shared", &[1; 8], &[2; 8], 32).unwrap();
        assert_eq!(km.enc_key.len(), 32);
        // first block of the expansion is prf(SKEYID_e, 0)
        assert_eq!(km.enc_key[..20], prf.compute(&km.skeyid_e, &[0])[..]);
    }

    #[test]
    fn test_key_material_zero_len_rejected() {
        let prf = PrfAlgorithm::HmacSha1;
        let result = KeyMaterial::derive(prf, vec![0; 20], b"s", &[0; 8], &[0; 8], 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_main_mode_hash_sides_differ() {
        let prf = PrfAlgorithm::HmacSha1;
        let hi = main_mode_hash(
            prf, b"skeyid", true, b"gxi", b"gxr", &[1; 8], &[2; 8], b"sa", b"idi",
        );
        let hr = main_mode_hash(
            prf, b"skeyid", false, b"gxi", b"gxr", &[1; 8], &[2; 8], b"sa", b"idr",
        );
        assert_ne!(hi, hr);

        // both sides compute the same HASH_I
        let hi2 = main_mode_hash(
            prf, b"skeyid", true, b"gxi", b"gxr", &[1; 8], &[2; 8], b"sa", b"idi",
        );
        assert_eq!(hi, hi2);
    }

    #[test]
    fn test_digest_matches_direct_hash() {
        use sha1::{Digest, Sha1};
        let direct = Sha1::digest(b"abcdef").to_vec();
        let parts = PrfAlgorithm::HmacSha1.digest(&[b"abc", b"def"]);
        assert_eq!(direct, parts);
    }
}
