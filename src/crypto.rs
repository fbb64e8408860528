//! Symmetric primitives used by Basic Access Control.
//!
//! BAC only ever uses two-key Triple-DES in CBC mode, the ISO/IEC 9797-1 MAC
//! algorithm 3 ("retail MAC") and SHA-1 based key derivation. The handshake does
//! not call these functions directly, it goes through the [`Primitives`] and
//! [`KeyDerivation`] traits so that a different toolbox can be plugged in.

use alloc::{format, vec::Vec};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use core::iter;
use sha1_checked::Sha1;
use tracing::error;

use crate::EmrtdError;

/// Cipher block size of DES and Triple-DES.
pub const BLOCK_SIZE: usize = 8;

/// Length of every BAC key and key seed.
pub const KEY_LEN: usize = 16;

/// Which key a [`KeyDerivation`] should produce from a seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Encryption,
    Mac,
}

/// Key Derivation Function capability.
///
/// See ICAO Doc 9303-11 Section 9.7.1:
/// <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>
pub trait KeyDerivation {
    /// Derives a 16 byte key of the given type from a 16 byte key seed.
    ///
    /// # Errors
    ///
    /// * `EmrtdError::KeyDerivationError` if `key_seed` is not exactly 16 bytes long.
    fn derive_key(&self, key_seed: &[u8], key_type: KeyType) -> Result<[u8; KEY_LEN], EmrtdError>;
}

/// The toolbox of primitives the BAC handshake is built on.
///
/// `encrypt_cbc`, `decrypt_cbc` and `mac` work on whole blocks and never pad
/// internally; callers pad with [`Primitives::pad`] where the protocol requires it.
pub trait Primitives: KeyDerivation {
    /// Hashes `data`. The digest must be at least 16 bytes long.
    fn hash(&self, data: &[u8]) -> Result<Vec<u8>, EmrtdError>;

    fn encrypt_cbc(
        &self,
        key: &[u8; KEY_LEN],
        iv: &[u8; BLOCK_SIZE],
        data: &[u8],
    ) -> Result<Vec<u8>, EmrtdError>;

    fn decrypt_cbc(
        &self,
        key: &[u8; KEY_LEN],
        iv: &[u8; BLOCK_SIZE],
        data: &[u8],
    ) -> Result<Vec<u8>, EmrtdError>;

    /// Computes the 8 byte MAC of already padded data.
    fn mac(&self, key: &[u8; KEY_LEN], padded_data: &[u8]) -> Result<[u8; BLOCK_SIZE], EmrtdError>;

    /// Pads `data` to a multiple of the block size.
    fn pad(&self, data: &[u8]) -> Result<Vec<u8>, EmrtdError> {
        padding_method_2(data, BLOCK_SIZE)
    }

    /// XORs two slices of equal length.
    fn xor(&self, a: &[u8], b: &[u8]) -> Result<Vec<u8>, EmrtdError> {
        xor_slices(a, b)
    }
}

/// Two-key Triple-DES toolbox mandated for BAC.
#[derive(Debug, Default, Clone, Copy)]
pub struct Des3;

impl KeyDerivation for Des3 {
    fn derive_key(&self, key_seed: &[u8], key_type: KeyType) -> Result<[u8; KEY_LEN], EmrtdError> {
        compute_key(key_seed, key_type)
    }
}

impl Primitives for Des3 {
    fn hash(&self, data: &[u8]) -> Result<Vec<u8>, EmrtdError> {
        generate_key_seed(data)
    }

    fn encrypt_cbc(
        &self,
        key: &[u8; KEY_LEN],
        iv: &[u8; BLOCK_SIZE],
        data: &[u8],
    ) -> Result<Vec<u8>, EmrtdError> {
        encrypt::<cbc::Encryptor<des::TdesEde2>>(key, iv, data)
    }

    fn decrypt_cbc(
        &self,
        key: &[u8; KEY_LEN],
        iv: &[u8; BLOCK_SIZE],
        data: &[u8],
    ) -> Result<Vec<u8>, EmrtdError> {
        decrypt::<cbc::Decryptor<des::TdesEde2>>(key, iv, data)
    }

    fn mac(&self, key: &[u8; KEY_LEN], padded_data: &[u8]) -> Result<[u8; BLOCK_SIZE], EmrtdError> {
        compute_mac(key, padded_data)
    }
}

/// Generates a key seed from the given secret.
///
/// Calculates the SHA-1 of `secret` and returns the full 20 byte digest, the
/// caller keeps the most significant 16 bytes.
///
/// Calculation is explained at ICAO Doc 9303-11 Section 4.3.2:
/// <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>
///
/// # Errors
///
/// `EmrtdError` if the SHA-1 computation detects a collision attack.
pub fn generate_key_seed(secret: &[u8]) -> Result<Vec<u8>, EmrtdError> {
    let hash_result = Sha1::try_digest(secret);
    if hash_result.has_collision() {
        error!("SHA1 hash calculation during generate_key_seed had collision");
        return Err(EmrtdError::CalculateHashError(
            "SHA1 hash calculation during generate_key_seed had collision",
        ));
    }
    Ok(hash_result.hash().as_slice().to_vec())
}

/// Computes a two-key Triple-DES key from a key seed.
///
/// `K = SHA-1(key_seed || c)[..16]` with `c = 00000001` for encryption and
/// `c = 00000002` for MAC keys, followed by DES parity adjustment.
///
/// For calculation examples see ICAO Doc 9303-11 Appendix D.1:
/// <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>
///
/// # Errors
///
/// * `EmrtdError::KeyDerivationError` if `key_seed` is not 16 bytes long.
/// * `EmrtdError::CalculateHashError` if SHA-1 detects a collision.
pub fn compute_key(key_seed: &[u8], key_type: KeyType) -> Result<[u8; KEY_LEN], EmrtdError> {
    if key_seed.len() != KEY_LEN {
        error!(
            "Key seed must be {KEY_LEN} bytes for key derivation, found {}",
            key_seed.len()
        );
        return Err(EmrtdError::KeyDerivationError(
            "Key seed must be exactly 16 bytes",
        ));
    }

    let c: &[u8] = match key_type {
        KeyType::Encryption => b"\x00\x00\x00\x01",
        KeyType::Mac => b"\x00\x00\x00\x02",
    };
    let d = [key_seed, c].concat();

    let hash_result = Sha1::try_digest(&d);
    if hash_result.has_collision() {
        error!("SHA1 hash calculation during compute_key had collision");
        return Err(EmrtdError::CalculateHashError(
            "SHA1 hash calculation during compute_key had collision",
        ));
    }

    let mut key = [0; KEY_LEN];
    key.copy_from_slice(&hash_result.hash().as_slice()[..KEY_LEN]);
    des3_adjust_parity_bits(&mut key);
    Ok(key)
}

/// Encrypts whole blocks using the specified block cipher mode, without padding.
///
/// # Errors
///
/// `EmrtdError` if the key, IV or data length does not fit the cipher.
fn encrypt<CM>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, EmrtdError>
where
    CM: BlockEncryptMut + KeyIvInit,
{
    if key.len() != CM::key_size() {
        error!(
            "Wrong key size for cipher encryption, expected {}, found {}",
            CM::key_size(),
            key.len()
        );
        return Err(EmrtdError::InvalidArgument(
            "Wrong key size for cipher encryption",
        ));
    }
    if iv.len() != CM::iv_size() {
        error!(
            "Wrong IV size for cipher encryption, expected {}, found {}",
            CM::iv_size(),
            iv.len()
        );
        return Err(EmrtdError::InvalidArgument(
            "Wrong IV size for cipher encryption",
        ));
    }
    if data.len() % CM::block_size() != 0 {
        error!(
            "Data for cipher encryption must be a multiple of {}, found {}",
            CM::block_size(),
            data.len()
        );
        return Err(EmrtdError::InvalidArgument(
            "Wrong data size for cipher encryption",
        ));
    }

    Ok(CM::new(key.into(), iv.into())
        .encrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data))
}

/// Decrypts whole blocks using the specified block cipher mode, without padding.
///
/// # Errors
///
/// `EmrtdError` if the key, IV or data length does not fit the cipher.
fn decrypt<CM>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, EmrtdError>
where
    CM: BlockDecryptMut + KeyIvInit,
{
    if key.len() != CM::key_size() {
        error!(
            "Wrong key size for cipher decryption, expected {}, found {}",
            CM::key_size(),
            key.len()
        );
        return Err(EmrtdError::InvalidArgument(
            "Wrong key size for cipher decryption",
        ));
    }
    if iv.len() != CM::iv_size() {
        error!(
            "Wrong IV size for cipher decryption, expected {}, found {}",
            CM::iv_size(),
            iv.len()
        );
        return Err(EmrtdError::InvalidArgument(
            "Wrong IV size for cipher decryption",
        ));
    }
    if data.len() % CM::block_size() != 0 {
        error!(
            "Data for cipher decryption must be a multiple of {}, found {}",
            CM::block_size(),
            data.len()
        );
        return Err(EmrtdError::InvalidArgument(
            "Wrong data size for cipher decryption",
        ));
    }

    CM::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data)
        .map_err(EmrtdError::UnpadError)
}

/// Single DES block operation in ECB mode, the building block of the retail MAC.
fn des_ecb_encrypt(key: &[u8], block: &[u8]) -> Result<Vec<u8>, EmrtdError> {
    if key.len() != 8 || block.len() != BLOCK_SIZE {
        error!(
            "DES block operation needs an 8 byte key and block, found {} and {}",
            key.len(),
            block.len()
        );
        return Err(EmrtdError::InvalidArgument(
            "Wrong key or block size for DES encryption",
        ));
    }
    Ok(ecb::Encryptor::<des::Des>::new(key.into())
        .encrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(block))
}

fn des_ecb_decrypt(key: &[u8], block: &[u8]) -> Result<Vec<u8>, EmrtdError> {
    if key.len() != 8 || block.len() != BLOCK_SIZE {
        error!(
            "DES block operation needs an 8 byte key and block, found {} and {}",
            key.len(),
            block.len()
        );
        return Err(EmrtdError::InvalidArgument(
            "Wrong key or block size for DES decryption",
        ));
    }
    ecb::Decryptor::<des::Des>::new(key.into())
        .decrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(block)
        .map_err(EmrtdError::UnpadError)
}

/// Computes the ISO/IEC 9797-1 MAC algorithm 3 of padded data.
///
/// Every block is chained through single DES under the first half of the key,
/// the final block is then decrypted with the second half and encrypted again
/// with the first.
///
/// # Errors
///
/// * `EmrtdError` if `key` is not 16 bytes or `data` is not a non-empty multiple of 8.
pub fn compute_mac(key: &[u8], data: &[u8]) -> Result<[u8; BLOCK_SIZE], EmrtdError> {
    if key.len() != KEY_LEN {
        error!("Can not compute MAC, MAC key is invalid.");
        return Err(EmrtdError::InvalidArgument("MAC key must be 16 bytes"));
    }
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        error!("Can not compute MAC, data length is invalid.");
        return Err(EmrtdError::ParseDataError(format!(
            "MAC input should be a non-empty multiple of 8, but found {}",
            data.len()
        )));
    }

    let (key1, key2) = key.split_at(8);

    let mut h = des_ecb_encrypt(key1, &data[..BLOCK_SIZE])?;
    for block in data[BLOCK_SIZE..].chunks(BLOCK_SIZE) {
        h = des_ecb_encrypt(key1, &xor_slices(&h, block)?)?;
    }
    let mac_x = des_ecb_encrypt(key1, &des_ecb_decrypt(key2, &h)?)?;

    let mut mac = [0; BLOCK_SIZE];
    mac.copy_from_slice(&mac_x);
    Ok(mac)
}

/// XORs two byte slices and returns the result.
///
/// # Errors
///
/// * `EmrtdError` if input `a` and `b` have different lengths.
pub fn xor_slices(a: &[u8], b: &[u8]) -> Result<Vec<u8>, EmrtdError> {
    if a.len() == b.len() {
        return Ok(a.iter().zip(b).map(|(&x, &y)| x ^ y).collect());
    }
    error!(
        "XORed slices must have the same length, found {}, {}",
        a.len(),
        b.len()
    );
    Err(EmrtdError::ParseDataError(format!(
        "XORed slices must have the same length, found {}, {}",
        a.len(),
        b.len()
    )))
}

/// Pads the input data using padding method 2.
///
/// <https://en.wikipedia.org/wiki/ISO/IEC_9797-1#Padding_method_2>
///
/// # Errors
///
/// * `EmrtdError` if `pad_to` is 0.
pub fn padding_method_2(data: &[u8], pad_to: usize) -> Result<Vec<u8>, EmrtdError> {
    if pad_to == 0 {
        error!("pad_to must be greater than 0, found {}", pad_to);
        return Err(EmrtdError::InvalidArgument("pad_to must be greater than 0"));
    }

    let mut data = data.to_vec();
    data.push(0x80);
    if data.len() % pad_to != 0 {
        let padding_len = pad_to - (data.len() % pad_to);
        data.extend(iter::repeat(0).take(padding_len));
    }
    Ok(data)
}

/// Sets the least significant bit of every byte so the byte has odd parity.
fn des3_adjust_parity_bits(key: &mut [u8]) {
    for byte in key {
        let mut bitmask = 1;
        let mut b = *byte;
        for _ in 0..8 {
            bitmask ^= b & 0x1;
            b >>= 1;
        }
        *byte ^= bitmask;
    }
}
