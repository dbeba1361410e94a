//! The symmetric cipher applied to every payload region.
//!
//! This is the protocol's own scheme and must be reproduced byte-for-byte:
//! an 8-byte-block, 16-round cipher (delta `0x9E3779B9`, four big-endian key
//! words) with plaintext/ciphertext chaining across blocks, a variable random
//! padding header and a fixed 7-zero-byte tail acting as the integrity check.
//!
//! Layout of the padded plaintext before block encryption:
//!
//! ```text
//! [ (rand & 0xF8) | pad ] [ pad + 2 random bytes ] [ plaintext ] [ 7 zero bytes ]
//! ```
//!
//! with `pad = (8 - (len + 10) % 8) % 8`, so the output is always a multiple
//! of 8 and at least 16 bytes, even for empty input. Decryption recovers the
//! pad count from the low three bits of the first byte and fails on any
//! length or tail violation. A decrypt failure means "drop this packet";
//! it is fatal only during the login handshake's fixed early packets.

use rand::Rng;

use crate::error::{ProtocolError, Result};

const DELTA: u32 = 0x9E37_79B9;
const ROUNDS: u32 = 16;

/// Smallest possible ciphertext (empty plaintext still pads out to this).
pub const MIN_CRYPT_LENGTH: usize = 16;

fn key_words(key: &[u8; 16]) -> [u32; 4] {
    [
        u32::from_be_bytes([key[0], key[1], key[2], key[3]]),
        u32::from_be_bytes([key[4], key[5], key[6], key[7]]),
        u32::from_be_bytes([key[8], key[9], key[10], key[11]]),
        u32::from_be_bytes([key[12], key[13], key[14], key[15]]),
    ]
}

fn encipher(block: &mut [u8; 8], k: &[u32; 4]) {
    let mut y = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
    let mut z = u32::from_be_bytes([block[4], block[5], block[6], block[7]]);
    let mut sum = 0u32;
    for _ in 0..ROUNDS {
        sum = sum.wrapping_add(DELTA);
        y = y.wrapping_add(
            (z << 4).wrapping_add(k[0]) ^ z.wrapping_add(sum) ^ (z >> 5).wrapping_add(k[1]),
        );
        z = z.wrapping_add(
            (y << 4).wrapping_add(k[2]) ^ y.wrapping_add(sum) ^ (y >> 5).wrapping_add(k[3]),
        );
    }
    block[..4].copy_from_slice(&y.to_be_bytes());
    block[4..].copy_from_slice(&z.to_be_bytes());
}

fn decipher(block: &mut [u8; 8], k: &[u32; 4]) {
    let mut y = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
    let mut z = u32::from_be_bytes([block[4], block[5], block[6], block[7]]);
    let mut sum = DELTA.wrapping_mul(ROUNDS);
    for _ in 0..ROUNDS {
        z = z.wrapping_sub(
            (y << 4).wrapping_add(k[2]) ^ y.wrapping_add(sum) ^ (y >> 5).wrapping_add(k[3]),
        );
        y = y.wrapping_sub(
            (z << 4).wrapping_add(k[0]) ^ z.wrapping_add(sum) ^ (z >> 5).wrapping_add(k[1]),
        );
        sum = sum.wrapping_sub(DELTA);
    }
    block[..4].copy_from_slice(&y.to_be_bytes());
    block[4..].copy_from_slice(&z.to_be_bytes());
}

/// Encrypt a payload. Output length is `plain.len() + pad + 10` where
/// `pad` is 0..=7; never less than [`MIN_CRYPT_LENGTH`].
pub fn encrypt(plain: &[u8], key: &[u8; 16]) -> Vec<u8> {
    let k = key_words(key);
    let mut rng = rand::rng();

    let mut pad = (plain.len() + 10) % 8;
    if pad != 0 {
        pad = 8 - pad;
    }

    let mut padded = Vec::with_capacity(plain.len() + pad + 10);
    padded.push((rng.random::<u8>() & 0xF8) | pad as u8);
    for _ in 0..pad + 2 {
        padded.push(rng.random::<u8>());
    }
    padded.extend_from_slice(plain);
    padded.extend_from_slice(&[0u8; 7]);
    debug_assert_eq!(padded.len() % 8, 0);

    let mut out = Vec::with_capacity(padded.len());
    let mut prev_xored = [0u8; 8]; // previous plaintext block after chaining xor
    let mut prev_cipher = [0u8; 8];
    for chunk in padded.chunks_exact(8) {
        let mut x: [u8; 8] = chunk.try_into().expect("chunks_exact(8)");
        for i in 0..8 {
            x[i] ^= prev_cipher[i];
        }
        let mut c = x;
        encipher(&mut c, &k);
        for i in 0..8 {
            c[i] ^= prev_xored[i];
        }
        out.extend_from_slice(&c);
        prev_xored = x;
        prev_cipher = c;
    }
    out
}

/// Decrypt a payload. Fails on truncated, misaligned or corrupted input;
/// never panics.
pub fn decrypt(crypted: &[u8], key: &[u8; 16]) -> Result<Vec<u8>> {
    if crypted.len() < MIN_CRYPT_LENGTH || crypted.len() % 8 != 0 {
        return Err(ProtocolError::Decrypt);
    }
    let k = key_words(key);

    let mut padded = Vec::with_capacity(crypted.len());
    let mut prev_xored = [0u8; 8];
    let mut prev_cipher = [0u8; 8];
    for chunk in crypted.chunks_exact(8) {
        let c: [u8; 8] = chunk.try_into().expect("chunks_exact(8)");
        let mut x = c;
        for i in 0..8 {
            x[i] ^= prev_xored[i];
        }
        decipher(&mut x, &k);
        let mut p = x;
        for i in 0..8 {
            p[i] ^= prev_cipher[i];
        }
        padded.extend_from_slice(&p);
        prev_xored = x;
        prev_cipher = c;
    }

    let pad = (padded[0] & 0x07) as usize;
    let skip = 1 + pad + 2;
    if padded.len() < skip + 7 {
        return Err(ProtocolError::Decrypt);
    }
    if padded[padded.len() - 7..].iter().any(|&b| b != 0) {
        return Err(ProtocolError::Decrypt);
    }
    Ok(padded[skip..padded.len() - 7].to_vec())
}
