//! LUKS anti-forensic information splitter
//!
//! A key of `n` bytes is expanded to `n * stripes` bytes such that losing any single stripe makes
//! the key unrecoverable. Every stripe but the last is random; the last is the key XOR the
//! diffused accumulation of the others.

use byteorder::{BigEndian, ByteOrder};
use zeroize::Zeroizing;

use crate::crypto::{fill_random, HashSpec};
use crate::device::{Error, Result};

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Hash `buf` in place, one digest-sized block at a time, each block prefixed with its big-endian
/// index. The final block may be shorter than the digest and takes a prefix of it.
pub fn diffuse(hash: HashSpec, buf: &mut [u8]) {
    let mut index = [0u8; 4];
    for (i, block) in buf.chunks_mut(hash.digest_size()).enumerate() {
        BigEndian::write_u32(&mut index, i as u32);
        let digest = hash.hash(&[&index[..], &block[..]]);
        let len = block.len();
        block.copy_from_slice(&digest[..len]);
    }
}

/// Largest anti-forensic area accepted, far above the 256000 bytes of a 512-bit key in 4000 stripes
pub const MAX_MATERIAL: usize = 16 * 1024 * 1024;

/// Bytes of key material for `stripes` copies of a `key_len` byte key
pub fn material_len(key_len: usize, stripes: u32) -> Result<usize> {
    if key_len == 0 || stripes == 0 {
        return Err(Error::CryptoError("anti-forensic geometry must be non-empty".to_string()));
    }
    key_len
        .checked_mul(stripes as usize)
        .filter(|&len| len <= MAX_MATERIAL)
        .ok_or_else(|| {
            Error::CryptoError(format!(
                "{} stripes of a {} byte key exceed the {} byte limit",
                stripes, key_len, MAX_MATERIAL
            ))
        })
}

/// Split `key` into `key.len() * stripes` bytes of key material
pub fn split(key: &[u8], stripes: u32, hash: HashSpec) -> Result<Zeroizing<Vec<u8>>> {
    let len = key.len();
    let mut material = Zeroizing::new(vec![0u8; material_len(len, stripes)?]);

    let mut acc = Zeroizing::new(vec![0u8; len]);
    let (random, last) = material.split_at_mut(len * (stripes as usize - 1));
    fill_random(random)?;
    for stripe in random.chunks_exact(len) {
        xor_into(&mut acc, stripe);
        diffuse(hash, &mut acc);
    }

    last.copy_from_slice(key);
    xor_into(last, &acc);
    Ok(material)
}

/// Recover a `key_len` byte key from the first `key_len * stripes` bytes of `material`
pub fn merge(material: &[u8], key_len: usize, stripes: u32, hash: HashSpec) -> Result<Zeroizing<Vec<u8>>> {
    let used = material_len(key_len, stripes)?;
    if material.len() < used {
        return Err(Error::CryptoError(format!(
            "{} bytes of key material cannot hold {} stripes of {} bytes",
            material.len(),
            stripes,
            key_len
        )));
    }

    let mut acc = Zeroizing::new(vec![0u8; key_len]);
    let (random, last) = material[..used].split_at(key_len * (stripes as usize - 1));
    for stripe in random.chunks_exact(key_len) {
        xor_into(&mut acc, stripe);
        diffuse(hash, &mut acc);
    }
    xor_into(&mut acc, last);
    Ok(acc)
}
