//! Crypto provider: passphrase key derivation, the sector cipher protecting key material and the
//! hash used by the anti-forensic splitter.
//!
//! Only the primitives LUKS1 headers commonly declare are supported: PBKDF2 over SHA-1, SHA-256 or
//! SHA-512, and AES in `ecb`, `cbc-plain`, `cbc-plain64`, `cbc-essiv:<hash>`, `xts-plain` or
//! `xts-plain64` mode.

use std::fmt;
use std::str::FromStr;

use aes::cipher::consts::U16;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{
    BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, BlockSizeUser, InnerIvInit, KeyInit,
};
use aes::{Aes128, Aes192, Aes256};
use byteorder::{ByteOrder, LittleEndian};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use xts_mode::{get_tweak_default, Xts128};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::device::{Error, Result};

use luks_header::LUKS_SECTOR_SIZE;

const AES_BLOCK_SIZE: usize = 16;

/// Hash named by the header `hashSpec` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashSpec {
    Sha1,
    Sha256,
    Sha512,
}

impl HashSpec {
    pub fn digest_size(&self) -> usize {
        match self {
            HashSpec::Sha1 => 20,
            HashSpec::Sha256 => 32,
            HashSpec::Sha512 => 64,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashSpec::Sha1 => "sha1",
            HashSpec::Sha256 => "sha256",
            HashSpec::Sha512 => "sha512",
        }
    }

    /// Digest of the concatenation of `parts`
    pub fn hash(&self, parts: &[&[u8]]) -> Zeroizing<Vec<u8>> {
        match self {
            HashSpec::Sha1 => digest_parts::<Sha1>(parts),
            HashSpec::Sha256 => digest_parts::<Sha256>(parts),
            HashSpec::Sha512 => digest_parts::<Sha512>(parts),
        }
    }
}

fn digest_parts<D: Digest>(parts: &[&[u8]]) -> Zeroizing<Vec<u8>> {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    Zeroizing::new(hasher.finalize().to_vec())
}

impl FromStr for HashSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<HashSpec> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashSpec::Sha1),
            "sha256" => Ok(HashSpec::Sha256),
            "sha512" => Ok(HashSpec::Sha512),
            _ => Err(Error::UnsupportedCipher(format!("hash {}", s))),
        }
    }
}

impl fmt::Display for HashSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key-derivation interface used for both key-slot keys and the master-key digest
pub trait KeyDerivation: Send + Sync {
    /// Fill `out` with key material derived from `secret`
    fn derive(&self, hash: HashSpec, secret: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) -> Result<()>;
}

/// PBKDF2-HMAC, the only KDF a LUKS1 header can declare
#[derive(Debug, Default, Clone, Copy)]
pub struct Pbkdf2;

impl KeyDerivation for Pbkdf2 {
    fn derive(&self, hash: HashSpec, secret: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) -> Result<()> {
        if iterations == 0 {
            return Err(Error::CryptoError("PBKDF2 iteration count must be positive".to_string()));
        }
        match hash {
            HashSpec::Sha1 => pbkdf2_hmac::<Sha1>(secret, salt, iterations, out),
            HashSpec::Sha256 => pbkdf2_hmac::<Sha256>(secret, salt, iterations, out),
            HashSpec::Sha512 => pbkdf2_hmac::<Sha512>(secret, salt, iterations, out),
        }
        Ok(())
    }
}

/// The volume (master) key; wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VolumeKey {
    key: Vec<u8>,
}

impl VolumeKey {
    pub fn from_bytes(key: Vec<u8>) -> VolumeKey {
        VolumeKey { key }
    }

    /// Fresh random key from the operating system RNG
    pub fn generate(len: usize) -> Result<VolumeKey> {
        let mut key = vec![0u8; len];
        fill_random(&mut key)?;
        Ok(VolumeKey { key })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

impl fmt::Debug for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeKey({} bytes)", self.key.len())
    }
}

pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| Error::CryptoError(format!("random number generator failed: {}", e)))
}

/// AES with whichever key size the header declares
pub enum Aes {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl Aes {
    fn new(key: &[u8]) -> Result<Aes> {
        let invalid = |_| Error::CryptoError(format!("invalid AES key length {}", key.len()));
        let aes = match key.len() {
            16 => Aes::Aes128(Aes128::new_from_slice(key).map_err(invalid)?),
            24 => Aes::Aes192(Aes192::new_from_slice(key).map_err(invalid)?),
            _ => Aes::Aes256(Aes256::new_from_slice(key).map_err(invalid)?),
        };
        Ok(aes)
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Aes::Aes128(c) => c.encrypt_block(block),
            Aes::Aes192(c) => c.encrypt_block(block),
            Aes::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Aes::Aes128(c) => c.decrypt_block(block),
            Aes::Aes192(c) => c.decrypt_block(block),
            Aes::Aes256(c) => c.decrypt_block(block),
        }
    }

    fn cbc_encrypt(&self, iv: &[u8; AES_BLOCK_SIZE], sector: &mut [u8]) {
        match self {
            Aes::Aes128(c) => cbc_encrypt(c, iv, sector),
            Aes::Aes192(c) => cbc_encrypt(c, iv, sector),
            Aes::Aes256(c) => cbc_encrypt(c, iv, sector),
        }
    }

    fn cbc_decrypt(&self, iv: &[u8; AES_BLOCK_SIZE], sector: &mut [u8]) {
        match self {
            Aes::Aes128(c) => cbc_decrypt(c, iv, sector),
            Aes::Aes192(c) => cbc_decrypt(c, iv, sector),
            Aes::Aes256(c) => cbc_decrypt(c, iv, sector),
        }
    }
}

fn cbc_encrypt<C>(cipher: &C, iv: &[u8; AES_BLOCK_SIZE], sector: &mut [u8])
where
    C: BlockCipher + BlockSizeUser<BlockSize = U16> + BlockEncryptMut + Clone,
{
    let mut cbc = cbc::Encryptor::<C>::inner_iv_init(cipher.clone(), GenericArray::from_slice(iv));
    for block in sector.chunks_exact_mut(AES_BLOCK_SIZE) {
        cbc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn cbc_decrypt<C>(cipher: &C, iv: &[u8; AES_BLOCK_SIZE], sector: &mut [u8])
where
    C: BlockCipher + BlockSizeUser<BlockSize = U16> + BlockDecryptMut + Clone,
{
    let mut cbc = cbc::Decryptor::<C>::inner_iv_init(cipher.clone(), GenericArray::from_slice(iv));
    for block in sector.chunks_exact_mut(AES_BLOCK_SIZE) {
        cbc.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// IV generator of a `cbc-*` mode, fed with the sector number
pub enum SectorIv {
    /// Low 32 bits of the sector number, little-endian
    Plain,
    /// The 64-bit sector number, little-endian
    Plain64,
    /// The `Plain64` value encrypted under AES keyed with the hash of the cipher key
    Essiv(Aes),
}

impl SectorIv {
    fn iv(&self, sector: u64) -> [u8; AES_BLOCK_SIZE] {
        let mut iv = [0u8; AES_BLOCK_SIZE];
        match self {
            SectorIv::Plain => LittleEndian::write_u32(&mut iv[..4], sector as u32),
            SectorIv::Plain64 => LittleEndian::write_u64(&mut iv[..8], sector),
            SectorIv::Essiv(salt) => {
                LittleEndian::write_u64(&mut iv[..8], sector);
                salt.encrypt_block(&mut iv);
            }
        }
        iv
    }
}

enum IvSpec {
    Plain,
    Plain64,
    Essiv(HashSpec),
}

enum Mode {
    Ecb,
    Cbc(IvSpec),
    Xts,
}

fn parse_mode(cipher_mode: &str) -> Option<Mode> {
    match cipher_mode {
        "ecb" => Some(Mode::Ecb),
        "cbc-plain" => Some(Mode::Cbc(IvSpec::Plain)),
        "cbc-plain64" => Some(Mode::Cbc(IvSpec::Plain64)),
        "xts-plain" | "xts-plain64" => Some(Mode::Xts),
        mode => {
            let hash = mode.strip_prefix("cbc-essiv:")?.parse().ok()?;
            Some(Mode::Cbc(IvSpec::Essiv(hash)))
        }
    }
}

fn is_aes_key(len: usize) -> bool {
    matches!(len, 16 | 24 | 32)
}

/// Cipher applied to the key-material area, sector IVs counted from the start of the area
pub enum SectorCipher {
    Ecb(Aes),
    Cbc(Aes, SectorIv),
    Xts128(Xts128<Aes128>),
    Xts256(Xts128<Aes256>),
}

impl SectorCipher {
    /// Fails with `UnsupportedCipher` unless `cipher_name`/`cipher_mode` with a `key_len` byte key can be used
    pub fn check(cipher_name: &str, cipher_mode: &str, key_len: usize) -> Result<()> {
        let supported = cipher_name == "aes"
            && match parse_mode(cipher_mode) {
                Some(Mode::Ecb) | Some(Mode::Cbc(IvSpec::Plain)) | Some(Mode::Cbc(IvSpec::Plain64)) => {
                    is_aes_key(key_len)
                }
                // the ESSIV salt keys a second AES instance
                Some(Mode::Cbc(IvSpec::Essiv(hash))) => is_aes_key(key_len) && is_aes_key(hash.digest_size()),
                Some(Mode::Xts) => matches!(key_len, 32 | 64),
                None => false,
            };
        if supported {
            Ok(())
        } else {
            Err(Error::UnsupportedCipher(format!(
                "{}-{} with a {} bit key",
                cipher_name,
                cipher_mode,
                key_len * 8
            )))
        }
    }

    pub fn new(cipher_name: &str, cipher_mode: &str, key: &[u8]) -> Result<SectorCipher> {
        SectorCipher::check(cipher_name, cipher_mode, key.len())?;
        let invalid = |_| Error::CryptoError("invalid AES key length".to_string());

        let cipher = match parse_mode(cipher_mode) {
            Some(Mode::Xts) => {
                let (data_key, tweak_key) = key.split_at(key.len() / 2);
                if key.len() == 32 {
                    SectorCipher::Xts128(Xts128::new(
                        Aes128::new_from_slice(data_key).map_err(invalid)?,
                        Aes128::new_from_slice(tweak_key).map_err(invalid)?,
                    ))
                } else {
                    SectorCipher::Xts256(Xts128::new(
                        Aes256::new_from_slice(data_key).map_err(invalid)?,
                        Aes256::new_from_slice(tweak_key).map_err(invalid)?,
                    ))
                }
            }
            Some(Mode::Cbc(spec)) => {
                let iv = match spec {
                    IvSpec::Plain => SectorIv::Plain,
                    IvSpec::Plain64 => SectorIv::Plain64,
                    IvSpec::Essiv(hash) => SectorIv::Essiv(Aes::new(&hash.hash(&[key]))?),
                };
                SectorCipher::Cbc(Aes::new(key)?, iv)
            }
            _ => SectorCipher::Ecb(Aes::new(key)?),
        };
        Ok(cipher)
    }

    /// Encrypt `area` in place; its length must be a whole number of sectors
    pub fn encrypt(&self, area: &mut [u8]) -> Result<()> {
        check_area(area)?;
        match self {
            SectorCipher::Ecb(aes) => area.chunks_exact_mut(AES_BLOCK_SIZE).for_each(|b| aes.encrypt_block(b)),
            SectorCipher::Cbc(aes, iv) => {
                for (sector, data) in area.chunks_exact_mut(LUKS_SECTOR_SIZE).enumerate() {
                    aes.cbc_encrypt(&iv.iv(sector as u64), data);
                }
            }
            SectorCipher::Xts128(xts) => xts.encrypt_area(area, LUKS_SECTOR_SIZE, 0, get_tweak_default),
            SectorCipher::Xts256(xts) => xts.encrypt_area(area, LUKS_SECTOR_SIZE, 0, get_tweak_default),
        }
        Ok(())
    }

    /// Decrypt `area` in place; its length must be a whole number of sectors
    pub fn decrypt(&self, area: &mut [u8]) -> Result<()> {
        check_area(area)?;
        match self {
            SectorCipher::Ecb(aes) => area.chunks_exact_mut(AES_BLOCK_SIZE).for_each(|b| aes.decrypt_block(b)),
            SectorCipher::Cbc(aes, iv) => {
                for (sector, data) in area.chunks_exact_mut(LUKS_SECTOR_SIZE).enumerate() {
                    aes.cbc_decrypt(&iv.iv(sector as u64), data);
                }
            }
            SectorCipher::Xts128(xts) => xts.decrypt_area(area, LUKS_SECTOR_SIZE, 0, get_tweak_default),
            SectorCipher::Xts256(xts) => xts.decrypt_area(area, LUKS_SECTOR_SIZE, 0, get_tweak_default),
        }
        Ok(())
    }
}

fn check_area(area: &[u8]) -> Result<()> {
    if area.len() % LUKS_SECTOR_SIZE != 0 {
        return Err(Error::CryptoError(format!(
            "key material area of {} bytes is not sector aligned",
            area.len()
        )));
    }
    Ok(())
}
