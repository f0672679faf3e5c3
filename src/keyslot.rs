//! Key-slot manager: recovers the volume key from a passphrase, and seals a volume key into a
//! slot when formatting

use std::io::{Read, Seek, SeekFrom, Write};

use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use luks_header::{
    LuksKeyslot, LUKS1_HEADER_SIZE, LUKS_ALIGN_KEYSLOTS, LUKS_DIGESTSIZE, LUKS_NUMKEYS, LUKS_SALTSIZE, LUKS_SECTOR_SIZE,
};

use crate::af;
use crate::crypto::{fill_random, HashSpec, KeyDerivation, SectorCipher, VolumeKey};
use crate::device::{Error, Keyslot, Result};
use crate::luks1::Luks1Params;

const ALIGN_SECTORS: u32 = (LUKS_ALIGN_KEYSLOTS / LUKS_SECTOR_SIZE) as u32;

const HEADER_SECTORS: u32 = LUKS1_HEADER_SIZE.div_ceil(LUKS_SECTOR_SIZE) as u32;

fn round_up(value: u32, align: u32) -> Option<u32> {
    if align <= 1 {
        Some(value)
    } else {
        value.checked_next_multiple_of(align)
    }
}

/// Sectors occupied by the key material of one slot; `None` when the geometry is empty or exceeds
/// `af::MAX_MATERIAL`
pub fn key_material_sectors(key_bytes: usize, stripes: u32) -> Option<u32> {
    af::material_len(key_bytes, stripes)
        .ok()
        .map(|bytes| bytes.div_ceil(LUKS_SECTOR_SIZE) as u32)
}

/// Whether an active slot's key material lies after the header and, unless the payload offset
/// is zero, ends before the payload
pub fn area_fits(slot: &LuksKeyslot, key_bytes: usize, payload_offset: u32) -> bool {
    let end = key_material_sectors(key_bytes, slot.stripes())
        .and_then(|sectors| slot.key_material_offset().checked_add(sectors));
    match end {
        Some(end) => slot.key_material_offset() >= HEADER_SECTORS && (payload_offset == 0 || end <= payload_offset),
        None => false,
    }
}

/// Key-material offsets of all eight slots and the resulting payload offset, in sectors.
///
/// Slot areas start right after the (4096-byte aligned) header and each one is aligned to 4096
/// bytes; the payload starts at the next multiple of `align_payload` sectors.
pub fn layout(key_bytes: usize, stripes: u32, align_payload: u32) -> Result<([u32; LUKS_NUMKEYS], u32)> {
    let too_large = || {
        Error::InvalidArgument(format!(
            "{} stripes of a {} byte key do not fit in a LUKS1 layout",
            stripes, key_bytes
        ))
    };
    let slot_sectors = key_material_sectors(key_bytes, stripes).ok_or_else(too_large)?;
    let mut offsets = [0u32; LUKS_NUMKEYS];
    let mut next = round_up(HEADER_SECTORS, ALIGN_SECTORS).ok_or_else(too_large)?;
    for offset in offsets.iter_mut() {
        *offset = next;
        next = next
            .checked_add(slot_sectors)
            .and_then(|end| round_up(end, ALIGN_SECTORS))
            .ok_or_else(too_large)?;
    }
    let end = offsets[LUKS_NUMKEYS - 1].checked_add(slot_sectors).ok_or_else(too_large)?;
    let payload_offset = round_up(end, align_payload).ok_or_else(too_large)?;
    Ok((offsets, payload_offset))
}

/// PBKDF2 digest of a volume key, as stored in the header
pub fn key_digest<K: KeyDerivation + ?Sized>(
    kdf: &K,
    hash: HashSpec,
    key: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<[u8; LUKS_DIGESTSIZE]> {
    let mut digest = [0u8; LUKS_DIGESTSIZE];
    kdf.derive(hash, key, salt, iterations, &mut digest)?;
    Ok(digest)
}

/// Try every active slot in ascending order and return the volume key with the index of the
/// first slot that opens with `passphrase`.
///
/// A slot that cannot be read or decrypted is treated exactly like a wrong passphrase.
pub fn unlock<K, D>(params: &Luks1Params, passphrase: &[u8], kdf: &K, device: &mut D) -> Result<(VolumeKey, Keyslot)>
where
    K: KeyDerivation + ?Sized,
    D: Read + Seek,
{
    for (index, slot) in params.keyslots().iter().enumerate() {
        if !slot.is_active() {
            continue;
        }
        match try_slot(params, slot, passphrase, kdf, device) {
            Ok(Some(key)) => {
                debug!("key slot {} unlocked", index);
                return Ok((key, index as Keyslot));
            }
            Ok(None) => debug!("key slot {} does not match", index),
            Err(e) => debug!("key slot {} does not match: {}", index, e),
        }
    }
    Err(Error::NoMatchingSlot)
}

fn try_slot<K, D>(
    params: &Luks1Params,
    slot: &LuksKeyslot,
    passphrase: &[u8],
    kdf: &K,
    device: &mut D,
) -> Result<Option<VolumeKey>>
where
    K: KeyDerivation + ?Sized,
    D: Read + Seek,
{
    let key_bytes = params.key_bytes();
    let hash = params.hash_spec();

    let mut slot_key = Zeroizing::new(vec![0u8; key_bytes]);
    kdf.derive(hash, passphrase, slot.salt(), slot.iterations(), &mut slot_key)?;

    let sectors = key_material_sectors(key_bytes, slot.stripes())
        .ok_or_else(|| Error::CryptoError(format!("{} anti-forensic stripes are out of bounds", slot.stripes())))?;
    let mut material = Zeroizing::new(vec![0u8; sectors as usize * LUKS_SECTOR_SIZE]);
    device.seek(SeekFrom::Start(slot.key_material_offset() as u64 * LUKS_SECTOR_SIZE as u64))?;
    device.read_exact(&mut material)?;

    let cipher = SectorCipher::new(params.cipher_name(), params.cipher_mode(), &slot_key)?;
    cipher.decrypt(&mut material)?;

    let candidate = af::merge(&material, key_bytes, slot.stripes(), hash)?;
    let digest = key_digest(kdf, hash, &candidate, params.mk_salt(), params.mk_iterations())?;
    if bool::from(digest[..].ct_eq(&params.mk_digest()[..])) {
        Ok(Some(VolumeKey::from_bytes(candidate.to_vec())))
    } else {
        Ok(None)
    }
}

/// Parameters for sealing a volume key into one slot
#[derive(Debug, Clone)]
pub struct SlotParams<'a> {
    pub cipher_name: &'a str,
    pub cipher_mode: &'a str,
    pub hash: HashSpec,
    pub iterations: u32,
    pub stripes: u32,
    /// In sectors
    pub key_material_offset: u32,
}

/// Derive a slot key from `passphrase`, split `key` and write the encrypted key material at the
/// slot's offset. Returns the slot record to store in the header.
pub fn seal<K, D>(
    slot: &SlotParams<'_>,
    passphrase: &[u8],
    key: &VolumeKey,
    kdf: &K,
    device: &mut D,
) -> Result<LuksKeyslot>
where
    K: KeyDerivation + ?Sized,
    D: Write + Seek,
{
    let mut salt = [0u8; LUKS_SALTSIZE];
    fill_random(&mut salt)?;

    let mut slot_key = Zeroizing::new(vec![0u8; key.len()]);
    kdf.derive(slot.hash, passphrase, &salt, slot.iterations, &mut slot_key)?;

    let split = af::split(key.as_bytes(), slot.stripes, slot.hash)?;
    let sectors = split.len().div_ceil(LUKS_SECTOR_SIZE);
    let mut material = Zeroizing::new(vec![0u8; sectors * LUKS_SECTOR_SIZE]);
    material[..split.len()].copy_from_slice(&split);

    let cipher = SectorCipher::new(slot.cipher_name, slot.cipher_mode, &slot_key)?;
    cipher.encrypt(&mut material)?;

    device.seek(SeekFrom::Start(slot.key_material_offset as u64 * LUKS_SECTOR_SIZE as u64))?;
    device.write_all(&material)?;
    Ok(LuksKeyslot::active(slot.iterations, salt, slot.key_material_offset, slot.stripes))
}
