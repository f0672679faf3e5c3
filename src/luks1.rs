use std::path::Path;

use uuid::Uuid;

use luks_header::{
    Luks1Header, LuksHeader, LuksKeyslot, LuksVersionedHeader, LUKS_DIGESTSIZE, LUKS_NUMKEYS, LUKS_SALTSIZE,
};

use crate::crypto::{HashSpec, SectorCipher};
use crate::device::{read_header, Error, Result};
use crate::keyslot;

/// Struct for storing LUKS1 parameters in memory
#[derive(Debug, Clone, PartialEq)]
pub struct Luks1Params {
    uuid: Uuid,
    cipher_name: String,
    cipher_mode: String,
    hash_spec: HashSpec,
    payload_offset: u32,
    key_bytes: u32,
    mk_digest: [u8; LUKS_DIGESTSIZE],
    mk_salt: [u8; LUKS_SALTSIZE],
    mk_iterations: u32,
    keyslots: [LuksKeyslot; LUKS_NUMKEYS],
}

impl Luks1Params {
    /// Validate a parsed header; unsupported cipher or hash specs and active slots whose key
    /// material does not fit between the header and the payload are rejected here, before any key
    /// slot is touched
    pub fn from(header: &impl Luks1Header) -> Result<Luks1Params> {
        let uuid = header.uuid()?;
        let cipher_name = header.cipher_name()?.to_owned();
        let cipher_mode = header.cipher_mode()?.to_owned();
        let hash_spec: HashSpec = header.hash_spec()?.parse()?;
        let key_bytes = header.key_bytes();
        SectorCipher::check(&cipher_name, &cipher_mode, key_bytes as usize)?;

        let keyslots = *header.keyslots();
        let payload_offset = header.payload_offset();
        if let Some(index) = keyslots
            .iter()
            .position(|slot| slot.is_active() && !keyslot::area_fits(slot, key_bytes as usize, payload_offset))
        {
            return Err(Error::FormatError(luks_header::Error::KeyMaterialOutOfBounds(index)));
        }

        let mut mk_digest = [0u8; LUKS_DIGESTSIZE];
        mk_digest.copy_from_slice(header.mk_digest());
        let mut mk_salt = [0u8; LUKS_SALTSIZE];
        mk_salt.copy_from_slice(header.mk_digest_salt());
        Ok(Luks1Params {
            uuid,
            cipher_name,
            cipher_mode,
            hash_spec,
            payload_offset,
            key_bytes,
            mk_digest,
            mk_salt,
            mk_iterations: header.mk_digest_iterations(),
            keyslots,
        })
    }

    pub fn from_header(header: &LuksHeader) -> Result<Luks1Params> {
        match header {
            LuksHeader::Luks1(v1) => Luks1Params::from(v1),
            LuksHeader::Luks2(v2) => Err(Error::InvalidLuksVersion(v2.version())),
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Luks1Params> {
        Luks1Params::from_header(&read_header(path)?)
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn cipher_name(&self) -> &str {
        &self.cipher_name
    }

    pub fn cipher_mode(&self) -> &str {
        &self.cipher_mode
    }

    /// Cipher in dm-crypt notation, e.g. `aes-xts-plain64`
    pub fn cipher_spec(&self) -> String {
        format!("{}-{}", self.cipher_name, self.cipher_mode)
    }

    pub fn hash_spec(&self) -> HashSpec {
        self.hash_spec
    }

    pub fn payload_offset(&self) -> u32 {
        self.payload_offset
    }

    pub fn key_bytes(&self) -> usize {
        self.key_bytes as usize
    }

    pub fn mk_bits(&self) -> u32 {
        self.key_bytes * 8
    }

    pub fn mk_digest(&self) -> &[u8; LUKS_DIGESTSIZE] {
        &self.mk_digest
    }

    pub fn mk_salt(&self) -> &[u8; LUKS_SALTSIZE] {
        &self.mk_salt
    }

    pub fn mk_iterations(&self) -> u32 {
        self.mk_iterations
    }

    pub fn keyslots(&self) -> &[LuksKeyslot; LUKS_NUMKEYS] {
        &self.keyslots
    }
}
