// On-disk layout follows the LUKS1 format and the LUKS2 binary header as written by cryptsetup
extern crate byteorder;
extern crate either;
extern crate uuid;

use either::Either::{Left, Right};
use std::convert;
use std::error;
use std::fmt::{Display, Error as FmtError, Formatter};
use std::io;
use std::io::{Read, Write};
use std::str;
use uuid::Uuid;

pub use raw::{
    LUKS1_HEADER_SIZE, LUKS2_PHDR_SIZE, LUKS_ALIGN_KEYSLOTS, LUKS_DIGESTSIZE, LUKS_KEY_DISABLED, LUKS_KEY_ENABLED,
    LUKS_NUMKEYS, LUKS_SALTSIZE, LUKS_SECTOR_SIZE, LUKS_STRIPES,
};

#[derive(Debug)]
pub enum Error {
    InvalidMagic,
    InvalidStringEncoding(str::Utf8Error),
    InvalidVersion(u16),
    InvalidUuid(uuid::Error),
    InvalidKeyslotState(usize, u32),
    /// An active slot's key material overlaps the header or the payload, or is implausibly large
    KeyMaterialOutOfBounds(usize),
    ReadError(io::Error),
    ReadIncorrectHeaderSize,
    FieldTooLong(&'static str),
    EmptyString,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{:?}", &self)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self {
            &Error::InvalidStringEncoding(e) => Some(e),
            &Error::InvalidUuid(e) => Some(e),
            &Error::ReadError(e) => Some(e),
            _ => None,
        }
    }
}

/// A parsed LUKS header of either on-disk version
#[derive(Debug, Clone)]
pub enum LuksHeader {
    Luks1(LuksHeaderV1),
    Luks2(LuksHeaderV2),
}

impl LuksHeader {
    /// Read a header from the start of `reader`, consuming only as many bytes as the version needs
    pub fn read<R: Read>(mut reader: R) -> Result<LuksHeader, Error> {
        let mut start_buf = [0u8; 8];
        reader.read_exact(&mut start_buf)?;
        let (magic_ok, version) = raw::sniff_magic(&start_buf);
        if !magic_ok {
            return Err(Error::InvalidMagic);
        }

        let mut buf = match version {
            raw::V1 => vec![0u8; LUKS1_HEADER_SIZE],
            raw::V2 => vec![0u8; LUKS2_PHDR_SIZE],
            other => return Err(Error::InvalidVersion(other)),
        };
        buf[..8].copy_from_slice(&start_buf);
        reader.read_exact(&mut buf[8..])?;
        LuksHeader::from_bytes(&buf)
    }

    /// Parse a header from a raw byte buffer
    pub fn from_bytes(buf: &[u8]) -> Result<LuksHeader, Error> {
        let res = match raw::parse_luks_header(buf)? {
            Left(raw) => LuksHeader::Luks1(LuksHeaderV1 { raw }),
            Right(raw) => LuksHeader::Luks2(LuksHeaderV2 { raw }),
        };
        Ok(res)
    }
}

/// Whether a key slot holds key material
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyslotState {
    Active,
    Inactive,
}

/// One entry of the LUKS1 key-slot table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LuksKeyslot {
    state: KeyslotState,
    iterations: u32,
    salt: [u8; LUKS_SALTSIZE],
    key_material_offset: u32,
    stripes: u32,
}

impl LuksKeyslot {
    pub fn active(iterations: u32, salt: [u8; LUKS_SALTSIZE], key_material_offset: u32, stripes: u32) -> LuksKeyslot {
        LuksKeyslot {
            state: KeyslotState::Active,
            iterations,
            salt,
            key_material_offset,
            stripes,
        }
    }

    pub fn inactive(key_material_offset: u32, stripes: u32) -> LuksKeyslot {
        LuksKeyslot {
            state: KeyslotState::Inactive,
            iterations: 0,
            salt: [0u8; LUKS_SALTSIZE],
            key_material_offset,
            stripes,
        }
    }

    pub fn state(&self) -> KeyslotState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == KeyslotState::Active
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn salt(&self) -> &[u8; LUKS_SALTSIZE] {
        &self.salt
    }

    /// Start of the encrypted key material, in 512-byte sectors
    pub fn key_material_offset(&self) -> u32 {
        self.key_material_offset
    }

    pub fn stripes(&self) -> u32 {
        self.stripes
    }
}

/// Field values for a freshly formatted LUKS1 header
pub struct NewLuks1Header<'a> {
    pub cipher_name: &'a str,
    pub cipher_mode: &'a str,
    pub hash_spec: &'a str,
    pub payload_offset: u32,
    pub key_bytes: u32,
    pub mk_digest: [u8; LUKS_DIGESTSIZE],
    pub mk_digest_salt: [u8; LUKS_SALTSIZE],
    pub mk_digest_iterations: u32,
    pub uuid: Uuid,
    pub keyslots: [LuksKeyslot; LUKS_NUMKEYS],
}

#[derive(Debug, Clone)]
pub struct LuksHeaderV1 {
    raw: raw::luks_phdr,
}

#[derive(Debug, Clone)]
pub struct LuksHeaderV2 {
    raw: raw::luks2_phdr,
}

impl LuksHeaderV1 {
    pub fn new(fields: NewLuks1Header<'_>) -> Result<LuksHeaderV1, Error> {
        let raw = raw::luks_phdr::from_fields(fields)?;
        Ok(LuksHeaderV1 { raw })
    }

    /// Serialize the header (including the key-slot table) in on-disk byte order
    pub fn write<W: Write>(&self, mut writer: W) -> Result<(), Error> {
        self.raw.write_to(&mut writer)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LUKS1_HEADER_SIZE);
        // writing into a Vec cannot fail
        let _ = self.raw.write_to(&mut buf);
        buf
    }
}

pub trait LuksVersionedHeader {
    fn version(&self) -> u16;
    fn uuid(&self) -> Result<uuid::Uuid, Error>;
}

impl LuksVersionedHeader for LuksHeader {
    fn version(&self) -> u16 {
        match &self {
            &LuksHeader::Luks1(h) => h.version(),
            &LuksHeader::Luks2(h) => h.version(),
        }
    }

    fn uuid(&self) -> Result<Uuid, Error> {
        match &self {
            &LuksHeader::Luks1(h) => h.uuid(),
            &LuksHeader::Luks2(h) => h.uuid(),
        }
    }
}

pub trait Luks1Header: LuksVersionedHeader {
    fn cipher_name(&self) -> Result<&str, Error>;
    fn cipher_mode(&self) -> Result<&str, Error>;
    fn hash_spec(&self) -> Result<&str, Error>;
    fn payload_offset(&self) -> u32;
    fn key_bytes(&self) -> u32;
    fn mk_digest(&self) -> &[u8];
    fn mk_digest_salt(&self) -> &[u8];
    fn mk_digest_iterations(&self) -> u32;
    fn keyslots(&self) -> &[LuksKeyslot; LUKS_NUMKEYS];
}

impl LuksVersionedHeader for LuksHeaderV1 {
    fn version(&self) -> u16 {
        self.raw.version
    }

    fn uuid(&self) -> Result<Uuid, Error> {
        raw::uuid_buf_to_uuid(&self.raw.uuid)
    }
}

impl LuksVersionedHeader for LuksHeaderV2 {
    fn version(&self) -> u16 {
        self.raw.version
    }

    fn uuid(&self) -> Result<Uuid, Error> {
        raw::uuid_buf_to_uuid(&self.raw.uuid)
    }
}

impl Luks1Header for LuksHeaderV1 {
    fn cipher_name(&self) -> Result<&str, Error> {
        raw::u8_buf_to_str(&self.raw.cipherName)?.ok_or(Error::EmptyString)
    }

    fn cipher_mode(&self) -> Result<&str, Error> {
        raw::u8_buf_to_str(&self.raw.cipherMode)?.ok_or(Error::EmptyString)
    }

    fn hash_spec(&self) -> Result<&str, Error> {
        raw::u8_buf_to_str(&self.raw.hashSpec)?.ok_or(Error::EmptyString)
    }

    fn payload_offset(&self) -> u32 {
        self.raw.payloadOffset
    }

    fn key_bytes(&self) -> u32 {
        self.raw.keyBytes
    }

    fn mk_digest(&self) -> &[u8] {
        &self.raw.mkDigest
    }

    fn mk_digest_salt(&self) -> &[u8] {
        &self.raw.mkDigestSalt
    }

    fn mk_digest_iterations(&self) -> u32 {
        self.raw.mkDigestIterations
    }

    fn keyslots(&self) -> &[LuksKeyslot; LUKS_NUMKEYS] {
        &self.raw.keyblock
    }
}

pub trait Luks2Header: LuksVersionedHeader {
    fn label(&self) -> Result<Option<&str>, Error>;
    fn subsystem(&self) -> Result<Option<&str>, Error>;
    fn seqid(&self) -> u64;
    fn header_size(&self) -> u64;
    fn header_offset(&self) -> u64;
}

impl Luks2Header for LuksHeaderV2 {
    fn label(&self) -> Result<Option<&str>, Error> {
        let label_opt = raw::u8_buf_to_str(&self.raw.label)?;
        Ok(label_opt)
    }

    fn subsystem(&self) -> Result<Option<&str>, Error> {
        let subsystem_opt = raw::u8_buf_to_str(&self.raw.subsystem)?;
        Ok(subsystem_opt)
    }

    fn seqid(&self) -> u64 {
        self.raw.seqid
    }

    fn header_size(&self) -> u64 {
        self.raw.hdr_size
    }

    fn header_offset(&self) -> u64 {
        self.raw.hdr_offset
    }
}

impl convert::From<str::Utf8Error> for Error {
    fn from(error: str::Utf8Error) -> Error {
        Error::InvalidStringEncoding(error)
    }
}

impl convert::From<uuid::Error> for Error {
    fn from(error: uuid::Error) -> Error {
        Error::InvalidUuid(error)
    }
}

impl convert::From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        Error::ReadError(error)
    }
}

mod raw {
    #![allow(non_snake_case)]

    use std::io::{Cursor, Read, Write};
    use std::str;

    use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
    use either::Either;
    use either::Either::{Left, Right};

    use super::{Error, KeyslotState, LuksKeyslot, NewLuks1Header};

    pub const V1: u16 = 1;
    pub const V2: u16 = 2;

    const LUKS_MAGIC_L: usize = 6;
    const LUKS_CIPHERNAME_L: usize = 32;
    const LUKS_CIPHERMODE_L: usize = 32;
    const LUKS_HASHSPEC_L: usize = 32;
    pub const LUKS_DIGESTSIZE: usize = 20;
    pub const LUKS_SALTSIZE: usize = 32;
    pub const LUKS_NUMKEYS: usize = 8;
    pub const LUKS_STRIPES: u32 = 4000;
    pub const LUKS_SECTOR_SIZE: usize = 512;
    pub const LUKS_ALIGN_KEYSLOTS: usize = 4096;
    pub const LUKS_KEY_DISABLED: u32 = 0x0000_DEAD;
    pub const LUKS_KEY_ENABLED: u32 = 0x00AC_71F3;
    const UUID_STRING_L: usize = 40;
    const LUKS2_LABEL_L: usize = 48;
    const LUKS2_SALT_L: usize = 64;
    const LUKS2_CHECKSUM_ALG_L: usize = 32;
    const LUKS2_CHECKSUM_L: usize = 64;

    const LUKS_MAGIC: &[u8; LUKS_MAGIC_L] = b"LUKS\xba\xbe";

    const LUKS2_PHDR_PADDING_L: usize = 184;

    /// 208 bytes of fixed fields followed by 8 key slots of 48 bytes each
    pub const LUKS1_HEADER_SIZE: usize = 592;
    pub const LUKS2_PHDR_SIZE: usize = 512;

    #[derive(Debug, Clone)]
    pub struct luks_phdr {
        pub magic: [u8; LUKS_MAGIC_L],
        pub version: u16,
        pub cipherName: [u8; LUKS_CIPHERNAME_L],
        pub cipherMode: [u8; LUKS_CIPHERMODE_L],
        pub hashSpec: [u8; LUKS_HASHSPEC_L],
        pub payloadOffset: u32,
        pub keyBytes: u32,
        pub mkDigest: [u8; LUKS_DIGESTSIZE],
        pub mkDigestSalt: [u8; LUKS_SALTSIZE],
        pub mkDigestIterations: u32,
        pub uuid: [u8; UUID_STRING_L],
        pub keyblock: [LuksKeyslot; LUKS_NUMKEYS],
    }

    #[derive(Debug, Clone)]
    pub struct luks2_phdr {
        pub magic: [u8; LUKS_MAGIC_L],
        pub version: u16,
        pub hdr_size: u64,
        pub seqid: u64,
        pub label: [u8; LUKS2_LABEL_L],
        pub checksum_alg: [u8; LUKS2_CHECKSUM_ALG_L],
        pub salt: [u8; LUKS2_SALT_L],
        pub uuid: [u8; UUID_STRING_L],
        pub subsystem: [u8; LUKS2_LABEL_L],
        pub hdr_offset: u64,
        pub _padding: [u8; LUKS2_PHDR_PADDING_L],
        pub csum: [u8; LUKS2_CHECKSUM_L],
    }

    /// Check the magic and return the version field of the first 8 header bytes
    pub fn sniff_magic(start_buf: &[u8; 8]) -> (bool, u16) {
        let magic_ok = &start_buf[..LUKS_MAGIC_L] == &LUKS_MAGIC[..];
        let version = u16::from_be_bytes([start_buf[6], start_buf[7]]);
        (magic_ok, version)
    }

    pub fn parse_luks_header(buf: &[u8]) -> Result<Either<luks_phdr, luks2_phdr>, Error> {
        if buf.len() < 8 {
            return Err(Error::ReadIncorrectHeaderSize);
        }
        let mut start_buf = [0u8; 8];
        start_buf.copy_from_slice(&buf[..8]);

        match sniff_magic(&start_buf) {
            (false, _) => Err(Error::InvalidMagic),
            (true, V1) => luks_phdr::from_buf(buf).map(|h| Left(h)),
            (true, V2) => luks2_phdr::from_buf(buf).map(|h| Right(h)),
            (true, other) => Err(Error::InvalidVersion(other)),
        }
    }

    fn read_array<const N: usize>(cursor: &mut Cursor<&[u8]>) -> Result<[u8; N], Error> {
        let mut buf = [0u8; N];
        cursor
            .read_exact(&mut buf)
            .map_err(|_| Error::ReadIncorrectHeaderSize)?;
        Ok(buf)
    }

    fn str_to_buf<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N], Error> {
        // one byte is always left for the NUL terminator
        if value.len() >= N {
            return Err(Error::FieldTooLong(field));
        }
        let mut buf = [0u8; N];
        buf[..value.len()].copy_from_slice(value.as_bytes());
        Ok(buf)
    }

    fn read_keyslot(cursor: &mut Cursor<&[u8]>, index: usize) -> Result<LuksKeyslot, Error> {
        let active = cursor.read_u32::<BigEndian>()?;
        let iterations = cursor.read_u32::<BigEndian>()?;
        let salt = read_array::<LUKS_SALTSIZE>(cursor)?;
        let key_material_offset = cursor.read_u32::<BigEndian>()?;
        let stripes = cursor.read_u32::<BigEndian>()?;

        let state = match active {
            LUKS_KEY_ENABLED => KeyslotState::Active,
            LUKS_KEY_DISABLED => KeyslotState::Inactive,
            other => return Err(Error::InvalidKeyslotState(index, other)),
        };
        if state == KeyslotState::Active && (stripes == 0 || iterations == 0) {
            return Err(Error::InvalidKeyslotState(index, active));
        }

        Ok(LuksKeyslot {
            state,
            iterations,
            salt,
            key_material_offset,
            stripes,
        })
    }

    impl luks_phdr {
        pub fn from_buf(buf: &[u8]) -> Result<luks_phdr, Error> {
            if buf.len() < LUKS1_HEADER_SIZE {
                return Err(Error::ReadIncorrectHeaderSize);
            }
            let mut cursor = Cursor::new(buf);

            let magic_buf = read_array::<LUKS_MAGIC_L>(&mut cursor)?;
            if magic_buf != *LUKS_MAGIC {
                return Err(Error::InvalidMagic);
            }

            let version = cursor.read_u16::<BigEndian>()?;
            if version != V1 {
                return Err(Error::InvalidVersion(version));
            }

            let cipher_name_buf = read_array::<LUKS_CIPHERNAME_L>(&mut cursor)?;
            let cipher_mode_buf = read_array::<LUKS_CIPHERMODE_L>(&mut cursor)?;
            let hash_spec_buf = read_array::<LUKS_HASHSPEC_L>(&mut cursor)?;
            let payload_offset = cursor.read_u32::<BigEndian>()?;
            let key_bytes = cursor.read_u32::<BigEndian>()?;
            let mk_digest_buf = read_array::<LUKS_DIGESTSIZE>(&mut cursor)?;
            let mk_digest_salt_buf = read_array::<LUKS_SALTSIZE>(&mut cursor)?;
            let mk_digest_iterations = cursor.read_u32::<BigEndian>()?;
            let uuid_buf = read_array::<UUID_STRING_L>(&mut cursor)?;

            let mut keyblock = Vec::with_capacity(LUKS_NUMKEYS);
            for index in 0..LUKS_NUMKEYS {
                keyblock.push(read_keyslot(&mut cursor, index)?);
            }
            let keyblock: [LuksKeyslot; LUKS_NUMKEYS] = keyblock
                .try_into()
                .map_err(|_| Error::ReadIncorrectHeaderSize)?;

            let res = luks_phdr {
                magic: magic_buf,
                version,
                cipherName: cipher_name_buf,
                cipherMode: cipher_mode_buf,
                hashSpec: hash_spec_buf,
                payloadOffset: payload_offset,
                keyBytes: key_bytes,
                mkDigest: mk_digest_buf,
                mkDigestSalt: mk_digest_salt_buf,
                mkDigestIterations: mk_digest_iterations,
                uuid: uuid_buf,
                keyblock,
            };

            Ok(res)
        }

        pub fn from_fields(fields: NewLuks1Header<'_>) -> Result<luks_phdr, Error> {
            let uuid_str = fields.uuid.hyphenated().to_string();
            Ok(luks_phdr {
                magic: *LUKS_MAGIC,
                version: V1,
                cipherName: str_to_buf("cipher_name", fields.cipher_name)?,
                cipherMode: str_to_buf("cipher_mode", fields.cipher_mode)?,
                hashSpec: str_to_buf("hash_spec", fields.hash_spec)?,
                payloadOffset: fields.payload_offset,
                keyBytes: fields.key_bytes,
                mkDigest: fields.mk_digest,
                mkDigestSalt: fields.mk_digest_salt,
                mkDigestIterations: fields.mk_digest_iterations,
                uuid: str_to_buf("uuid", &uuid_str)?,
                keyblock: fields.keyslots,
            })
        }

        pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
            writer.write_all(&self.magic)?;
            writer.write_u16::<BigEndian>(self.version)?;
            writer.write_all(&self.cipherName)?;
            writer.write_all(&self.cipherMode)?;
            writer.write_all(&self.hashSpec)?;
            writer.write_u32::<BigEndian>(self.payloadOffset)?;
            writer.write_u32::<BigEndian>(self.keyBytes)?;
            writer.write_all(&self.mkDigest)?;
            writer.write_all(&self.mkDigestSalt)?;
            writer.write_u32::<BigEndian>(self.mkDigestIterations)?;
            writer.write_all(&self.uuid)?;

            for slot in self.keyblock.iter() {
                let marker = match slot.state {
                    KeyslotState::Active => LUKS_KEY_ENABLED,
                    KeyslotState::Inactive => LUKS_KEY_DISABLED,
                };
                writer.write_u32::<BigEndian>(marker)?;
                writer.write_u32::<BigEndian>(slot.iterations)?;
                writer.write_all(&slot.salt)?;
                writer.write_u32::<BigEndian>(slot.key_material_offset)?;
                writer.write_u32::<BigEndian>(slot.stripes)?;
            }
            Ok(())
        }
    }

    impl luks2_phdr {
        pub fn from_buf(buf: &[u8]) -> Result<luks2_phdr, Error> {
            if buf.len() < LUKS2_PHDR_SIZE {
                return Err(Error::ReadIncorrectHeaderSize);
            }
            let mut cursor = Cursor::new(buf);

            let magic_buf = read_array::<LUKS_MAGIC_L>(&mut cursor)?;
            if magic_buf != *LUKS_MAGIC {
                return Err(Error::InvalidMagic);
            }

            let version = cursor.read_u16::<BigEndian>()?;
            if version != V2 {
                return Err(Error::InvalidVersion(version));
            }

            let hdr_size = cursor.read_u64::<BigEndian>()?;
            let seqid = cursor.read_u64::<BigEndian>()?;
            let label_buf = read_array::<LUKS2_LABEL_L>(&mut cursor)?;
            let checksum_alg_buf = read_array::<LUKS2_CHECKSUM_ALG_L>(&mut cursor)?;
            let salt_buf = read_array::<LUKS2_SALT_L>(&mut cursor)?;
            let uuid_buf = read_array::<UUID_STRING_L>(&mut cursor)?;
            let subsystem_buf = read_array::<LUKS2_LABEL_L>(&mut cursor)?;
            let hdr_offset = cursor.read_u64::<BigEndian>()?;
            let padding_buf = read_array::<LUKS2_PHDR_PADDING_L>(&mut cursor)?;
            let csum_buf = read_array::<LUKS2_CHECKSUM_L>(&mut cursor)?;

            let res = luks2_phdr {
                magic: magic_buf,
                version,
                hdr_size,
                seqid,
                label: label_buf,
                checksum_alg: checksum_alg_buf,
                salt: salt_buf,
                uuid: uuid_buf,
                subsystem: subsystem_buf,
                hdr_offset,
                _padding: padding_buf,
                csum: csum_buf,
            };

            Ok(res)
        }
    }

    pub fn u8_buf_to_str(buf: &[u8]) -> Result<Option<&str>, Error> {
        if let Some(pos) = buf.iter().position(|&c| c == 0) {
            if pos == 0 {
                Ok(None)
            } else {
                str::from_utf8(&buf[0..pos]).map_err(Error::from).map(|s| Some(s))
            }
        } else {
            str::from_utf8(buf).map_err(Error::from).map(|s| Some(s))
        }
    }

    pub fn uuid_buf_to_uuid(buf: &[u8; UUID_STRING_L]) -> Result<uuid::Uuid, Error> {
        let uuid_str = u8_buf_to_str(buf)?.ok_or(Error::EmptyString)?;
        uuid::Uuid::parse_str(uuid_str).map_err(Error::from)
    }

}
