//! Error type shared by the crate and the low-level device I/O helpers

use std::error;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::result;

use zeroize::Zeroizing;

use luks_header::LuksHeader;

use crate::backend::BackendError;

#[derive(Debug)]
pub enum Error {
    IOError(io::Error),
    /// The header was recognised as LUKS but is malformed or truncated
    FormatError(luks_header::Error),
    NotLuksFormat,
    InvalidLuksVersion(u16),
    UnsupportedCipher(String),
    InvalidArgument(String),
    NoMatchingSlot,
    NameInUse(String),
    NotActive(String),
    ActivationBackendError(BackendError),
    /// A confirmation handler failed; the operation did not proceed
    CallbackError(String),
    ConfirmationDenied,
    DeviceTooSmall { required: u64, actual: u64 },
    CryptoError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IOError(e) => write!(f, "I/O error: {}", e),
            Error::FormatError(e) => write!(f, "malformed LUKS header: {}", e),
            Error::NotLuksFormat => write!(f, "device is not a LUKS device"),
            Error::InvalidLuksVersion(v) => write!(f, "unsupported LUKS version {}", v),
            Error::UnsupportedCipher(spec) => write!(f, "unsupported cipher specification {}", spec),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::NoMatchingSlot => write!(f, "no key available with this passphrase"),
            Error::NameInUse(name) => write!(f, "device {} already exists", name),
            Error::NotActive(name) => write!(f, "device {} is not active", name),
            Error::ActivationBackendError(e) => write!(f, "activation backend failed: {}", e),
            Error::CallbackError(msg) => write!(f, "confirmation handler failed: {}", msg),
            Error::ConfirmationDenied => write!(f, "operation was not confirmed"),
            Error::DeviceTooSmall { required, actual } => {
                write!(f, "device is too small: {} bytes required, {} available", required, actual)
            }
            Error::CryptoError(msg) => write!(f, "crypto provider error: {}", msg),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IOError(e) => Some(e),
            Error::FormatError(e) => Some(e),
            Error::ActivationBackendError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IOError(e)
    }
}

impl From<luks_header::Error> for Error {
    fn from(e: luks_header::Error) -> Self {
        match e {
            luks_header::Error::InvalidMagic => Error::NotLuksFormat,
            luks_header::Error::ReadError(io_err) if io_err.kind() != io::ErrorKind::UnexpectedEof => {
                Error::IOError(io_err)
            }
            other => Error::FormatError(other),
        }
    }
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        Error::ActivationBackendError(e)
    }
}

pub type Result<T> = result::Result<T, Error>;
pub type Keyslot = u8;

/// Read whichever LUKS header version is present at the start of `path`
pub fn read_header<P: AsRef<Path>>(path: P) -> Result<LuksHeader> {
    let device_file = File::open(path.as_ref())?;
    let header = LuksHeader::read(device_file)?;
    Ok(header)
}

pub fn open_read<P: AsRef<Path>>(path: P) -> Result<File> {
    Ok(File::open(path.as_ref())?)
}

pub fn open_write<P: AsRef<Path>>(path: P) -> Result<File> {
    let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
    Ok(file)
}

/// Key files larger than this are refused, like cryptsetup's default key file size limit
pub const MAX_KEY_FILE_SIZE: u64 = 8 * 1024 * 1024;

/// Read a passphrase from `path`, or from standard input when `path` is `-`. The content is used
/// as is, trailing newline included.
pub fn read_key_file<P: AsRef<Path>>(path: P) -> Result<Zeroizing<Vec<u8>>> {
    let path = path.as_ref();
    if path == Path::new("-") {
        read_key(io::stdin().lock())
    } else {
        read_key(File::open(path)?)
    }
}

pub fn read_key<R: Read>(reader: R) -> Result<Zeroizing<Vec<u8>>> {
    let mut key = Zeroizing::new(Vec::with_capacity(4096));
    reader.take(MAX_KEY_FILE_SIZE + 1).read_to_end(&mut key)?;
    if key.is_empty() {
        return Err(Error::InvalidArgument("key file is empty".to_string()));
    }
    if key.len() as u64 > MAX_KEY_FILE_SIZE {
        return Err(Error::InvalidArgument(format!(
            "key file is larger than {} bytes",
            MAX_KEY_FILE_SIZE
        )));
    }
    Ok(key)
}

/// Size in bytes; seeking to the end works for both image files and block devices
pub fn device_size(file: &mut File) -> Result<u64> {
    let size = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(size)
}
