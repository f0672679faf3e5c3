//! Volume-activation backend: the layer that exposes an unlocked volume to the system
//!
//! The controller only talks to the `ActivationBackend` trait. `MemoryBackend` keeps its mapping
//! table in-process; `DmsetupBackend` (see `dmsetup`) drives the kernel device-mapper.

use std::collections::HashMap;
use std::error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use errno::Errno;

use crate::crypto::VolumeKey;

/// State of a mapping as seen by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Active,
    Inactive,
    /// The name exists but does not look like a crypt mapping
    Invalid,
    /// The backend could not tell
    Unknown,
}

/// Everything needed to activate a LUKS1 volume
#[derive(Debug)]
pub struct ActivationRequest<'a> {
    pub name: &'a str,
    pub device: &'a Path,
    /// dm-crypt cipher spec, e.g. `aes-xts-plain64`
    pub cipher: &'a str,
    pub key: &'a VolumeKey,
    /// Start of the encrypted payload in 512-byte sectors
    pub payload_offset: u64,
    /// Length of the payload in 512-byte sectors
    pub size: u64,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct BackendError {
    errno: Errno,
    message: String,
}

impl BackendError {
    pub fn new<S: Into<String>>(errno: i32, message: S) -> BackendError {
        BackendError {
            errno: Errno(errno),
            message: message.into(),
        }
    }

    pub fn errno(&self) -> Errno {
        self.errno
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The mapping does not exist on the backend side
    pub fn is_not_found(&self) -> bool {
        matches!(self.errno.0, libc::ENXIO | libc::ENODEV | libc::ENOENT)
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {}: {})", self.message, self.errno.0, self.errno)
    }
}

impl error::Error for BackendError {}

pub trait ActivationBackend: Send + Sync {
    fn activate(&self, request: &ActivationRequest<'_>) -> Result<(), BackendError>;
    fn deactivate(&self, name: &str) -> Result<(), BackendError>;
    fn query_state(&self, name: &str) -> BackendState;
}

impl<B: ActivationBackend + ?Sized> ActivationBackend for Arc<B> {
    fn activate(&self, request: &ActivationRequest<'_>) -> Result<(), BackendError> {
        (**self).activate(request)
    }

    fn deactivate(&self, name: &str) -> Result<(), BackendError> {
        (**self).deactivate(name)
    }

    fn query_state(&self, name: &str) -> BackendState {
        (**self).query_state(name)
    }
}

/// A mapping held by `MemoryBackend`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub device: PathBuf,
    pub cipher: String,
    pub key_bits: usize,
    pub payload_offset: u64,
    pub size: u64,
    pub read_only: bool,
}

/// In-process backend; useful for tests and for callers that manage mappings themselves
#[derive(Debug, Default)]
pub struct MemoryBackend {
    mappings: Mutex<HashMap<String, (Mapping, BackendState)>>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }

    pub fn mapping(&self, name: &str) -> Option<Mapping> {
        let mappings = self.mappings.lock().unwrap_or_else(PoisonError::into_inner);
        mappings.get(name).map(|(m, _)| m.clone())
    }

    /// Override the reported state of an existing mapping, e.g. to emulate a mapping torn down
    /// behind the controller's back
    pub fn set_state(&self, name: &str, state: BackendState) {
        let mut mappings = self.mappings.lock().unwrap_or_else(PoisonError::into_inner);
        match state {
            BackendState::Inactive => {
                mappings.remove(name);
            }
            _ => {
                if let Some(entry) = mappings.get_mut(name) {
                    entry.1 = state;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.mappings.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ActivationBackend for MemoryBackend {
    fn activate(&self, request: &ActivationRequest<'_>) -> Result<(), BackendError> {
        let mut mappings = self.mappings.lock().unwrap_or_else(PoisonError::into_inner);
        if mappings.contains_key(request.name) {
            return Err(BackendError::new(
                libc::EEXIST,
                format!("mapping {} already exists", request.name),
            ));
        }
        let mapping = Mapping {
            device: request.device.to_path_buf(),
            cipher: request.cipher.to_string(),
            key_bits: request.key.len() * 8,
            payload_offset: request.payload_offset,
            size: request.size,
            read_only: request.read_only,
        };
        trace!("memory backend: created mapping {}", request.name);
        mappings.insert(request.name.to_string(), (mapping, BackendState::Active));
        Ok(())
    }

    fn deactivate(&self, name: &str) -> Result<(), BackendError> {
        let mut mappings = self.mappings.lock().unwrap_or_else(PoisonError::into_inner);
        match mappings.remove(name) {
            Some(_) => Ok(()),
            None => Err(BackendError::new(libc::ENXIO, format!("mapping {} does not exist", name))),
        }
    }

    fn query_state(&self, name: &str) -> BackendState {
        let mappings = self.mappings.lock().unwrap_or_else(PoisonError::into_inner);
        mappings
            .get(name)
            .map(|(_, state)| *state)
            .unwrap_or(BackendState::Inactive)
    }
}
