//! Volume registry: the authoritative record of which mapped names are open
//!
//! Opening and closing are two-phase. `reserve` and `begin_close` claim a name inside one critical
//! section and hand back a guard; the slow work (key derivation, backend calls) happens with the
//! lock released, and the guard either commits or rolls back when it goes out of scope.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::device::{Error, Keyslot, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeStatus {
    Active,
    Inactive,
    /// Registry and backend disagree about the mapping
    Invalid,
}

/// An open volume and the details reported by `luks_status_info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveVolume {
    pub name: String,
    pub device: PathBuf,
    pub status: VolumeStatus,
    pub keyslot: Keyslot,
    pub cipher: String,
    pub key_bits: u32,
    pub payload_offset: u32,
    /// Length of the mapped payload in 512-byte sectors
    pub size: u64,
    pub read_only: bool,
}

#[derive(Debug)]
enum Entry {
    Opening,
    Open(ActiveVolume),
    Closing(ActiveVolume),
}

#[derive(Debug, Default)]
pub struct VolumeRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl VolumeRegistry {
    pub fn new() -> VolumeRegistry {
        VolumeRegistry::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // entries are only ever replaced whole, so a panicking holder cannot leave one half-written
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `name` for an open in progress; fails if any entry exists for it
    pub fn reserve(&self, name: &str) -> Result<Reservation<'_>> {
        let mut entries = self.lock();
        if entries.contains_key(name) {
            return Err(Error::NameInUse(name.to_string()));
        }
        entries.insert(name.to_string(), Entry::Opening);
        Ok(Reservation {
            registry: self,
            name: name.to_string(),
            committed: false,
        })
    }

    /// Claim an open volume for closing; fails unless `name` is open and not already closing
    pub fn begin_close(&self, name: &str) -> Result<Closing<'_>> {
        let mut entries = self.lock();
        match entries.remove(name) {
            Some(Entry::Open(volume)) => {
                entries.insert(name.to_string(), Entry::Closing(volume.clone()));
                Ok(Closing {
                    registry: self,
                    volume,
                    finished: false,
                })
            }
            Some(other) => {
                entries.insert(name.to_string(), other);
                Err(Error::NotActive(name.to_string()))
            }
            None => Err(Error::NotActive(name.to_string())),
        }
    }

    pub fn status(&self, name: &str) -> VolumeStatus {
        match self.lock().get(name) {
            Some(Entry::Open(volume)) | Some(Entry::Closing(volume)) => volume.status,
            Some(Entry::Opening) | None => VolumeStatus::Inactive,
        }
    }

    pub fn get(&self, name: &str) -> Option<ActiveVolume> {
        match self.lock().get(name) {
            Some(Entry::Open(volume)) | Some(Entry::Closing(volume)) => Some(volume.clone()),
            _ => None,
        }
    }

    /// Returns false if `name` is not open
    pub fn mark_invalid(&self, name: &str) -> bool {
        match self.lock().get_mut(name) {
            Some(Entry::Open(volume)) => {
                volume.status = VolumeStatus::Invalid;
                true
            }
            _ => false,
        }
    }

    /// Names with an open (or closing) volume, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, entry)| !matches!(entry, Entry::Opening))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A name claimed by `reserve`; dropped without `commit` the claim is released
#[must_use]
pub struct Reservation<'a> {
    registry: &'a VolumeRegistry,
    name: String,
    committed: bool,
}

impl Reservation<'_> {
    pub fn commit(mut self, volume: ActiveVolume) {
        self.registry.lock().insert(self.name.clone(), Entry::Open(volume));
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            debug!("releasing reservation for {}", self.name);
            self.registry.lock().remove(&self.name);
        }
    }
}

/// A volume claimed by `begin_close`; dropped without `finish` the volume stays open
#[must_use]
pub struct Closing<'a> {
    registry: &'a VolumeRegistry,
    volume: ActiveVolume,
    finished: bool,
}

impl Closing<'_> {
    pub fn volume(&self) -> &ActiveVolume {
        &self.volume
    }

    pub fn finish(mut self) {
        self.registry.lock().remove(&self.volume.name);
        self.finished = true;
    }
}

impl Drop for Closing<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("keeping {} open", self.volume.name);
            self.registry
                .lock()
                .insert(self.volume.name.clone(), Entry::Open(self.volume.clone()));
        }
    }
}
