//! High-level API to work with LUKS devices (disks)
//!
//! `CryptSetup` ties together header parsing, key-slot unlocking, the registry of open volumes and
//! an activation backend. Every user-visible message goes through the caller's callbacks.
//!
//! # Examples
//!
//! ```no_run
//! use cryptsetup_core::*;
//!
//! # fn foo() -> Result<()> {
//! let setup = CryptSetup::new(LogForwarder, FixedAnswer(true), DmsetupBackend::new());
//! let slot = setup.luks_open("/dev/loop0", "sifra", "sifra")?;
//! assert_eq!(setup.luks_status("sifra"), VolumeStatus::Active);
//! setup.luks_close("sifra")?;
//! # let _ = slot;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use luks_header::{
    LuksHeaderV1, LuksKeyslot, LuksVersionedHeader, NewLuks1Header, LUKS_NUMKEYS, LUKS_SALTSIZE, LUKS_SECTOR_SIZE,
    LUKS_STRIPES,
};

use crate::backend::{ActivationBackend, ActivationRequest, BackendState};
use crate::callback::{CallbackGateway, Confirm, Logger, Priority};
use crate::crypto::{fill_random, HashSpec, KeyDerivation, Pbkdf2, SectorCipher, VolumeKey};
use crate::device::{device_size, open_read, open_write, read_header, read_key_file, Error, Keyslot, Result};
use crate::keyslot;
use crate::luks1::Luks1Params;
use crate::registry::{ActiveVolume, VolumeRegistry, VolumeStatus};

const MAX_NAME_LEN: usize = 128;
const MIN_DIGEST_ITERATIONS: u32 = 1000;

/// Controller for LUKS volumes; all operations take `&self` and may run concurrently
pub struct CryptSetup<B: ActivationBackend> {
    callbacks: CallbackGateway,
    registry: VolumeRegistry,
    backend: B,
    kdf: Box<dyn KeyDerivation>,
}

impl<B: ActivationBackend> fmt::Debug for CryptSetup<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptSetup")
            .field("active", &self.registry.names())
            .finish_non_exhaustive()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= MAX_NAME_LEN || name.contains('/') || name == "." || name == ".." {
        return Err(Error::InvalidArgument(format!("invalid mapped device name {:?}", name)));
    }
    Ok(())
}

impl<B: ActivationBackend> CryptSetup<B> {
    pub fn new<L, C>(logger: L, confirm: C, backend: B) -> CryptSetup<B>
    where
        L: Logger + 'static,
        C: Confirm + 'static,
    {
        CryptSetup {
            callbacks: CallbackGateway::new(logger, confirm),
            registry: VolumeRegistry::new(),
            backend,
            kdf: Box::new(Pbkdf2),
        }
    }

    /// Replace the key-derivation provider
    pub fn with_kdf<K: KeyDerivation + 'static>(mut self, kdf: K) -> CryptSetup<B> {
        self.kdf = Box::new(kdf);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Names of the volumes this controller has open
    pub fn active_names(&self) -> Vec<String> {
        self.registry.names()
    }

    fn fail<T>(&self, context: &str, e: Error) -> Result<T> {
        self.callbacks.log(Priority::Error, &format!("{}: {}", context, e));
        Err(e)
    }

    /// Log a message through the configured logger
    pub fn log(&self, priority: Priority, message: &str) {
        self.callbacks.log(priority, message)
    }

    /// Ask the configured confirmation handler
    pub fn ask_yes(&self, prompt: &str) -> Result<bool> {
        self.callbacks.try_confirm(prompt)
    }

    /// Whether `device` carries a LUKS header of any version; never fails
    pub fn is_luks<P: AsRef<Path>>(&self, device: P) -> bool {
        match read_header(device.as_ref()) {
            Ok(_) => true,
            Err(e) => {
                self.callbacks.log(
                    Priority::Debug,
                    &format!("{} is not a valid LUKS device: {}", device.as_ref().display(), e),
                );
                false
            }
        }
    }

    /// UUID of the LUKS container on `device`, in canonical lowercase form
    pub fn luks_uuid<P: AsRef<Path>>(&self, device: P) -> Result<String> {
        let context = format!("cannot read UUID of {}", device.as_ref().display());
        let uuid = read_header(device.as_ref()).and_then(|header| header.uuid().map_err(Error::from));
        match uuid {
            Ok(uuid) => Ok(uuid.hyphenated().to_string()),
            Err(e) => self.fail(&context, e),
        }
    }

    /// Unlock `device` with `passphrase` and activate it as `name`; returns the key slot used
    pub fn luks_open<P, K>(&self, device: P, name: &str, passphrase: K) -> Result<Keyslot>
    where
        P: AsRef<Path>,
        K: AsRef<[u8]>,
    {
        self.open(device.as_ref(), name, passphrase.as_ref(), false)
    }

    /// Like `luks_open`, with a read-only mapping
    pub fn luks_open_read_only<P, K>(&self, device: P, name: &str, passphrase: K) -> Result<Keyslot>
    where
        P: AsRef<Path>,
        K: AsRef<[u8]>,
    {
        self.open(device.as_ref(), name, passphrase.as_ref(), true)
    }

    /// Like `luks_open`, with the passphrase read verbatim from `keyfile`; `-` reads standard input
    pub fn luks_open_with_keyfile<P, F>(&self, device: P, name: &str, keyfile: F) -> Result<Keyslot>
    where
        P: AsRef<Path>,
        F: AsRef<Path>,
    {
        let passphrase = match read_key_file(keyfile.as_ref()) {
            Ok(passphrase) => passphrase,
            Err(e) => return self.fail(&format!("cannot read key file {}", keyfile.as_ref().display()), e),
        };
        self.open(device.as_ref(), name, &passphrase, false)
    }

    fn open(&self, device: &Path, name: &str, passphrase: &[u8], read_only: bool) -> Result<Keyslot> {
        let context = format!("cannot open {} as {}", device.display(), name);
        match self.try_open(device, name, passphrase, read_only) {
            Ok(slot) => {
                self.callbacks
                    .log(Priority::Info, &format!("Key slot {} unlocked, {} is active.", slot, name));
                Ok(slot)
            }
            Err(e) => self.fail(&context, e),
        }
    }

    fn try_open(&self, device: &Path, name: &str, passphrase: &[u8], read_only: bool) -> Result<Keyslot> {
        validate_name(name)?;
        let params = Luks1Params::from_path(device)?;

        let mut file = open_read(device)?;
        let size = device_size(&mut file)?;
        let payload_start = params.payload_offset() as u64 * LUKS_SECTOR_SIZE as u64;
        if size <= payload_start {
            return Err(Error::DeviceTooSmall {
                required: payload_start + LUKS_SECTOR_SIZE as u64,
                actual: size,
            });
        }

        let reservation = self.registry.reserve(name)?;
        match self.backend.query_state(name) {
            BackendState::Active | BackendState::Invalid => return Err(Error::NameInUse(name.to_string())),
            BackendState::Inactive | BackendState::Unknown => {}
        }

        let (key, slot) = keyslot::unlock(&params, passphrase, self.kdf.as_ref(), &mut file)?;

        let cipher = params.cipher_spec();
        let mapped_sectors = (size - payload_start) / LUKS_SECTOR_SIZE as u64;
        let request = ActivationRequest {
            name,
            device,
            cipher: &cipher,
            key: &key,
            payload_offset: params.payload_offset() as u64,
            size: mapped_sectors,
            read_only,
        };
        self.backend.activate(&request)?;

        reservation.commit(ActiveVolume {
            name: name.to_string(),
            device: device.to_path_buf(),
            status: VolumeStatus::Active,
            keyslot: slot,
            cipher,
            key_bits: params.mk_bits(),
            payload_offset: params.payload_offset(),
            size: mapped_sectors,
            read_only,
        });
        Ok(slot)
    }

    /// Deactivate the volume open as `name`
    pub fn luks_close(&self, name: &str) -> Result<()> {
        let context = format!("cannot close {}", name);
        let closing = match self.registry.begin_close(name) {
            Ok(closing) => closing,
            Err(e) => return self.fail(&context, e),
        };

        match self.backend.deactivate(name) {
            Ok(()) => {
                closing.finish();
                self.callbacks.log(Priority::Info, &format!("{} is inactive.", name));
                Ok(())
            }
            Err(e) if e.is_not_found() && closing.volume().status == VolumeStatus::Invalid => {
                closing.finish();
                self.callbacks.log(
                    Priority::Warning,
                    &format!("{} was already removed from the backend, dropping it: {}", name, e),
                );
                Ok(())
            }
            Err(e) => {
                drop(closing);
                self.fail(&context, Error::from(e))
            }
        }
    }

    /// Registry state of `name` cross-checked with the backend; a disagreement reads as `Invalid`
    pub fn luks_status(&self, name: &str) -> VolumeStatus {
        let recorded = self.registry.status(name);
        let live = self.backend.query_state(name);
        match (recorded, live) {
            (_, BackendState::Unknown) => recorded,
            (VolumeStatus::Inactive, BackendState::Inactive) => VolumeStatus::Inactive,
            (VolumeStatus::Active, BackendState::Active) => VolumeStatus::Active,
            (VolumeStatus::Active, _) => {
                if self.registry.mark_invalid(name) {
                    self.callbacks.log(
                        Priority::Warning,
                        &format!("{} is recorded as active but the backend reports it {:?}", name, live),
                    );
                }
                VolumeStatus::Invalid
            }
            _ => VolumeStatus::Invalid,
        }
    }

    /// Details of the volume open as `name`
    pub fn luks_status_info(&self, name: &str) -> Option<ActiveVolume> {
        let status = self.luks_status(name);
        self.registry.get(name).map(|volume| ActiveVolume { status, ..volume })
    }

    /// Builder to format `device` as a new LUKS1 container
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use cryptsetup_core::*;
    ///
    /// # fn foo() -> Result<()> {
    /// let setup = CryptSetup::new(LogForwarder, FixedAnswer(true), MemoryBackend::new());
    /// let uuid = setup
    ///     .luks_format("/dev/loop0")
    ///     .cipher("aes", "xts-plain64")
    ///     .key_bits(512)
    ///     .luks1("sifra")?;
    /// # let _ = uuid;
    /// # Ok(())
    /// # }
    /// ```
    pub fn luks_format<P: AsRef<Path>>(&self, device: P) -> FormatBuilder<'_, B> {
        FormatBuilder {
            setup: self,
            device: device.as_ref().to_path_buf(),
            cipher_name: "aes".to_string(),
            cipher_mode: "xts-plain64".to_string(),
            hash: "sha256".to_string(),
            key_bits: 256,
            iterations: 100_000,
            stripes: LUKS_STRIPES,
            align_payload: 2048,
            uuid: None,
        }
    }
}

/// Struct containing state for the `luks_format()` builder
pub struct FormatBuilder<'a, B: ActivationBackend> {
    setup: &'a CryptSetup<B>,
    device: PathBuf,
    cipher_name: String,
    cipher_mode: String,
    hash: String,
    key_bits: usize,
    iterations: u32,
    stripes: u32,
    align_payload: u32,
    uuid: Option<Uuid>,
}

impl<B: ActivationBackend> FormatBuilder<'_, B> {
    pub fn cipher(mut self, name: &str, mode: &str) -> Self {
        self.cipher_name = name.to_string();
        self.cipher_mode = mode.to_string();
        self
    }

    pub fn hash(mut self, hash: &str) -> Self {
        self.hash = hash.to_string();
        self
    }

    /// Size of the volume key
    pub fn key_bits(mut self, key_bits: usize) -> Self {
        self.key_bits = key_bits;
        self
    }

    /// `PBKDF2` iterations for key slot 0. The volume-key digest uses an eighth of this, but never
    /// less than 1000.
    pub fn iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn stripes(mut self, stripes: u32) -> Self {
        self.stripes = stripes;
        self
    }

    /// Align the payload to a multiple of this many sectors
    pub fn align_payload(mut self, sectors: u32) -> Self {
        self.align_payload = sectors;
        self
    }

    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    /// Formats the device as a LUKS1 crypt device with `passphrase` in key slot 0, after the
    /// confirmation handler agrees
    pub fn luks1<K: AsRef<[u8]>>(self, passphrase: K) -> Result<Uuid> {
        let context = format!("cannot format {}", self.device.display());
        match self.format(passphrase.as_ref()) {
            Ok(uuid) => {
                self.setup.callbacks.log(
                    Priority::Info,
                    &format!("{} formatted as LUKS1 with UUID {}.", self.device.display(), uuid),
                );
                Ok(uuid)
            }
            Err(e) => self.setup.fail(&context, e),
        }
    }

    /// Like `luks1`, with the passphrase read verbatim from `keyfile`; `-` reads standard input
    pub fn luks1_keyfile<F: AsRef<Path>>(self, keyfile: F) -> Result<Uuid> {
        match read_key_file(keyfile.as_ref()) {
            Ok(passphrase) => self.luks1(passphrase.as_slice()),
            Err(e) => self
                .setup
                .fail(&format!("cannot read key file {}", keyfile.as_ref().display()), e),
        }
    }

    fn check_params(&self) -> Result<HashSpec> {
        if self.key_bits == 0 || self.key_bits % 8 != 0 {
            return Err(Error::InvalidArgument(format!("key size of {} bits", self.key_bits)));
        }
        if self.iterations == 0 || self.stripes == 0 {
            return Err(Error::InvalidArgument(
                "iteration and stripe counts must be positive".to_string(),
            ));
        }
        if keyslot::key_material_sectors(self.key_bits / 8, self.stripes).is_none() {
            return Err(Error::InvalidArgument(format!(
                "{} stripes of a {} bit key exceed the key material limit",
                self.stripes, self.key_bits
            )));
        }
        let hash: HashSpec = self.hash.parse()?;
        SectorCipher::check(&self.cipher_name, &self.cipher_mode, self.key_bits / 8)?;
        Ok(hash)
    }

    fn format(&self, passphrase: &[u8]) -> Result<Uuid> {
        let hash = self.check_params()?;
        let setup = self.setup;
        if let Some(name) = setup
            .registry
            .names()
            .into_iter()
            .find(|n| setup.registry.get(n).map(|v| v.device == self.device).unwrap_or(false))
        {
            return Err(Error::InvalidArgument(format!(
                "{} is in use as {}",
                self.device.display(),
                name
            )));
        }

        let key_bytes = self.key_bits / 8;
        let (offsets, payload_offset) = keyslot::layout(key_bytes, self.stripes, self.align_payload)?;
        let header_area = payload_offset as usize * LUKS_SECTOR_SIZE;

        let mut file = open_write(&self.device)?;
        let size = device_size(&mut file)?;
        if size < header_area as u64 {
            return Err(Error::DeviceTooSmall {
                required: header_area as u64,
                actual: size,
            });
        }

        let prompt = format!("This will overwrite data on {} irrevocably.", self.device.display());
        if !setup.callbacks.try_confirm(&prompt)? {
            return Err(Error::ConfirmationDenied);
        }

        let key = VolumeKey::generate(key_bytes)?;
        let mut mk_digest_salt = [0u8; LUKS_SALTSIZE];
        fill_random(&mut mk_digest_salt)?;
        let mk_digest_iterations = (self.iterations / 8).max(MIN_DIGEST_ITERATIONS);
        let mk_digest = keyslot::key_digest(
            setup.kdf.as_ref(),
            hash,
            key.as_bytes(),
            &mk_digest_salt,
            mk_digest_iterations,
        )?;

        // stale key material from a previous header must not survive
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&vec![0u8; header_area])?;

        let mut keyslots = [LuksKeyslot::inactive(0, self.stripes); LUKS_NUMKEYS];
        for (slot, offset) in keyslots.iter_mut().zip(offsets.iter()) {
            *slot = LuksKeyslot::inactive(*offset, self.stripes);
        }
        let slot_params = keyslot::SlotParams {
            cipher_name: &self.cipher_name,
            cipher_mode: &self.cipher_mode,
            hash,
            iterations: self.iterations,
            stripes: self.stripes,
            key_material_offset: offsets[0],
        };
        keyslots[0] = keyslot::seal(&slot_params, passphrase, &key, setup.kdf.as_ref(), &mut file)?;

        let uuid = self.uuid.unwrap_or_else(Uuid::new_v4);
        let header = LuksHeaderV1::new(NewLuks1Header {
            cipher_name: &self.cipher_name,
            cipher_mode: &self.cipher_mode,
            hash_spec: hash.name(),
            payload_offset,
            key_bytes: key_bytes as u32,
            mk_digest,
            mk_digest_salt,
            mk_digest_iterations,
            uuid,
            keyslots,
        })?;
        file.seek(SeekFrom::Start(0))?;
        header.write(&mut file)?;
        file.sync_all()?;
        debug!(
            "formatted {}: payload at sector {}, {} byte key",
            self.device.display(),
            payload_offset,
            key_bytes
        );
        Ok(uuid)
    }
}
