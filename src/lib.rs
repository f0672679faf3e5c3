extern crate errno;
extern crate libc;
extern crate luks_header;
extern crate uuid;

#[macro_use]
extern crate log;

pub mod af;
pub mod api;
pub mod backend;
pub mod callback;
pub mod crypto;
pub mod device;
pub mod dmsetup;
pub mod keyslot;
pub mod luks1;
pub mod registry;

pub use api::{CryptSetup, FormatBuilder};
pub use backend::{ActivationBackend, ActivationRequest, BackendError, BackendState, MemoryBackend};
pub use callback::{Confirm, FixedAnswer, HandlerError, LogForwarder, Logger, Priority};
pub use crypto::{HashSpec, KeyDerivation, Pbkdf2, VolumeKey};
pub use device::{Error, Keyslot, Result};
pub use dmsetup::DmsetupBackend;
pub use luks1::Luks1Params;
pub use registry::{ActiveVolume, VolumeStatus};
