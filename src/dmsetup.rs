//! Activation backend driving the kernel device-mapper through `dmsetup`
//!
//! The crypt table carries the volume key in hex, so it is always piped on stdin and never placed
//! on a command line.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use zeroize::Zeroizing;

use crate::backend::{ActivationBackend, ActivationRequest, BackendError, BackendState};

#[derive(Debug)]
struct Output {
    stdout: String,
    stderr: String,
    status: i32,
}

#[derive(Debug, Clone)]
pub struct DmsetupBackend {
    binary: PathBuf,
}

impl Default for DmsetupBackend {
    fn default() -> Self {
        DmsetupBackend::new()
    }
}

impl DmsetupBackend {
    pub fn new() -> DmsetupBackend {
        DmsetupBackend::with_binary("dmsetup")
    }

    pub fn with_binary<P: Into<PathBuf>>(binary: P) -> DmsetupBackend {
        DmsetupBackend { binary: binary.into() }
    }

    fn run(&self, args: &[&str], input: Option<&[u8]>) -> Result<Output, BackendError> {
        let spawn_error = |e: std::io::Error| {
            BackendError::new(libc::EIO, format!("could not run {}: {}", self.binary.display(), e))
        };

        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() });

        let mut child = command.spawn().map_err(spawn_error)?;
        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(payload) {
                    drop(stdin);
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(spawn_error(e));
                }
            }
        }

        let output = child.wait_with_output().map_err(spawn_error)?;
        Ok(Output {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        })
    }
}

/// `dmsetup` table line for a dm-crypt target over the request's payload
fn crypt_table(request: &ActivationRequest<'_>) -> Zeroizing<String> {
    let key_hex = Zeroizing::new(hex::encode(request.key.as_bytes()));
    Zeroizing::new(format!(
        "0 {} crypt {} {} 0 {} {}\n",
        request.size,
        request.cipher,
        key_hex.as_str(),
        request.device.display(),
        request.payload_offset
    ))
}

fn failure(action: &str, name: &str, out: &Output) -> BackendError {
    let diagnostic = out.stderr.trim();
    let diagnostic = if diagnostic.is_empty() {
        "no additional output"
    } else {
        diagnostic
    };
    BackendError::new(
        classify_failure(diagnostic),
        format!("dmsetup {} {} failed with exit code {}: {}", action, name, out.status, diagnostic),
    )
}

fn classify_failure(diagnostic: &str) -> i32 {
    let lower = diagnostic.to_ascii_lowercase();
    if lower.contains("file exists") || lower.contains("already exists") {
        libc::EEXIST
    } else if lower.contains("permission denied") || lower.contains("operation not permitted") {
        libc::EPERM
    } else if lower.contains("no such device") || lower.contains("does not exist") || lower.contains("not found") {
        libc::ENXIO
    } else {
        libc::EIO
    }
}

/// A live mapping whose table is not a single crypt target is not one of ours
fn classify_table(table: &str) -> BackendState {
    let mut targets = table.lines().filter(|l| !l.trim().is_empty());
    match (targets.next(), targets.next()) {
        (Some(line), None) if line.split_whitespace().nth(2) == Some("crypt") => BackendState::Active,
        _ => BackendState::Invalid,
    }
}

impl ActivationBackend for DmsetupBackend {
    fn activate(&self, request: &ActivationRequest<'_>) -> Result<(), BackendError> {
        let table = crypt_table(request);
        let mut args = vec!["create", request.name];
        if request.read_only {
            args.push("--readonly");
        }
        debug!("dmsetup create {} ({} sectors)", request.name, request.size);
        let out = self.run(&args, Some(table.as_bytes()))?;
        if out.status == 0 {
            Ok(())
        } else {
            Err(failure("create", request.name, &out))
        }
    }

    fn deactivate(&self, name: &str) -> Result<(), BackendError> {
        let out = self.run(&["remove", name], None)?;
        if out.status == 0 {
            Ok(())
        } else {
            Err(failure("remove", name, &out))
        }
    }

    fn query_state(&self, name: &str) -> BackendState {
        match self.run(&["table", name], None) {
            Ok(out) if out.status == 0 => classify_table(&out.stdout),
            Ok(out) if classify_failure(&out.stderr) == libc::ENXIO => BackendState::Inactive,
            Ok(out) => {
                warn!("{}", failure("table", name, &out));
                BackendState::Unknown
            }
            Err(e) => {
                warn!("{}", e);
                BackendState::Unknown
            }
        }
    }
}
