//! Exclusive access to device file descriptors.
//!
//! [`FdAccessor`] wraps the common file-descriptor interactions for a device
//! node and, when requested, holds an exclusive advisory lock on the same
//! descriptor so the instance is the only process on the system using the
//! path. Locking happens at open time; if the descriptor can be opened but
//! the lock cannot be taken, the descriptor is closed again before the error
//! is returned. The kernel drops the advisory lock automatically when the
//! descriptor closes, so no explicit unlock is ever issued.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;

use crate::error::{DeviceError, Result};

/// Cadence for [`wait_path_accessible`].
const PATH_POLL: Duration = Duration::from_millis(100);

/// Open mode for a device descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    fn options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            AccessMode::Read => opts.read(true),
            AccessMode::Write => opts.write(true),
            AccessMode::ReadWrite => opts.read(true).write(true),
        };
        opts
    }
}

/// A device descriptor with optional process-exclusive advisory locking.
///
/// The descriptor is released exactly once: either by [`close`] or on drop,
/// whichever comes first. Every operation on a released accessor fails with
/// [`DeviceError::NotOpen`] rather than silently doing nothing.
///
/// [`close`]: FdAccessor::close
#[derive(Debug)]
pub struct FdAccessor {
    name: String,
    path: PathBuf,
    mode: AccessMode,
    locked: bool,
    file: Option<File>,
}

impl FdAccessor {
    /// Open `path` under `mode`, optionally taking an exclusive advisory
    /// lock on the new descriptor.
    ///
    /// A failed lock closes the descriptor before returning
    /// [`DeviceError::Lock`], so an open-but-unlocked accessor can never be
    /// observed.
    pub fn open(name: &str, path: &Path, mode: AccessMode, lock: bool) -> Result<Self> {
        let file = mode.options().open(path).map_err(|e| DeviceError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;

        if lock {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                // Descriptor closes here; the error carries the path only.
                drop(file);
                return Err(DeviceError::Lock {
                    path: path.to_path_buf(),
                });
            }
        }
        debug!(target: name, "opened [{}], lock: {}", path.display(), lock);

        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            mode,
            locked: lock,
            file: Some(file),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_locked(&self) -> bool {
        self.locked && self.is_open()
    }

    /// Whether the descriptor is still held.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| DeviceError::NotOpen {
            name: self.name.clone(),
        })
    }

    /// Write the full buffer to the descriptor, returning the written
    /// length. A short write is reported as an I/O error.
    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<usize> {
        use std::io::Write;
        let mut file = self.file()?;
        let written = file.write(buf).map_err(|e| DeviceError::io(&self.name, e.to_string()))?;
        if written != buf.len() {
            return Err(DeviceError::io(
                &self.name,
                format!(
                    "short write to [{}]: expected {}, wrote {}",
                    self.path.display(),
                    buf.len(),
                    written
                ),
            ));
        }
        Ok(written)
    }

    /// Encode `text` and forward to [`write_bytes`].
    ///
    /// [`write_bytes`]: FdAccessor::write_bytes
    pub fn write_str(&mut self, text: &str) -> Result<usize> {
        self.write_bytes(text.as_bytes())
    }

    /// Read from the descriptor.
    ///
    /// With `n == 0` a single best-effort read returns whatever is
    /// available. With `n > 0` the returned length must equal `n` exactly;
    /// device register protocols answer in fixed-size frames, so anything
    /// else is an I/O error.
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        const BUF_SIZE: usize = 65535;

        let mut file = self.file()?;
        let mut buf = vec![0u8; if n == 0 { BUF_SIZE } else { n }];
        let got = file
            .read(&mut buf)
            .map_err(|e| DeviceError::io(&self.name, e.to_string()))?;
        if n > 0 && got != n {
            return Err(DeviceError::io(
                &self.name,
                format!("mismatched read length: expected {}, got {}", n, got),
            ));
        }
        buf.truncate(got);
        Ok(buf)
    }

    /// Read as in [`read_bytes`], lossily decoded to a string.
    ///
    /// [`read_bytes`]: FdAccessor::read_bytes
    pub fn read_str(&mut self, n: usize) -> Result<String> {
        let bytes = self.read_bytes(n)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Release the descriptor. A second call fails with
    /// [`DeviceError::NotOpen`]; the release itself happens at most once.
    pub fn close(&mut self) -> Result<()> {
        match self.file.take() {
            Some(file) => {
                debug!(target: &self.name, "closing [{}]", self.path.display());
                drop(file);
                Ok(())
            }
            None => Err(DeviceError::NotOpen {
                name: self.name.clone(),
            }),
        }
    }
}

impl Drop for FdAccessor {
    fn drop(&mut self) {
        if self.file.is_some() {
            debug!(target: &self.name, "releasing [{}]", self.path.display());
        }
        // The descriptor (and with it any advisory lock) closes when the
        // inner File drops.
    }
}

/// Suspend the calling thread until `path` exists.
///
/// Kernel-provisioned device nodes can appear asynchronously after the
/// module that provides them loads; this polls at 100 ms cadence with no
/// timeout.
pub fn wait_path_accessible(path: &Path) {
    while !path.exists() {
        std::thread::sleep(PATH_POLL);
    }
}
