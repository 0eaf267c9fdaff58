//! Privilege separation for handing secrets to the invoking user.
//!
//! The binary may run with an elevated effective uid on behalf of an
//! unprivileged real uid. Files that must end up owned by the real user
//! (freshly issued keys, generated config) are created while the effective
//! and real uids are swapped, and the swap is undone before returning,
//! whether or not the create succeeded.
//!
//! The swap is held only around a single local filesystem call. It is never
//! held across a network call and is not reentrant.

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

/// Permissions for files created on behalf of the caller.
const OWNED_FILE_MODE: u32 = 0o600;
/// Permissions for directories created on behalf of the caller.
const OWNED_DIR_MODE: u32 = 0o700;

/// Uids are process-wide; swaps from different threads are serialized.
static SWAP_LOCK: Mutex<()> = Mutex::new(());

thread_local! {
    static IN_SWAP: Cell<bool> = const { Cell::new(false) };
}

/// Errors from privilege-separated filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum PrivilegeError {
    /// The filesystem operation itself failed.
    #[error("{op} {path}: {source}")]
    Io {
        /// Operation attempted (`create`, `mkdir`, ...).
        op: &'static str,
        /// Target path.
        path: PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },
    /// Switching user ids failed.
    #[error("cannot switch to the real user id: {0}")]
    Switch(nix::errno::Errno),
    /// A swap was requested while another one was still active.
    #[error("privilege swap already active")]
    Reentrant,
}

/// Performs single filesystem operations as the real user.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrivilegeBroker;

impl PrivilegeBroker {
    /// Create a broker.
    pub fn new() -> Self {
        Self
    }

    /// Create `path` as the real user and return a handle for writing.
    ///
    /// With `overwrite = false` the file is created exclusively: an existing
    /// file is left untouched and `Ok(None)` is returned. With
    /// `overwrite = true` an existing file is truncated.
    ///
    /// # Errors
    ///
    /// Returns [`PrivilegeError`] for any other OS-level failure.
    pub fn write_owned_file(
        &self,
        path: &Path,
        overwrite: bool,
    ) -> Result<Option<File>, PrivilegeError> {
        let mut options = OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(OWNED_FILE_MODE);
        }

        debug!(path = %path.display(), overwrite, "creating file as real user");
        let opened = {
            let _scope = RealUserScope::enter()?;
            options.open(path)
        };

        match opened {
            Ok(file) => Ok(Some(file)),
            Err(err) if !overwrite && err.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "file exists, left untouched");
                Ok(None)
            }
            Err(source) => Err(PrivilegeError::Io {
                op: "create",
                path: path.to_owned(),
                source,
            }),
        }
    }

    /// Create directory `path` as the real user. An existing entry counts
    /// as success.
    ///
    /// # Errors
    ///
    /// Returns [`PrivilegeError`] for any failure other than "already exists".
    pub fn ensure_owned_dir(&self, path: &Path) -> Result<(), PrivilegeError> {
        let mut builder = std::fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(OWNED_DIR_MODE);
        }

        debug!(path = %path.display(), "creating directory as real user");
        let created = {
            let _scope = RealUserScope::enter()?;
            builder.create(path)
        };

        match created {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(source) => Err(PrivilegeError::Io {
                op: "mkdir",
                path: path.to_owned(),
                source,
            }),
        }
    }
}

/// Scoped swap of real and effective uid; restored on drop.
struct RealUserScope {
    #[cfg(target_os = "linux")]
    ids: nix::unistd::ResUid,
    _serial: MutexGuard<'static, ()>,
}

impl RealUserScope {
    fn enter() -> Result<Self, PrivilegeError> {
        if IN_SWAP.with(Cell::get) {
            return Err(PrivilegeError::Reentrant);
        }
        let serial = SWAP_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        #[cfg(target_os = "linux")]
        {
            use nix::unistd::{getresuid, setresuid};

            let ids = getresuid().map_err(PrivilegeError::Switch)?;
            if ids.real != ids.effective {
                setresuid(ids.effective, ids.real, ids.saved).map_err(PrivilegeError::Switch)?;
            }
            IN_SWAP.with(|flag| flag.set(true));
            Ok(Self {
                ids,
                _serial: serial,
            })
        }

        #[cfg(not(target_os = "linux"))]
        {
            IN_SWAP.with(|flag| flag.set(true));
            Ok(Self { _serial: serial })
        }
    }
}

impl Drop for RealUserScope {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        {
            if self.ids.real != self.ids.effective {
                if let Err(errno) =
                    nix::unistd::setresuid(self.ids.real, self.ids.effective, self.ids.saved)
                {
                    // Still running as the real user, which is the less privileged side.
                    error!(%errno, "failed to restore effective uid");
                }
            }
        }
        IN_SWAP.with(|flag| flag.set(false));
    }
}
