//! Scoped network namespace switching for the calling thread.

use crate::error::KernelError;
use nix::sched::{CloneFlags, setns};
use std::fs::File;
use std::io;
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Namespace of the calling thread. `/proc/self` would name the main thread.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// An open network namespace file.
#[derive(Debug)]
pub struct Netns {
    file: File,
    path: PathBuf,
}

impl Netns {
    pub fn open(path: &Path) -> Result<Self, KernelError> {
        let file = File::open(path).map_err(|source| KernelError::Namespace {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// The namespace the calling thread is in right now.
    pub fn current() -> Result<Self, KernelError> {
        Self::open(Path::new(THREAD_NETNS))
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Switch the calling thread into this namespace until the guard drops.
    pub fn enter(&self) -> Result<NetnsGuard, KernelError> {
        let previous = Self::current()?;
        setns(self.file.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
            KernelError::Namespace {
                path: self.path.clone(),
                source: io::Error::from(e),
            }
        })?;
        debug!(netns = %self.path.display(), "Entered network namespace");
        Ok(NetnsGuard {
            previous,
            _thread_bound: PhantomData,
        })
    }
}

/// Restores the thread's previous namespace on drop, on every exit path.
#[must_use = "the namespace is restored as soon as the guard is dropped"]
pub struct NetnsGuard {
    previous: Netns,
    // setns(2) is per thread; the guard must not migrate.
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(self.previous.file.as_fd(), CloneFlags::CLONE_NEWNET) {
            // Later requests on this thread would land in the wrong namespace.
            error!(error = %e, "Failed to restore network namespace");
            std::process::abort();
        }
        debug!("Restored network namespace");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_namespace() {
        let err = Netns::open(Path::new("/nonexistent/ns/net")).unwrap_err();
        assert!(matches!(err, KernelError::Namespace { .. }));
        assert!(err.to_string().contains("/nonexistent/ns/net"));
    }

    #[test]
    fn test_enter_own_namespace_restores() {
        let Ok(current) = Netns::current() else {
            eprintln!("Skipping test: {THREAD_NETNS} not available");
            return;
        };
        if !nix::unistd::Uid::effective().is_root() {
            eprintln!("Skipping test: requires root privileges");
            return;
        }
        let before = std::fs::read_link(THREAD_NETNS).unwrap();
        {
            let _guard = current.enter().unwrap();
            assert_eq!(std::fs::read_link(THREAD_NETNS).unwrap(), before);
        }
        assert_eq!(std::fs::read_link(THREAD_NETNS).unwrap(), before);
    }
}
