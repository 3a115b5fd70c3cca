//! Network namespace switching
//!
//! Provides:
//! - The `NetnsOps` trait for reading and switching the calling thread's namespace
//! - `NetnsGuard`, a scoped entry that always restores the original namespace
//! - `NetNs`, a Linux namespace handle switched with setns(2)
//!
//! Namespace membership is per OS thread. Everything executed on the thread
//! while a guard is alive runs in the target namespace, including child
//! processes spawned from it.

use crate::error::{Error, Result};
use std::fmt;
use tracing::{debug, error};

/// Capability to read and switch the ambient network namespace of the calling thread
pub trait NetnsOps {
    /// Handle to a network namespace
    type Netns: fmt::Debug;

    /// Namespace the calling thread currently belongs to
    fn current_netns(&self) -> Result<Self::Netns>;

    /// Move the calling thread into `ns`
    fn set_netns(&self, ns: &Self::Netns) -> Result<()>;
}

/// Scoped namespace entry
///
/// Created by [`NetnsGuard::enter`]. The original namespace is restored by
/// [`NetnsGuard::exit`], or on drop when the scope ends early (error return or
/// unwinding).
pub struct NetnsGuard<'a, O: NetnsOps + ?Sized> {
    ops: &'a O,
    original: O::Netns,
    released: bool,
}

impl<'a, O: NetnsOps + ?Sized> NetnsGuard<'a, O> {
    /// Remember the current namespace, then switch into `target`
    pub fn enter(ops: &'a O, target: &O::Netns) -> Result<Self> {
        let original = ops.current_netns()?;
        ops.set_netns(target)?;
        debug!(target_ns = ?target, "entered network namespace");
        Ok(Self {
            ops,
            original,
            released: false,
        })
    }

    /// The namespace that was active before entering (usually the host)
    pub fn original(&self) -> &O::Netns {
        &self.original
    }

    /// Restore the original namespace, reporting failure
    pub fn exit(mut self) -> Result<()> {
        self.released = true;
        self.ops.set_netns(&self.original)
    }
}

impl<O: NetnsOps + ?Sized> Drop for NetnsGuard<'_, O> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.ops.set_netns(&self.original) {
            error!(original_ns = ?self.original, error = %e, "failed to restore network namespace");
        }
    }
}

/// Run `f` with `target` as the ambient namespace
///
/// `f` receives the namespace that was active on entry. Its error is returned
/// unmodified; the original namespace is restored on every exit path.
pub fn with_netns<O, T, F>(ops: &O, target: &O::Netns, f: F) -> Result<T>
where
    O: NetnsOps + ?Sized,
    F: FnOnce(&O::Netns) -> Result<T>,
{
    let guard = NetnsGuard::enter(ops, target)?;
    match f(guard.original()) {
        Ok(value) => {
            guard.exit()?;
            Ok(value)
        }
        Err(e) => {
            drop(guard);
            Err(e)
        }
    }
}

/// A Linux network namespace held open by file descriptor
#[cfg(target_os = "linux")]
pub struct NetNs {
    file: std::fs::File,
    path: std::path::PathBuf,
}

#[cfg(target_os = "linux")]
impl NetNs {
    /// Open a namespace by path (e.g. `/var/run/netns/pod1` or `/proc/<pid>/ns/net`)
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path).map_err(|e| Error::Namespace {
            path: path.display().to_string(),
            message: format!("open failed: {}", e),
        })?;
        Ok(Self { file, path })
    }

    /// Namespace of the calling thread
    pub fn current() -> Result<Self> {
        Self::open("/proc/thread-self/ns/net")
    }

    /// A path that resolves to this namespace from any process on the host
    ///
    /// Thread-relative paths like `/proc/thread-self/ns/net` stop pointing at
    /// this namespace once the thread switches, so refer to the open fd instead.
    pub fn fd_path(&self) -> String {
        use std::os::fd::AsRawFd;
        format!("/proc/{}/fd/{}", std::process::id(), self.file.as_raw_fd())
    }

    pub(crate) fn switch(&self) -> Result<()> {
        use nix::sched::{CloneFlags, setns};

        setns(&self.file, CloneFlags::CLONE_NEWNET).map_err(|e| Error::Namespace {
            path: self.path.display().to_string(),
            message: format!("setns failed: {}", e),
        })
    }
}

#[cfg(target_os = "linux")]
impl fmt::Debug for NetNs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetNs").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::{HOST_NETNS, MemoryHost};
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn test_with_netns_runs_inside_and_restores() {
        let host = MemoryHost::new();
        let pod = host.add_netns();

        let seen = with_netns(&host, &pod, |original| {
            assert_eq!(*original, HOST_NETNS);
            host.current_netns()
        })
        .unwrap();

        assert_eq!(seen, pod);
        assert_eq!(host.current_netns().unwrap(), HOST_NETNS);
    }

    #[test]
    fn test_with_netns_restores_after_error() {
        let host = MemoryHost::new();
        let pod = host.add_netns();

        let err = with_netns(&host, &pod, |_| -> Result<()> {
            Err(Error::Network("inner failure".into()))
        })
        .unwrap_err();

        assert!(matches!(err, Error::Network(ref m) if m == "inner failure"));
        assert_eq!(host.current_netns().unwrap(), HOST_NETNS);
    }

    #[test]
    fn test_with_netns_restores_after_panic() {
        let host = MemoryHost::new();
        let pod = host.add_netns();

        let result = catch_unwind(AssertUnwindSafe(|| {
            with_netns(&host, &pod, |_| -> Result<()> { panic!("boom") })
        }));

        assert!(result.is_err());
        assert_eq!(host.current_netns().unwrap(), HOST_NETNS);
    }

    #[test]
    fn test_enter_failure_leaves_thread_in_place() {
        let host = MemoryHost::new();
        let pod = host.add_netns();
        host.remove_netns(pod);

        assert!(NetnsGuard::enter(&host, &pod).is_err());
        assert_eq!(host.current_netns().unwrap(), HOST_NETNS);
    }

    #[test]
    fn test_guard_is_thread_affine() {
        let host = MemoryHost::new();
        let pod = host.add_netns();

        let _guard = NetnsGuard::enter(&host, &pod).unwrap();
        std::thread::scope(|s| {
            s.spawn(|| assert_eq!(host.current_netns().unwrap(), HOST_NETNS));
        });
        assert_eq!(host.current_netns().unwrap(), pod);
    }
}
