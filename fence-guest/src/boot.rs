//! Guest bootstrap steps run by `fence-init` before the entry point.
//!
//! Mounts the per-invocation scratch tmpfs, checks that the code volume is
//! read-only, and opens the channel so it exists before any privileged
//! call can happen.

#![allow(unsafe_code)]

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::mount::{MsFlags, mount};
use nix::sys::statvfs::{FsFlags, statvfs};

use crate::endpoint::Endpoint;

/// Mounts a size-capped tmpfs at `path` unless one is already there.
///
/// The scratch area is writable, local and disposable: nothing written there
/// outlives the invocation and none of it goes through the bridge.
pub fn mount_scratch(path: &Path, size_mib: u32) -> io::Result<()> {
    if is_tmpfs(path) {
        return Ok(());
    }
    fs::create_dir_all(path)?;
    let opts = format!("size={size_mib}m,mode=1777");
    mount(
        Some("tmpfs"),
        path,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(opts.as_str()),
    )
    .map_err(io::Error::from)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o1777))
}

/// Returns `true` if `path` is mounted read-only.
pub fn is_read_only(path: &Path) -> io::Result<bool> {
    let st = statvfs(path).map_err(io::Error::from)?;
    Ok(st.flags().contains(FsFlags::ST_RDONLY))
}

/// Returns `true` if `path` is already mounted as tmpfs.
fn is_tmpfs(path: &Path) -> bool {
    let Ok(mounts) = fs::read_to_string("/proc/mounts") else {
        return false;
    };
    mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let mount_point = fields.nth(1).unwrap_or("");
        let fs_type = fields.next().unwrap_or("");
        Path::new(mount_point) == path && fs_type == "tmpfs"
    })
}

/// Connects to the host and returns an inheritable descriptor plus the
/// [`Endpoint::Fd`] address the entry point should use.
pub fn open_channel(endpoint: &Endpoint) -> io::Result<(OwnedFd, Endpoint)> {
    let fd = match endpoint {
        Endpoint::Vsock { cid, port } => vsock_connect(*cid, *port)?,
        Endpoint::Unix(path) => OwnedFd::from(std::os::unix::net::UnixStream::connect(path)?),
        Endpoint::Fd(_) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "descriptor endpoints are already connected",
            ));
        }
    };
    clear_cloexec(&fd)?;
    let n = fd.as_raw_fd();
    Ok((fd, Endpoint::Fd(n)))
}

/// Connects a vsock stream socket to `cid:port`.
fn vsock_connect(cid: u32, port: u32) -> io::Result<OwnedFd> {
    // SAFETY: the descriptor is owned as soon as socket() returns it, and
    // connect() reads a fully initialized sockaddr_vm of the size passed.
    unsafe {
        let fd = libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = OwnedFd::from_raw_fd(fd);

        let mut addr: libc::sockaddr_vm = std::mem::zeroed();
        addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
        addr.svm_cid = cid;
        addr.svm_port = port;

        if libc::connect(
            sock.as_raw_fd(),
            std::ptr::from_ref(&addr).cast(),
            size_of::<libc::sockaddr_vm>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(sock)
    }
}

/// Clears `FD_CLOEXEC` so the descriptor survives `exec`.
fn clear_cloexec(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: fcntl(F_SETFD) on a valid descriptor.
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, 0) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
