//! `fence run`: one local invocation without a VM.
//!
//! The entry point is spawned with one end of a socket pair left open
//! across `exec` and named in `FENCE_CHANNEL`; the host serves the other
//! end. Useful for developing functions against a real policy.

#![allow(unsafe_code)]

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Command, ExitStatus};

use anyhow::{Context, Result, bail};
use fence::CloseReason;
use fence_guest::CHANNEL_ENV;

use crate::{HostArgs, shutdown_on_interrupt};

/// Arguments for `fence run`.
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub struct RunArgs {
    #[command(flatten)]
    host: HostArgs,

    /// Entry point and its arguments.
    #[arg(required = true, num_args = 1..)]
    command: Vec<String>,
}

/// Runs the entry point as one invocation and reports its summary.
pub async fn run(args: RunArgs) -> Result<()> {
    let (host, manifest) = args.host.open()?;
    shutdown_on_interrupt(&host);

    let (host_end, guest_end) = UnixStream::pair().context("creating channel")?;
    let guest_fd = OwnedFd::from(guest_end);
    let raw = guest_fd.as_raw_fd();

    let mut cmd = Command::new(&args.command[0]);
    cmd.args(&args.command[1..]).env(CHANNEL_ENV, format!("fd:{raw}"));
    // SAFETY: the closure only calls fcntl, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || clear_cloexec(raw));
    }
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {}", args.command[0]))?;
    // The child holds its own copy now.
    drop(guest_fd);

    host_end.set_nonblocking(true)?;
    let stream = tokio::net::UnixStream::from_std(host_end)?;
    let summary = host.invoke(&manifest, stream).await?;
    eprintln!("fence: {summary}");

    if summary.reason != CloseReason::Completed {
        let _ = child.kill();
    }
    let status = tokio::task::spawn_blocking(move || child.wait())
        .await
        .context("waiting for entry point")??;
    check_status(status, summary.reason)
}

/// Turns the entry point's exit into the command result.
fn check_status(status: ExitStatus, reason: CloseReason) -> Result<()> {
    match reason {
        CloseReason::Completed if status.success() => Ok(()),
        CloseReason::Completed => bail!("entry point exited with {status}"),
        reason => bail!("invocation ended: {reason}"),
    }
}

/// Clears `FD_CLOEXEC` so the descriptor survives `exec`.
fn clear_cloexec(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: fcntl(F_SETFD) is async-signal-safe and the FD is valid.
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, 0) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}
