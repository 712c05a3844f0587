//! fence-init: guest bootstrap that runs before the function entry point.
//!
//! Mounts the scratch tmpfs, checks the code volume, opens the host channel
//! and `exec`s the entry point with the channel descriptor inherited. The
//! entry point is the remaining command line.
//!
//! Configuration comes from the environment:
//! - `FENCE_CHANNEL`: host address (default `vsock:2:<HOST_PORT>`)
//! - `FENCE_SCRATCH`: scratch mount point (default `/tmp`)
//! - `FENCE_SCRATCH_MIB`: scratch size cap (default `64`)
//! - `FENCE_CODE`: code volume (default `/var/task`)
//! - `FENCE_PATH_VAR`: search-path variable to point at the code volume
//!   (default `PYTHONPATH`)

// Runs before anything could collect logs, so stderr is the error channel.
#![allow(clippy::print_stderr)]

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("[fence-init] only runs inside a Linux guest");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() {
    let err = init::run();
    eprintln!("[fence-init] {err}");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
mod init {
    use std::io;
    use std::os::unix::process::CommandExt;
    use std::path::PathBuf;
    use std::process::Command;

    use fence_guest::{CHANNEL_ENV, Endpoint, boot};
    use fence_proto::HOST_PORT;

    /// Host context id on vsock.
    const HOST_CID: u32 = 2;

    /// Reads an environment variable with a default.
    fn env_or(key: &str, default: &str) -> String {
        std::env::var(key).unwrap_or_else(|_| default.to_owned())
    }

    /// Performs every boot step and execs; only returns on failure.
    pub(crate) fn run() -> io::Error {
        match try_run() {
            Ok(never) => match never {},
            Err(e) => e,
        }
    }

    /// Fallible body of [`run`].
    fn try_run() -> io::Result<std::convert::Infallible> {
        let mut args = std::env::args_os().skip(1);
        let Some(entry) = args.next() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "usage: fence-init <entry-point> [args...]",
            ));
        };

        let scratch = PathBuf::from(env_or("FENCE_SCRATCH", "/tmp"));
        let scratch_mib = env_or("FENCE_SCRATCH_MIB", "64")
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        boot::mount_scratch(&scratch, scratch_mib)?;

        let code = PathBuf::from(env_or("FENCE_CODE", "/var/task"));
        if !boot::is_read_only(&code)? {
            eprintln!(
                "[fence-init] warning: code volume {} is writable",
                code.display()
            );
        }

        let endpoint: Endpoint = env_or(CHANNEL_ENV, &format!("vsock:{HOST_CID}:{HOST_PORT}"))
            .parse()
            .map_err(io::Error::from)?;
        let mut cmd = Command::new(entry);
        cmd.args(args)
            .env(env_or("FENCE_PATH_VAR", "PYTHONPATH"), &code)
            .env("TMPDIR", &scratch)
            .current_dir(&scratch);

        // The channel must exist before the entry point can make a call.
        let _channel = match endpoint {
            Endpoint::Fd(_) => None,
            other => {
                let (fd, inherited) = boot::open_channel(&other)?;
                cmd.env(CHANNEL_ENV, inherited.to_string());
                Some(fd)
            }
        };

        Err(cmd.exec())
    }
}
