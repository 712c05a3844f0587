//! Authorization and execution of individual guest operations.
//!
//! [`authorize`] decides from the grants alone and never touches a real
//! resource; [`execute`] performs the operation and may still fail with a
//! normalized code. Handle operations are not checked against grants: the
//! handle itself was only issued after a check.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use fence_proto::{ErrorCode, ErrorInfo, FileKind, FileStat, Handle, Op, OpenMode, Payload};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::capability::{Budget, Denial, OpClass, Permit, Target, normalize};
use crate::handles::Resource;
use crate::invocation::Invocation;

/// Maps a policy refusal onto the wire.
fn denied(d: &Denial) -> ErrorInfo {
    ErrorInfo::denied(d.to_string())
}

/// Maps a host I/O failure onto the wire.
fn failed(e: &std::io::Error) -> ErrorInfo {
    ErrorInfo::from(e)
}

/// Normalizes a guest path; one that climbs above `/` is outside every grant.
fn guest_path(path: &str) -> Result<PathBuf, ErrorInfo> {
    normalize(path).ok_or_else(|| ErrorInfo::denied(format!("path {path:?} is outside every grant")))
}

/// Checks `op` against the invocation's grants.
///
/// Opens and connects reserve a handle slot of the deciding grant in the
/// returned permit; the slot is released again if the permit is dropped
/// before a handle takes ownership of it.
pub fn authorize(inv: &Invocation, op: &Op) -> Result<Permit, ErrorInfo> {
    let check = |class, target: Target<'_>, consume| {
        inv.caps()
            .authorize(class, target, consume)
            .map_err(|d| denied(&d))
    };
    match op {
        Op::Open { path, mode } => {
            let class = if mode.writes() { OpClass::Write } else { OpClass::Read };
            check(class, Target::Path(&guest_path(path)?), true)
        }
        Op::Stat { path } => check(OpClass::Read, Target::Path(&guest_path(path)?), false),
        Op::Unlink { path } => check(OpClass::Write, Target::Path(&guest_path(path)?), false),
        Op::Connect { host, port } => check(
            OpClass::Connect,
            Target::Endpoint { host, port: *port },
            true,
        ),
        Op::StateGet { key } => check(OpClass::StateRead, Target::Key(key), false),
        Op::StatePut { key, .. } => check(OpClass::StateWrite, Target::Key(key), false),
        _ => Ok(Permit::free()),
    }
}

/// Performs an authorized operation.
pub async fn execute(inv: &Invocation, op: Op, permit: Permit) -> Result<Payload, ErrorInfo> {
    match op {
        Op::Open { path, mode } => open(inv, &path, mode, permit).await,
        Op::Read { handle, len } => read(inv, handle, len).await,
        Op::Write { handle, data } => write(inv, handle, &data).await,
        Op::Close { handle } => {
            if inv.handles().remove(handle) {
                Ok(Payload::Unit)
            } else {
                Err(ErrorInfo::bad_handle(handle))
            }
        }
        Op::Stat { path } => stat(inv, &path).await,
        Op::Unlink { path } => {
            let real = resolve(inv, &guest_path(&path)?, OpClass::Write, false).await?;
            fs::remove_file(&real).await.map_err(|e| failed(&e))?;
            Ok(Payload::Unit)
        }
        Op::Connect { host, port } => connect(inv, &host, port, permit).await,
        Op::Send { handle, data } => send(inv, handle, &data).await,
        Op::Recv { handle, max } => recv(inv, handle, max).await,
        Op::StateGet { key } => Ok(Payload::Value(inv.env().store.get(inv.function(), &key))),
        Op::StatePut { key, value } => {
            inv.env().store.put(inv.function(), &key, value);
            Ok(Payload::Unit)
        }
        _ => Err(ErrorInfo::protocol("unsupported operation")),
    }
}

/// Maps a normalized guest path to a real path under the host root.
///
/// The resolved location must stay inside the root, and if symlinks moved
/// it elsewhere inside the root, the new guest path must be covered by a
/// `class` grant too. With `follow` unset the final component is not
/// resolved, so unlink removes a link rather than its target.
async fn resolve(inv: &Invocation, guest: &Path, class: OpClass, follow: bool) -> Result<PathBuf, ErrorInfo> {
    let root = &inv.env().fs_root;
    let joined = root.join(guest.strip_prefix("/").unwrap_or(guest));

    let canonical = if follow {
        match fs::canonicalize(&joined).await {
            Ok(p) => Some(p),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(failed(&e)),
        }
    } else {
        None
    };
    let real = match canonical {
        Some(p) => p,
        None => {
            let (Some(parent), Some(name)) = (joined.parent(), joined.file_name()) else {
                return Err(ErrorInfo::new(ErrorCode::InvalidInput, "path names the root"));
            };
            let real = fs::canonicalize(parent).await.map_err(|e| failed(&e))?.join(name);
            // A dangling link would be followed by a creating open.
            if follow
                && fs::symlink_metadata(&real)
                    .await
                    .is_ok_and(|m| m.file_type().is_symlink())
            {
                return Err(escape());
            }
            real
        }
    };

    let inside = real.strip_prefix(root).map_err(|_| escape())?;
    let resolved = Path::new("/").join(inside);
    if resolved != guest {
        inv.caps()
            .authorize(class, Target::Path(&resolved), false)
            .map_err(|d| denied(&d))?;
    }
    Ok(real)
}

/// Error for a path that resolves outside the host root.
fn escape() -> ErrorInfo {
    ErrorInfo::new(ErrorCode::PermissionDenied, "path escapes the filesystem root")
}

/// `open`: the permit becomes the handle's slot.
async fn open(inv: &Invocation, path: &str, mode: OpenMode, permit: Permit) -> Result<Payload, ErrorInfo> {
    let class = if mode.writes() { OpClass::Write } else { OpClass::Read };
    let real = resolve(inv, &guest_path(path)?, class, true).await?;

    let mut opts = OpenOptions::new();
    match mode {
        OpenMode::Read => opts.read(true),
        OpenMode::Write => opts.write(true).create(true).truncate(true),
        OpenMode::Append => opts.append(true).create(true),
        OpenMode::CreateNew => opts.write(true).create_new(true),
        _ => return Err(ErrorInfo::new(ErrorCode::InvalidInput, "unsupported open mode")),
    };
    let file = opts.open(&real).await.map_err(|e| failed(&e))?;
    let handle = inv.handles().insert(Resource::file(file, mode.writes()), permit);
    Ok(Payload::Handle(handle))
}

/// `read`: at most `len` bytes from the current position; empty at EOF.
async fn read(inv: &Invocation, handle: Handle, len: u32) -> Result<Payload, ErrorInfo> {
    let entry = inv.handles().get(handle).ok_or_else(|| ErrorInfo::bad_handle(handle))?;
    let Resource::File { file, .. } = &entry.resource else {
        return Err(ErrorInfo::bad_handle(handle));
    };
    let mut buf = vec![0u8; len as usize];
    let n = file.lock().await.read(&mut buf).await.map_err(|e| failed(&e))?;
    buf.truncate(n);
    Ok(Payload::Data(buf))
}

/// `write`: the whole buffer or an error, charged to the write budget.
async fn write(inv: &Invocation, handle: Handle, data: &[u8]) -> Result<Payload, ErrorInfo> {
    let entry = inv.handles().get(handle).ok_or_else(|| ErrorInfo::bad_handle(handle))?;
    let Resource::File { file, writable: true } = &entry.resource else {
        return Err(ErrorInfo::bad_handle(handle));
    };
    let len = data.len() as u64;
    let budget = inv.caps().charge(Budget::WriteBytes, len).map_err(|d| denied(&d))?;
    let mut file = file.lock().await;
    file.write_all(data).await.map_err(|e| failed(&e))?;
    file.flush().await.map_err(|e| failed(&e))?;
    budget.settle(len);
    Ok(Payload::Count(len))
}

/// `stat`: metadata of the resolved path, following symlinks.
async fn stat(inv: &Invocation, path: &str) -> Result<Payload, ErrorInfo> {
    let real = resolve(inv, &guest_path(path)?, OpClass::Read, true).await?;
    let meta = fs::metadata(&real).await.map_err(|e| failed(&e))?;
    let kind = if meta.is_file() {
        FileKind::File
    } else if meta.is_dir() {
        FileKind::Dir
    } else {
        FileKind::Other
    };
    let modified_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| u64::try_from(d.as_millis()).ok());
    Ok(Payload::Stat(FileStat::new(
        meta.len(),
        kind,
        meta.permissions().readonly(),
        modified_ms,
    )))
}

/// `connect`: bounded by the host's connect timeout.
async fn connect(inv: &Invocation, host: &str, port: u16, permit: Permit) -> Result<Payload, ErrorInfo> {
    let timeout = inv.env().connect_timeout;
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ErrorInfo::new(ErrorCode::TimedOut, format!("connect to {host}:{port} timed out")))?
        .map_err(|e| failed(&e))?;
    let handle = inv.handles().insert(Resource::conn(stream), permit);
    Ok(Payload::Handle(handle))
}

/// `send`: the whole buffer or an error, charged to the send budget.
async fn send(inv: &Invocation, handle: Handle, data: &[u8]) -> Result<Payload, ErrorInfo> {
    let entry = inv.handles().get(handle).ok_or_else(|| ErrorInfo::bad_handle(handle))?;
    let Resource::Conn { tx, .. } = &entry.resource else {
        return Err(ErrorInfo::bad_handle(handle));
    };
    let len = data.len() as u64;
    let budget = inv.caps().charge(Budget::SendBytes, len).map_err(|d| denied(&d))?;
    tx.lock().await.write_all(data).await.map_err(|e| failed(&e))?;
    budget.settle(len);
    Ok(Payload::Count(len))
}

/// `recv`: whatever is available up to `max`; empty once the peer closed.
async fn recv(inv: &Invocation, handle: Handle, max: u32) -> Result<Payload, ErrorInfo> {
    let entry = inv.handles().get(handle).ok_or_else(|| ErrorInfo::bad_handle(handle))?;
    let Resource::Conn { rx, .. } = &entry.resource else {
        return Err(ErrorInfo::bad_handle(handle));
    };
    let mut buf = vec![0u8; max as usize];
    let n = rx.lock().await.read(&mut buf).await.map_err(|e| failed(&e))?;
    buf.truncate(n);
    Ok(Payload::Data(buf))
}
