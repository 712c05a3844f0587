//! Multiplexed syscall client over one channel.
//!
//! Many tasks may call concurrently. Each call takes a fresh correlation id,
//! parks a oneshot slot in the pending table, queues its request frame and
//! waits. A writer task drains the queue so every frame is written whole even
//! when its caller is cancelled. A single router task reads responses and
//! completes slots by id, so responses may arrive in any order. When either
//! task stops, for whatever reason, every parked and every later call fails
//! with [`Error::ChannelClosed`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use fence_proto::{
    FileStat, FrameReader, FrameWriter, Handle, Hello, InvocationId, MAX_IO_CHUNK, Op, OpenMode,
    Opcode, Outcome, PROTOCOL_VERSION, Payload, RequestFrame, ResponseFrame, to_frame,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Longest accepted path, in bytes.
const MAX_PATH: usize = 4096;
/// Longest accepted state key, in bytes.
const MAX_KEY: usize = 512;

/// Type-erased read half of the channel.
type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
/// Type-erased write half of the channel.
type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Guest end of one invocation's channel.
///
/// Cheap to clone; all clones share the channel. Dropping the last clone
/// stops the router and releases the stream.
#[derive(Clone)]
pub struct Client {
    /// State shared with the router task.
    shared: Arc<Shared>,
    /// Aborts the background tasks when the last client clone goes away.
    tasks: Arc<Tasks>,
}

/// Pending table plus the write half.
struct Shared {
    /// Invocation announced by the host.
    invocation: InvocationId,
    /// Write half; only the writer task and shutdown touch it.
    writer: FrameWriter<BoxWrite>,
    /// Outstanding calls keyed by correlation id.
    pending: Mutex<Pending>,
    /// Next candidate correlation id.
    next_id: AtomicU64,
}

/// Outstanding response slots.
struct Pending {
    /// One slot per request whose frame has been queued.
    slots: HashMap<u64, oneshot::Sender<Outcome>>,
    /// Frame queue of the writer task; `None` once the channel closed.
    outbox: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// Owns the router and writer tasks.
struct Tasks {
    /// Routes responses to slots.
    router: JoinHandle<()>,
    /// Writes queued request frames.
    writer: JoinHandle<()>,
}

impl Drop for Tasks {
    fn drop(&mut self) {
        self.router.abort();
        self.writer.abort();
    }
}

impl Client {
    /// Performs the guest side of the handshake on `stream` and starts the
    /// response router.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn handshake<S>(stream: S) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        let mut reader = FrameReader::new(Box::new(r) as BoxRead);
        let writer = FrameWriter::new(Box::new(w) as BoxWrite);

        let hello: Hello = reader.recv().await?.ok_or(Error::ChannelClosed)?;
        if hello.version != PROTOCOL_VERSION {
            writer.close().await;
            return Err(Error::Protocol(format!(
                "host protocol v{}, guest protocol v{PROTOCOL_VERSION}",
                hello.version
            )));
        }

        let (outbox, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            invocation: hello.invocation,
            writer,
            pending: Mutex::new(Pending {
                slots: HashMap::new(),
                outbox: Some(outbox),
            }),
            next_id: AtomicU64::new(1),
        });
        let tasks = Tasks {
            router: tokio::spawn(route(reader, Arc::clone(&shared))),
            writer: tokio::spawn(pump(queue, Arc::clone(&shared))),
        };
        Ok(Self {
            shared,
            tasks: Arc::new(tasks),
        })
    }

    /// Invocation this channel belongs to.
    pub fn invocation(&self) -> InvocationId {
        self.shared.invocation
    }

    /// Whether the channel has been torn down.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().outbox.is_none()
    }

    /// Closes the channel from the guest side.
    ///
    /// Outstanding calls fail with [`Error::ChannelClosed`]; the host treats
    /// this as the end of the invocation.
    pub async fn disconnect(&self) {
        self.shared.shutdown().await;
        self.tasks.router.abort();
    }

    /// Sends `op` and waits for its response.
    ///
    /// Cancel-safe: the request is queued before the first await, so a
    /// dropped call still sends its whole frame and its late response is
    /// discarded. The payload shape is checked against the opcode by the
    /// typed helpers, not here.
    pub async fn call(&self, op: Op) -> Result<Payload> {
        validate(&op)?;
        let opcode = op.opcode();
        let args = op
            .encode_args()
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;

        let rx = self.shared.submit(opcode, args)?;
        match rx.await.map_err(|_| Error::ChannelClosed)? {
            Outcome::Ok(payload) => Ok(payload),
            Outcome::Err(info) => Err(Error::from(info)),
        }
    }

    /// Opens a file; see [`OpenMode`].
    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<Handle> {
        let op = Op::Open {
            path: path.to_owned(),
            mode,
        };
        match self.call(op).await? {
            Payload::Handle(h) => Ok(h),
            other => Err(self.mismatch(Opcode::Open, &other).await),
        }
    }

    /// Reads up to `len` bytes; an empty result means end of file.
    pub async fn read(&self, handle: Handle, len: u32) -> Result<Vec<u8>> {
        match self.call(Op::Read { handle, len }).await? {
            Payload::Data(d) if d.len() <= len as usize => Ok(d),
            other => Err(self.mismatch(Opcode::Read, &other).await),
        }
    }

    /// Writes `data`, returning the number of bytes the host accepted.
    pub async fn write(&self, handle: Handle, data: Vec<u8>) -> Result<u64> {
        match self.call(Op::Write { handle, data }).await? {
            Payload::Count(n) => Ok(n),
            other => Err(self.mismatch(Opcode::Write, &other).await),
        }
    }

    /// Closes a file or connection handle.
    pub async fn close(&self, handle: Handle) -> Result<()> {
        match self.call(Op::Close { handle }).await? {
            Payload::Unit => Ok(()),
            other => Err(self.mismatch(Opcode::Close, &other).await),
        }
    }

    /// Returns metadata for `path`.
    pub async fn stat(&self, path: &str) -> Result<FileStat> {
        let op = Op::Stat {
            path: path.to_owned(),
        };
        match self.call(op).await? {
            Payload::Stat(s) => Ok(s),
            other => Err(self.mismatch(Opcode::Stat, &other).await),
        }
    }

    /// Removes a file.
    pub async fn unlink(&self, path: &str) -> Result<()> {
        let op = Op::Unlink {
            path: path.to_owned(),
        };
        match self.call(op).await? {
            Payload::Unit => Ok(()),
            other => Err(self.mismatch(Opcode::Unlink, &other).await),
        }
    }

    /// Opens an outbound TCP connection.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Handle> {
        let op = Op::Connect {
            host: host.to_owned(),
            port,
        };
        match self.call(op).await? {
            Payload::Handle(h) => Ok(h),
            other => Err(self.mismatch(Opcode::Connect, &other).await),
        }
    }

    /// Sends `data` on a connection.
    pub async fn send(&self, handle: Handle, data: Vec<u8>) -> Result<u64> {
        match self.call(Op::Send { handle, data }).await? {
            Payload::Count(n) => Ok(n),
            other => Err(self.mismatch(Opcode::Send, &other).await),
        }
    }

    /// Receives up to `max` bytes; empty means the peer closed.
    pub async fn recv(&self, handle: Handle, max: u32) -> Result<Vec<u8>> {
        match self.call(Op::Recv { handle, max }).await? {
            Payload::Data(d) if d.len() <= max as usize => Ok(d),
            other => Err(self.mismatch(Opcode::Recv, &other).await),
        }
    }

    /// Reads a value persisted by an earlier invocation.
    pub async fn state_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let op = Op::StateGet {
            key: key.to_owned(),
        };
        match self.call(op).await? {
            Payload::Value(v) => Ok(v),
            other => Err(self.mismatch(Opcode::StateGet, &other).await),
        }
    }

    /// Stores a value for later invocations; `None` deletes it.
    pub async fn state_put(&self, key: &str, value: Option<Vec<u8>>) -> Result<()> {
        let op = Op::StatePut {
            key: key.to_owned(),
            value,
        };
        match self.call(op).await? {
            Payload::Unit => Ok(()),
            other => Err(self.mismatch(Opcode::StatePut, &other).await),
        }
    }

    /// A response with the wrong shape is a host protocol violation.
    async fn mismatch(&self, opcode: Opcode, got: &Payload) -> Error {
        self.shared.shutdown().await;
        Error::Protocol(format!("{} answered with {got:?}", opcode.name()))
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("invocation", &self.shared.invocation)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Locks the pending table, recovering from poisoning.
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Allocates a correlation id not currently outstanding, queues the
    /// request frame and parks a slot, all under one lock. A slot therefore
    /// exists exactly when its frame is on its way to the host.
    fn submit(&self, opcode: Opcode, args: Vec<u8>) -> Result<oneshot::Receiver<Outcome>> {
        let mut guard = self.lock();
        let pending = &mut *guard;
        let Some(outbox) = &pending.outbox else {
            return Err(Error::ChannelClosed);
        };
        let id = loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !pending.slots.contains_key(&id) {
                break id;
            }
        };
        let request = RequestFrame::new(self.invocation, id, opcode as u16, args);
        let frame = to_frame(&request).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        outbox.send(frame).map_err(|_| Error::ChannelClosed)?;
        let (tx, rx) = oneshot::channel();
        pending.slots.insert(id, tx);
        Ok(rx)
    }

    /// Completes the slot for `correlation`. Returns `false` if none exists.
    fn complete(&self, correlation: u64, outcome: Outcome) -> bool {
        let slot = self.lock().slots.remove(&correlation);
        match slot {
            Some(tx) => {
                // The caller may have given up; its slot still had to go.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Marks the channel closed, fails every parked call and shuts the
    /// write half. Idempotent.
    async fn shutdown(&self) {
        let (drained, outbox) = {
            let mut pending = self.lock();
            (std::mem::take(&mut pending.slots), pending.outbox.take())
        };
        // Dropping the senders wakes every waiter with ChannelClosed.
        drop(drained);
        drop(outbox);
        self.writer.close().await;
    }
}

/// Writes queued frames in order until the queue closes or a write fails.
async fn pump(mut queue: mpsc::UnboundedReceiver<Vec<u8>>, shared: Arc<Shared>) {
    while let Some(frame) = queue.recv().await {
        if shared.writer.send_frame(&frame).await.is_err() {
            break;
        }
    }
    shared.shutdown().await;
}

/// Routes responses to their slots until the channel ends.
async fn route(mut reader: FrameReader<BoxRead>, shared: Arc<Shared>) {
    loop {
        match reader.recv::<ResponseFrame>().await {
            Ok(Some(frame)) => {
                if frame.version != PROTOCOL_VERSION {
                    break;
                }
                if !shared.complete(frame.correlation, frame.outcome) {
                    // Unknown or duplicate correlation id.
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    shared.shutdown().await;
}

/// Local shape checks. Policy is the host's job.
fn validate(op: &Op) -> Result<()> {
    if let Some(n) = op.transfer_len() {
        check_len(n)?;
    }
    match op {
        Op::Open { path, .. } | Op::Stat { path } | Op::Unlink { path } => check_path(path),
        Op::Connect { host, port } => {
            if host.is_empty() || host.contains(['\0', ' ', '/']) {
                return Err(Error::InvalidArgument(format!("bad host {host:?}")));
            }
            if *port == 0 {
                return Err(Error::InvalidArgument("port 0".into()));
            }
            Ok(())
        }
        Op::StateGet { key } | Op::StatePut { key, .. } => check_key(key),
        _ => Ok(()),
    }
}

/// Paths must be absolute, NUL-free and bounded.
fn check_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidArgument(format!("path not absolute: {path:?}")));
    }
    if path.contains('\0') || path.len() > MAX_PATH {
        return Err(Error::InvalidArgument("malformed path".into()));
    }
    Ok(())
}

/// Transfer sizes are capped per call.
fn check_len(n: usize) -> Result<()> {
    if n > MAX_IO_CHUNK as usize {
        return Err(Error::InvalidArgument(format!(
            "{n} bytes exceeds the {MAX_IO_CHUNK}-byte chunk limit"
        )));
    }
    Ok(())
}

/// Keys are non-empty and bounded.
fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY || key.contains('\0') {
        return Err(Error::InvalidArgument(format!("bad state key {key:?}")));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use fence_proto::{ErrorInfo, channel};

    use super::*;

    /// Host end of an in-memory channel: handshake already written.
    async fn pair() -> (
        Client,
        FrameReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        FrameWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
    ) {
        let (guest, host) = tokio::io::duplex(4096);
        let (hr, hw) = channel::split(host);
        hw.send(&Hello::new(InvocationId(5))).await.unwrap();
        let client = Client::handshake(guest).await.unwrap();
        (client, hr, hw)
    }

    #[tokio::test]
    async fn responses_reach_their_own_callers_out_of_order() {
        let (client, mut hr, hw) = pair().await;
        assert_eq!(client.invocation(), InvocationId(5));

        let a = tokio::spawn({
            let c = client.clone();
            async move { c.stat("/a").await }
        });
        let b = tokio::spawn({
            let c = client.clone();
            async move { c.stat("/b").await }
        });

        let r1: RequestFrame = hr.recv().await.unwrap().unwrap();
        let r2: RequestFrame = hr.recv().await.unwrap().unwrap();
        assert_ne!(r1.correlation, r2.correlation);

        // Answer in reverse order, each with a size derived from its path.
        for req in [&r2, &r1] {
            let Op::Stat { path } = Op::decode(req.opcode, &req.args).unwrap() else {
                panic!("expected stat");
            };
            let len = if path == "/a" { 1 } else { 2 };
            let stat = FileStat::new(len, fence_proto::FileKind::File, false, None);
            hw.send(&ResponseFrame::new(req.correlation, Outcome::Ok(Payload::Stat(stat))))
                .await
                .unwrap();
        }

        assert_eq!(a.await.unwrap().unwrap().len, 1);
        assert_eq!(b.await.unwrap().unwrap().len, 2);
    }

    #[tokio::test]
    async fn host_errors_surface_per_call() {
        let (client, mut hr, hw) = pair().await;
        let call = tokio::spawn({
            let c = client.clone();
            async move { c.open("/etc/passwd", OpenMode::Read).await }
        });
        let req: RequestFrame = hr.recv().await.unwrap().unwrap();
        hw.send(&ResponseFrame::new(
            req.correlation,
            Outcome::Err(ErrorInfo::denied("no grant")),
        ))
        .await
        .unwrap();

        assert!(matches!(call.await.unwrap(), Err(Error::Denied(_))));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn host_close_fails_blocked_and_later_calls() {
        let (client, mut hr, hw) = pair().await;
        let blocked = tokio::spawn({
            let c = client.clone();
            async move { c.state_get("k").await }
        });
        let _req: RequestFrame = hr.recv().await.unwrap().unwrap();
        hw.close().await;

        let got = tokio::time::timeout(Duration::from_secs(5), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(got, Err(Error::ChannelClosed)));
        assert!(matches!(
            client.state_get("k").await,
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn unknown_correlation_id_tears_down() {
        let (client, mut hr, hw) = pair().await;
        let blocked = tokio::spawn({
            let c = client.clone();
            async move { c.unlink("/x").await }
        });
        let req: RequestFrame = hr.recv().await.unwrap().unwrap();
        hw.send(&ResponseFrame::new(req.correlation + 100, Outcome::Ok(Payload::Unit)))
            .await
            .unwrap();
        assert!(matches!(blocked.await.unwrap(), Err(Error::ChannelClosed)));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn wrong_payload_shape_is_a_protocol_error() {
        let (client, mut hr, hw) = pair().await;
        let call = tokio::spawn({
            let c = client.clone();
            async move { c.open("/data/x", OpenMode::Read).await }
        });
        let req: RequestFrame = hr.recv().await.unwrap().unwrap();
        hw.send(&ResponseFrame::new(req.correlation, Outcome::Ok(Payload::Unit)))
            .await
            .unwrap();
        assert!(matches!(call.await.unwrap(), Err(Error::Protocol(_))));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn shape_errors_never_reach_the_wire() {
        let (client, _hr, _hw) = pair().await;
        assert!(matches!(
            client.open("relative/path", OpenMode::Read).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            client.connect("api.example.com", 0).await,
            Err(Error::InvalidArgument(_))
        ));
        let big = vec![0u8; MAX_IO_CHUNK as usize + 1];
        assert!(matches!(
            client.write(Handle(1), big).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(client.shared.lock().slots.is_empty());
    }

    #[tokio::test]
    async fn cancelled_call_still_sends_a_whole_frame() {
        let (guest, host) = tokio::io::duplex(64);
        let (mut hr, hw) = channel::split(host);
        hw.send(&Hello::new(InvocationId(5))).await.unwrap();
        let client = Client::handshake(guest).await.unwrap();

        let value = vec![7u8; 512 * 1024];
        let put = client.state_put("k", Some(value));
        assert!(tokio::time::timeout(Duration::from_micros(1), put).await.is_err());

        let next = tokio::spawn({
            let c = client.clone();
            async move { c.stat("/data/f").await }
        });

        let first: RequestFrame = hr.recv().await.unwrap().unwrap();
        let Op::StatePut { value: Some(v), .. } = Op::decode(first.opcode, &first.args).unwrap() else {
            panic!("expected state_put");
        };
        assert_eq!(v.len(), 512 * 1024);
        let second: RequestFrame = hr.recv().await.unwrap().unwrap();
        assert!(matches!(
            Op::decode(second.opcode, &second.args).unwrap(),
            Op::Stat { .. }
        ));

        // The abandoned call's answer is absorbed, not treated as unknown.
        hw.send(&ResponseFrame::new(first.correlation, Outcome::Ok(Payload::Unit)))
            .await
            .unwrap();
        let stat = FileStat::new(3, fence_proto::FileKind::File, false, None);
        hw.send(&ResponseFrame::new(second.correlation, Outcome::Ok(Payload::Stat(stat))))
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), next)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap().len, 3);
        assert!(!client.is_closed());
        assert!(client.shared.lock().slots.is_empty());
    }

    #[tokio::test]
    async fn version_mismatch_is_refused() {
        let (guest, host) = tokio::io::duplex(1024);
        let (_hr, hw) = channel::split(host);
        let mut hello = Hello::new(InvocationId(1));
        hello.version = PROTOCOL_VERSION + 1;
        hw.send(&hello).await.unwrap();
        assert!(matches!(
            Client::handshake(guest).await,
            Err(Error::Protocol(_))
        ));
    }
}
