//! End-to-end tests: the real guest client against the real dispatcher over
//! an in-memory duplex stream.

#![allow(clippy::unwrap_used, missing_docs)]

use std::path::Path;
use std::time::Duration;

use fence::{CloseReason, Host, HostConfig, Manifest, Summary};
use fence_guest::{Client, Error, OpenMode};
use fence_proto::channel::{self, FrameReader, FrameWriter};
use fence_proto::{
    ErrorCode, Hello, MAX_IO_CHUNK, Op, Outcome, PROTOCOL_VERSION, Payload, RequestFrame,
    ResponseFrame,
};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Upper bound for anything that should happen "promptly".
const PROMPT: Duration = Duration::from_secs(2);

fn host(root: &Path) -> Host {
    Host::new(HostConfig::new(root).grace(Duration::from_millis(100))).unwrap()
}

fn serve(host: &Host, manifest: &str) -> (DuplexStream, JoinHandle<Summary>) {
    let manifest = Manifest::from_json(manifest).unwrap();
    let (guest, host_end) = tokio::io::duplex(256 * 1024);
    let host = host.clone();
    let task = tokio::spawn(async move { host.invoke(&manifest, host_end).await.unwrap() });
    (guest, task)
}

async fn start(host: &Host, manifest: &str) -> (Client, JoinHandle<Summary>) {
    let (guest, task) = serve(host, manifest);
    (Client::handshake(guest).await.unwrap(), task)
}

/// A TCP peer that accepts connections and never writes.
async fn silent_peer() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((s, _)) = listener.accept().await {
            held.push(s);
        }
    });
    (port, task)
}

fn data_root() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("data")).unwrap();
    std::fs::create_dir_all(dir.path().join("etc")).unwrap();
    std::fs::write(dir.path().join("data/file.txt"), b"granted contents").unwrap();
    std::fs::write(dir.path().join("etc/passwd"), b"root:x:0:0").unwrap();
    dir
}

#[tokio::test]
async fn read_inside_grant_and_denied_outside() {
    let dir = data_root();
    let host = host(dir.path());
    let (client, task) = start(
        &host,
        r#"{ "name": "reader", "grants": [{ "op": "read", "prefix": "/data/" }] }"#,
    )
    .await;

    let h = client.open("/data/file.txt", OpenMode::Read).await.unwrap();
    assert_eq!(client.read(h, 1024).await.unwrap(), b"granted contents");
    assert!(client.read(h, 1024).await.unwrap().is_empty());
    client.close(h).await.unwrap();

    let err = client.open("/etc/passwd", OpenMode::Read).await.unwrap_err();
    assert!(matches!(err, Error::Denied(_)), "{err}");
    let err = client.open("/data/../etc/passwd", OpenMode::Read).await.unwrap_err();
    assert!(matches!(err, Error::Denied(_)), "{err}");
    assert!(matches!(client.stat("/etc/passwd").await, Err(Error::Denied(_))));

    // Denial is per request: the channel keeps working.
    let st = client.stat("/data/file.txt").await.unwrap();
    assert_eq!(st.len, 16);

    client.disconnect().await;
    let summary = task.await.unwrap();
    assert_eq!(summary.reason, CloseReason::Completed);
    assert_eq!((summary.served, summary.denied), (5, 3));
}

#[tokio::test]
async fn denied_write_has_no_side_effect() {
    let dir = data_root();
    let host = host(dir.path());
    let (client, _task) = start(
        &host,
        r#"{ "name": "w", "grants": [{ "op": "read", "prefix": "/data" }] }"#,
    )
    .await;

    for mode in [OpenMode::Write, OpenMode::Append, OpenMode::CreateNew] {
        let err = client.open("/data/file.txt", mode).await.unwrap_err();
        assert!(matches!(err, Error::Denied(_)));
    }
    assert!(matches!(client.unlink("/data/file.txt").await, Err(Error::Denied(_))));
    assert_eq!(
        std::fs::read(dir.path().join("data/file.txt")).unwrap(),
        b"granted contents"
    );
}

#[tokio::test]
async fn connect_to_granted_endpoint_only() {
    let (port, _peer) = silent_peer().await;
    let dir = tempfile::tempdir().unwrap();
    let host = host(dir.path());
    let manifest = format!(
        r#"{{ "name": "net", "grants": [{{ "op": "connect", "endpoint": "127.0.0.1:{port}" }}] }}"#
    );
    let (client, _task) = start(&host, &manifest).await;

    let h = client.connect("127.0.0.1", port).await.unwrap();
    assert_eq!(client.send(h, b"hello".to_vec()).await.unwrap(), 5);

    // Refused by policy before any name resolution happens.
    let err = client.connect("evil.example.com", 443).await.unwrap_err();
    assert!(matches!(err, Error::Denied(_)), "{err}");
    let err = client.connect("127.0.0.1", port.wrapping_add(1)).await.unwrap_err();
    assert!(matches!(err, Error::Denied(_)), "{err}");
}

#[tokio::test]
async fn quota_admits_at_most_n_concurrent_handles() {
    let dir = data_root();
    let host = host(dir.path());
    let (client, _task) = start(
        &host,
        r#"{ "name": "q", "grants": [{ "op": "read", "prefix": "/data", "max_open": 2 }] }"#,
    )
    .await;

    let (a, b, c) = tokio::join!(
        client.open("/data/file.txt", OpenMode::Read),
        client.open("/data/file.txt", OpenMode::Read),
        client.open("/data/file.txt", OpenMode::Read),
    );
    let results = [a, b, c];
    let opened: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(opened.len(), 2);
    assert!(results.iter().any(|r| matches!(r, Err(Error::Denied(_)))));

    // Closing returns the slot.
    client.close(opened[0]).await.unwrap();
    client.open("/data/file.txt", OpenMode::Read).await.unwrap();
    assert!(matches!(
        client.open("/data/file.txt", OpenMode::Read).await,
        Err(Error::Denied(_))
    ));
}

#[tokio::test]
async fn failed_opens_consume_no_quota() {
    let dir = data_root();
    let host = host(dir.path());
    let (client, _task) = start(
        &host,
        r#"{ "name": "q", "grants": [{ "op": "read", "prefix": "/data", "max_open": 1 }] }"#,
    )
    .await;

    for _ in 0..3 {
        let err = client.open("/data/missing", OpenMode::Read).await.unwrap_err();
        assert!(matches!(err, Error::Failed { code: ErrorCode::NotFound, .. }), "{err}");
    }
    client.open("/data/file.txt", OpenMode::Read).await.unwrap();
}

#[tokio::test]
async fn out_of_order_responses_reach_their_callers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = data_root();
    let host = host(dir.path());
    let manifest = format!(
        r#"{{ "name": "mux", "grants": [
            {{ "op": "connect", "endpoint": "127.0.0.1:{port}" }},
            {{ "op": "read", "prefix": "/data" }}
        ] }}"#
    );
    let (client, _task) = start(&host, &manifest).await;

    let h = client.connect("127.0.0.1", port).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    // The recv goes out first but can only finish after the stat did.
    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.recv(h, 64).await })
    };
    tokio::task::yield_now().await;
    let st = client.stat("/data/file.txt").await.unwrap();
    assert_eq!(st.len, 16);
    assert!(!slow.is_finished());

    tokio::io::AsyncWriteExt::write_all(&mut peer, b"late").await.unwrap();
    assert_eq!(slow.await.unwrap().unwrap(), b"late");
}

#[tokio::test]
async fn deadline_fails_blocked_and_later_calls() {
    let (port, _peer) = silent_peer().await;
    let dir = tempfile::tempdir().unwrap();
    let host = host(dir.path());
    let manifest = format!(
        r#"{{ "name": "slow", "timeout_ms": 200,
             "grants": [{{ "op": "connect", "endpoint": "127.0.0.1:{port}" }}] }}"#
    );
    let (client, task) = start(&host, &manifest).await;
    let h = client.connect("127.0.0.1", port).await.unwrap();

    let blocked = tokio::time::timeout(PROMPT, client.recv(h, 16)).await.unwrap();
    assert!(matches!(blocked, Err(Error::ChannelClosed)));
    assert!(matches!(client.recv(h, 16).await, Err(Error::ChannelClosed)));
    assert!(client.is_closed());

    let summary = task.await.unwrap();
    assert_eq!(summary.reason, CloseReason::Deadline);
    assert_eq!(summary.served, 1);
}

#[tokio::test]
async fn shutdown_ends_running_invocations() {
    let dir = tempfile::tempdir().unwrap();
    let host = host(dir.path());
    let (client, task) = start(&host, r#"{ "name": "idle" }"#).await;
    host.shutdown();
    let summary = tokio::time::timeout(PROMPT, task).await.unwrap().unwrap();
    assert_eq!(summary.reason, CloseReason::Shutdown);
    let got = tokio::time::timeout(PROMPT, client.state_get("k")).await.unwrap();
    assert!(matches!(got, Err(Error::ChannelClosed)), "{got:?}");
    assert!(client.is_closed());
}

#[tokio::test]
async fn state_survives_across_invocations() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let host = Host::new(HostConfig::new(dir.path()).state_file(&state)).unwrap();
    let manifest = r#"{ "name": "counter", "grants": [
        { "op": "state_read" }, { "op": "state_write", "prefix": "count" }
    ] }"#;

    let (client, task) = start(&host, manifest).await;
    assert_eq!(client.state_get("count").await.unwrap(), None);
    client.state_put("count", Some(vec![1])).await.unwrap();
    assert!(matches!(client.state_put("other", Some(vec![1])).await, Err(Error::Denied(_))));
    client.disconnect().await;
    task.await.unwrap();

    let (client, _task) = start(&host, manifest).await;
    assert_eq!(client.state_get("count").await.unwrap(), Some(vec![1]));
    assert!(state.exists());

    // Another function never sees the first one's keys.
    let (other, _task) = start(&host, r#"{ "name": "other", "grants": [{ "op": "state_read" }] }"#).await;
    assert_eq!(other.state_get("count").await.unwrap(), None);
}

/// A channel driven by hand instead of through the client.
struct Raw {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
    hello: Hello,
    task: JoinHandle<Summary>,
}

impl Raw {
    async fn start(host: &Host, manifest: &str) -> Self {
        let (guest, task) = serve(host, manifest);
        let (mut reader, writer) = channel::split(guest);
        let hello: Hello = reader.recv().await.unwrap().unwrap();
        assert_eq!(hello.version, PROTOCOL_VERSION);
        Self {
            reader,
            writer,
            hello,
            task,
        }
    }

    fn frame(&self, correlation: u64, op: &Op) -> RequestFrame {
        RequestFrame::new(
            self.hello.invocation,
            correlation,
            op.opcode() as u16,
            op.encode_args().unwrap(),
        )
    }

    async fn next(&mut self) -> Option<ResponseFrame> {
        tokio::time::timeout(PROMPT, self.reader.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Expects a `Protocol` answer for `correlation`, then the close.
    async fn expect_fatal(mut self, correlation: u64) {
        let resp = self.next().await.unwrap();
        assert_eq!(resp.correlation, correlation);
        assert!(matches!(resp.outcome, Outcome::Err(ref e) if e.code == ErrorCode::Protocol));
        assert!(self.next().await.is_none());
        let summary = self.task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::ProtocolViolation);
    }
}

fn stat_op() -> Op {
    Op::Stat {
        path: "/data/file.txt".into(),
    }
}

const STAT_ONLY: &str = r#"{ "name": "raw", "grants": [{ "op": "read", "prefix": "/data" }] }"#;

#[tokio::test]
async fn valid_raw_request_is_answered() {
    let dir = data_root();
    let host = host(dir.path());
    let mut raw = Raw::start(&host, STAT_ONLY).await;
    let frame = raw.frame(7, &stat_op());
    raw.writer.send(&frame).await.unwrap();
    let resp = raw.next().await.unwrap();
    assert_eq!(resp.correlation, 7);
    assert_eq!(resp.version, PROTOCOL_VERSION);
    assert!(matches!(resp.outcome, Outcome::Ok(_)));
}

#[tokio::test]
async fn unknown_version_is_fatal() {
    let dir = data_root();
    let raw = Raw::start(&host(dir.path()), STAT_ONLY).await;
    let mut frame = raw.frame(1, &stat_op());
    frame.version = PROTOCOL_VERSION + 1;
    raw.writer.send(&frame).await.unwrap();
    raw.expect_fatal(1).await;
}

#[tokio::test]
async fn unknown_opcode_is_fatal() {
    let dir = data_root();
    let raw = Raw::start(&host(dir.path()), STAT_ONLY).await;
    let mut frame = raw.frame(2, &stat_op());
    frame.opcode = 999;
    raw.writer.send(&frame).await.unwrap();
    raw.expect_fatal(2).await;
}

#[tokio::test]
async fn trailing_argument_bytes_are_fatal() {
    let dir = data_root();
    let raw = Raw::start(&host(dir.path()), STAT_ONLY).await;
    let mut frame = raw.frame(3, &stat_op());
    frame.args.push(0);
    raw.writer.send(&frame).await.unwrap();
    raw.expect_fatal(3).await;
}

#[tokio::test]
async fn foreign_invocation_id_is_fatal() {
    let dir = data_root();
    let raw = Raw::start(&host(dir.path()), STAT_ONLY).await;
    let mut frame = raw.frame(4, &stat_op());
    frame.invocation.0 ^= 1;
    raw.writer.send(&frame).await.unwrap();
    raw.expect_fatal(4).await;
}

#[tokio::test]
async fn oversized_transfers_are_fatal() {
    let dir = data_root();
    let host = host(dir.path());
    let oversized = [
        Op::Write {
            handle: fence_proto::Handle(1),
            data: vec![0; 4 * 1024 * 1024],
        },
        Op::Read {
            handle: fence_proto::Handle(1),
            len: u32::MAX,
        },
        Op::Recv {
            handle: fence_proto::Handle(1),
            max: MAX_IO_CHUNK + 1,
        },
    ];
    for op in oversized {
        let raw = Raw::start(&host, STAT_ONLY).await;
        let frame = raw.frame(5, &op);
        raw.writer.send(&frame).await.unwrap();
        raw.expect_fatal(5).await;
    }
    // Nothing reached the filesystem.
    let entries = std::fs::read_dir(dir.path().join("data")).unwrap().count();
    assert_eq!(entries, 1);
}

#[tokio::test]
async fn duplicate_in_flight_id_closes_without_answer() {
    let (port, _peer) = silent_peer().await;
    let dir = tempfile::tempdir().unwrap();
    let manifest = format!(
        r#"{{ "name": "dup", "grants": [{{ "op": "connect", "endpoint": "127.0.0.1:{port}" }}] }}"#
    );
    let mut raw = Raw::start(&host(dir.path()), &manifest).await;

    let connect = raw.frame(
        1,
        &Op::Connect {
            host: "127.0.0.1".into(),
            port,
        },
    );
    raw.writer.send(&connect).await.unwrap();
    let Outcome::Ok(Payload::Handle(h)) = raw.next().await.unwrap().outcome else {
        panic!("connect failed");
    };

    // Correlation id 1 is free again; 9 stays in flight on a silent peer.
    let recv = raw.frame(9, &Op::Recv { handle: h, max: 16 });
    raw.writer.send(&recv).await.unwrap();
    raw.writer.send(&recv).await.unwrap();

    assert!(raw.next().await.is_none());
    let summary = raw.task.await.unwrap();
    assert_eq!(summary.reason, CloseReason::ProtocolViolation);
}

#[tokio::test]
async fn garbage_frame_closes_channel() {
    let dir = data_root();
    let mut raw = Raw::start(&host(dir.path()), STAT_ONLY).await;
    raw.writer.send(&vec![0xffu8; 3]).await.unwrap();
    assert!(raw.next().await.is_none());
    assert_eq!(raw.task.await.unwrap().reason, CloseReason::ProtocolViolation);
}

#[tokio::test]
async fn guest_disconnect_releases_handles() {
    let dir = data_root();
    let host = host(dir.path());
    let (client, task) = start(
        &host,
        r#"{ "name": "bye", "grants": [{ "op": "read", "prefix": "/data", "max_open": 1 }] }"#,
    )
    .await;
    client.open("/data/file.txt", OpenMode::Read).await.unwrap();
    drop(client);
    let summary = tokio::time::timeout(PROMPT, task).await.unwrap().unwrap();
    assert_eq!(summary.reason, CloseReason::Completed);
}
