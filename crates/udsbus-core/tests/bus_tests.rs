//! Integration tests for whole participants sharing one socket.
//!
//! Several participants run inside one test process, told apart by explicit
//! identities. A participant whose process "dies" runs on its own runtime,
//! which is shut down to close all of its sockets at once.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use udsbus::ipc::{handshake, Frame, FrameCodec};
use udsbus::{Inbound, Ipc, Json, LogLevel, Message, Role, SendOptions, SessionInfo};

const SECRET: &str = "integration-secret";
const STEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Chat {
    from: u64,
    text: String,
}

struct Participant {
    ipc: Ipc,
    inbox: mpsc::UnboundedReceiver<Chat>,
}

impl Participant {
    /// Next chat message, or `None` if nothing arrives within `wait`.
    async fn recv(&mut self, wait: Duration) -> Option<Chat> {
        tokio::time::timeout(wait, self.inbox.recv()).await.ok().flatten()
    }
}

fn socket_path(dir: &TempDir) -> PathBuf {
    dir.path().join("bus.sock")
}

fn build(path: &Path, identity: u64) -> Participant {
    let (tx, inbox) = mpsc::unbounded_channel();
    let ipc = Ipc::builder(path, SECRET)
        .identity(identity)
        .heartbeat_step(STEP)
        .register::<Json<Chat>>()
        .on_message(move |msg: Inbound| {
            if let Ok(Json(chat)) = msg.downcast::<Json<Chat>>() {
                let _ = tx.send(chat);
            }
        })
        .build()
        .unwrap();
    Participant { ipc, inbox }
}

fn start(path: &Path, identity: u64) -> Participant {
    let participant = build(path, identity);
    let runner = participant.ipc.clone();
    tokio::spawn(async move { runner.run().await });
    participant
}

async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// The participant currently hosting the broker, once exactly one does and
/// it has registered `expected` peers.
async fn settled_broker<'a>(participants: &[&'a Participant], expected: usize) -> &'a Ipc {
    let settled = eventually(Duration::from_secs(10), || async {
        let brokers: Vec<&Participant> = participants
            .iter()
            .copied()
            .filter(|p| p.ipc.status().role == Role::Broker)
            .collect();
        if brokers.len() != 1 {
            return false;
        }
        let all_connected = participants.iter().all(|p| p.ipc.status().connected);
        all_connected && brokers[0].ipc.peers().await.len() == expected
    })
    .await;
    assert!(settled, "participants never settled on one broker");

    participants
        .iter()
        .copied()
        .find(|p| p.ipc.status().role == Role::Broker)
        .map(|p| &p.ipc)
        .unwrap()
}

/// Handshake by hand and return the raw connection halves.
async fn raw_client(path: &Path, identity: u64) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
    let stream = UnixStream::connect(path).await.unwrap();
    let (r, mut w) = stream.into_split();
    let mut r = BufReader::new(r);
    let mut frame = Frame::new();
    handshake::initiate(
        &FrameCodec::default(),
        &mut r,
        &mut w,
        &mut frame,
        identity,
        SECRET,
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    (r, w)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_election_yields_exactly_one_broker() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);

    let participants: Vec<Participant> = (1..=5).map(|id| start(&path, id)).collect();
    let refs: Vec<&Participant> = participants.iter().collect();

    let broker = settled_broker(&refs, 5).await;
    assert_eq!(broker.peers().await, vec![1, 2, 3, 4, 5]);

    // Every session pings the broker, so nobody is anywhere near the limit.
    let info = broker.peer_info().await;
    assert_eq!(info.iter().map(|p| p.identity).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    assert!(info.iter().all(|p| p.silent_for < STEP * 2));

    let clients = participants
        .iter()
        .filter(|p| p.ipc.status().role == Role::Client)
        .count();
    assert_eq!(clients, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broadcast_reaches_others_but_not_sender() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);

    let mut a = start(&path, 1);
    let mut b = start(&path, 2);
    let mut c = start(&path, 3);
    settled_broker(&[&a, &b, &c], 3).await;

    let hello = Chat {
        from: 1,
        text: "hello".to_string(),
    };
    a.ipc.send_and_wait(Json(hello.clone())).await.unwrap();

    assert_eq!(b.recv(Duration::from_secs(2)).await, Some(hello.clone()));
    assert_eq!(c.recv(Duration::from_secs(2)).await, Some(hello));
    assert_eq!(a.recv(Duration::from_millis(300)).await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_self_receive_reaches_sender_too() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);

    let mut a = start(&path, 1);
    let mut b = start(&path, 2);
    settled_broker(&[&a, &b], 2).await;

    let echo = Chat {
        from: 1,
        text: "echo".to_string(),
    };
    a.ipc
        .send_with(
            Json(echo.clone()),
            SendOptions {
                self_receive: true,
                wait: true,
            },
        )
        .await
        .unwrap();

    assert_eq!(a.recv(Duration::from_secs(2)).await, Some(echo.clone()));
    assert_eq!(b.recv(Duration::from_secs(2)).await, Some(echo));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_compressed_message_is_delivered() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);

    let build_compressed = |identity: u64| {
        let (tx, inbox) = mpsc::unbounded_channel();
        let ipc = Ipc::builder(&path, SECRET)
            .identity(identity)
            .heartbeat_step(STEP)
            .compression(true)
            .compression_threshold(1024)
            .register::<Json<Chat>>()
            .on_message(move |msg: Inbound| {
                if let Some(Json(chat)) = msg.downcast_ref::<Json<Chat>>() {
                    let _ = tx.send(chat.clone());
                }
            })
            .build()
            .unwrap();
        let runner = ipc.clone();
        tokio::spawn(async move { runner.run().await });
        Participant { ipc, inbox }
    };

    let a = build_compressed(1);
    let mut b = build_compressed(2);
    settled_broker(&[&a, &b], 2).await;

    let text: String = (0..100_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    let big = Chat { from: 1, text };
    a.ipc.send_and_wait(Json(big.clone())).await.unwrap();

    assert_eq!(b.recv(Duration::from_secs(3)).await, Some(big));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_peer_is_pruned_by_heartbeat() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);

    let host = start(&path, 1);
    let broker = settled_broker(&[&host], 1).await;

    let (_reader, _writer) = raw_client(&path, 900).await;
    assert!(broker.peers().await.contains(&900));

    // The raw client never pings
    let pruned = eventually(STEP * 10, || async { !broker.peers().await.contains(&900) }).await;
    assert!(pruned, "silent peer was not pruned");
    assert!(host.ipc.status().connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_broker_ends_session_and_rearbitrates() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);

    // A broker that completes handshakes and then never sends a byte.
    let listener = tokio::net::UnixListener::bind(&path).unwrap();
    let sessions = Arc::new(AtomicU64::new(0));
    let accepted = Arc::clone(&sessions);
    let mute = tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let mut r = BufReader::new(r);
            let mut frame = Frame::new();
            let joined = handshake::accept(
                &FrameCodec::default(),
                &mut r,
                &mut w,
                &mut frame,
                SECRET,
                Duration::from_secs(1),
            )
            .await;
            if joined.is_ok() {
                accepted.fetch_add(1, Ordering::SeqCst);
                held.push((r, w));
            }
        }
    });

    let p = start(&path, 7);
    let first = eventually(Duration::from_secs(5), || async {
        p.ipc.status().connected && p.ipc.status().session_count == 1
    })
    .await;
    assert!(first, "participant never joined the mute broker");
    assert_eq!(p.ipc.status().role, Role::Client);

    // Still inside the 2-step window
    tokio::time::sleep(STEP).await;
    assert_eq!(p.ipc.status().session_count, 1);

    let redialed = eventually(STEP * 6, || async { p.ipc.status().session_count >= 2 }).await;
    assert!(redialed, "session outlived a silent broker");
    assert!(sessions.load(Ordering::SeqCst) >= 2);
    assert!(p.ipc.peers().await.is_empty());

    mute.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wrong_secret_never_joins() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);

    let host = start(&path, 1);
    let broker = settled_broker(&[&host], 1).await;

    let intruder = Ipc::builder(&path, "wrong-secret")
        .identity(66)
        .heartbeat_step(STEP)
        .build()
        .unwrap();
    let runner = intruder.clone();
    tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.peers().await, vec![1]);
    assert!(!intruder.status().connected);
    assert_eq!(intruder.status().session_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_undecodable_payload_is_dropped_and_session_survives() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);

    let mut host = start(&path, 1);
    settled_broker(&[&host], 1).await;

    let (_reader, mut writer) = raw_client(&path, 901).await;
    let codec = FrameCodec::default();
    let key = <Json<Chat>>::type_key();

    let bad = Frame::message(key, b"definitely not json");
    codec
        .write_frame(&mut writer, &bad, &mut BytesMut::new())
        .await
        .unwrap();
    let unknown = Frame::message("nobody.registered.this", b"{}");
    codec
        .write_frame(&mut writer, &unknown, &mut BytesMut::new())
        .await
        .unwrap();

    let good = Chat {
        from: 901,
        text: "valid".to_string(),
    };
    let payload = serde_json::to_vec(&good).unwrap();
    codec
        .write_frame(&mut writer, &Frame::message(key, &payload), &mut BytesMut::new())
        .await
        .unwrap();

    assert_eq!(host.recv(Duration::from_secs(2)).await, Some(good));
    assert!(host.ipc.status().connected);
    assert_eq!(host.ipc.status().session_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hook_and_log_sink_observe_session() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);

    let sessions: Arc<Mutex<Vec<SessionInfo>>> = Arc::new(Mutex::new(Vec::new()));
    let logs: Arc<Mutex<Vec<(LogLevel, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let hook_calls = Arc::new(AtomicU64::new(0));

    let ipc = {
        let sessions = sessions.clone();
        let logs = logs.clone();
        let hook_calls = hook_calls.clone();
        Ipc::builder(&path, SECRET)
            .identity(7)
            .heartbeat_step(STEP)
            .after_handshake(move |ipc: Ipc, info: SessionInfo| {
                assert_eq!(ipc.status().identity, 7);
                hook_calls.fetch_add(1, Ordering::SeqCst);
                sessions.lock().unwrap().push(info);
            })
            .on_log(move |level: LogLevel, ts: i64, msg: &str| {
                assert!(ts > 0);
                logs.lock().unwrap().push((level, msg.to_string()));
            })
            .build()
            .unwrap()
    };
    let runner = ipc.clone();
    tokio::spawn(async move { runner.run().await });

    let hooked = eventually(Duration::from_secs(5), || async {
        hook_calls.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(hooked, "hook never ran");

    let info = sessions.lock().unwrap()[0];
    assert_eq!(info.identity, 7);
    assert_eq!(info.session_id, 1);
    assert!(info.broker);

    let logs = logs.lock().unwrap();
    assert!(logs
        .iter()
        .any(|(level, msg)| *level == LogLevel::Info && msg.contains("Became broker")));
}

#[test]
fn test_broker_failover_after_process_death() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);

    // Process X: its own runtime, so it can be killed as a whole.
    let x_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let x = build(&path, 1);
    let x_runner = x.ipc.clone();
    x_runtime.spawn(async move { x_runner.run().await });

    // Process Y.
    let y_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    y_runtime.block_on(async {
        let x_is_broker = eventually(Duration::from_secs(5), || async {
            x.ipc.status().role == Role::Broker && x.ipc.status().connected
        })
        .await;
        assert!(x_is_broker, "X never became broker");

        let y = start(&path, 2);
        let y_joined = eventually(Duration::from_secs(5), || async {
            y.ipc.status().role == Role::Client && x.ipc.peers().await.contains(&2)
        })
        .await;
        assert!(y_joined, "Y never joined X");

        // Kill X. Its socket file stays behind.
        x_runtime.shutdown_background();
        assert!(path.exists());

        let y_took_over = eventually(Duration::from_secs(10), || async {
            y.ipc.status().role == Role::Broker
                && y.ipc.status().connected
                && y.ipc.peers().await == vec![2]
        })
        .await;
        assert!(y_took_over, "Y never became the new broker");
        assert!(y.ipc.status().session_count >= 2);
    });
}
