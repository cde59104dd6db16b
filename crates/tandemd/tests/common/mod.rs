#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tandem_common::wire::GatewayAction;
use tandem_common::{AttachmentKind, MessageRef, ParticipantId};
use tandemd::config::ServerConfig;
use tandemd::metrics::HealthState;
use tandemd::registry::MatchRegistry;
use tandemd::server::ServerState;
use tandemd::store::SnapshotStore;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

pub const MONITOR_CHAT: i64 = -100_200;
pub const ADMIN: i64 = 900;

pub fn test_config(listen: SocketAddr, state_file: &Path) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        monitor_chat: MONITOR_CHAT,
        admin_ids: vec![ParticipantId(ADMIN)],
        cooldown_ms: 1300,
        state_file: state_file.to_path_buf(),
        max_gateways: 8,
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    pub state_file: PathBuf,
    _dir: tempfile::TempDir,
}

pub async fn start_server() -> TestServer {
    start_server_with(|_| {}).await
}

pub async fn start_server_with(adjust: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("anon_state.json");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr, &state_file);
    adjust(&mut config);

    let registry = Arc::new(MatchRegistry::open(
        SnapshotStore::new(state_file.clone()),
        config.cooldown(),
    ));
    let state = Arc::new(ServerState::new(config, registry, HealthState::new()));

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = tandemd::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        state,
        state_file,
        _dir: dir,
    }
}

/// A fake platform adapter speaking the line protocol.
pub struct TestGateway {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_ref: u64,
}

impl TestGateway {
    pub async fn connect(addr: &SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let gateway = Self {
            reader: BufReader::new(reader),
            writer,
            next_ref: 1,
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gateway
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n").await.unwrap();
        }
    }

    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    pub async fn send_text(&mut self, from: i64, text: &str) -> MessageRef {
        let message_ref = self.next_message_ref();
        let line = serde_json::json!({
            "type": "message",
            "from": from,
            "ref": message_ref.0,
            "text": text,
        });
        self.send_raw(&line.to_string()).await;
        message_ref
    }

    pub async fn send_media(
        &mut self,
        from: i64,
        kind: AttachmentKind,
        caption: Option<&str>,
    ) -> MessageRef {
        let message_ref = self.next_message_ref();
        let mut line = serde_json::json!({
            "type": "message",
            "from": from,
            "ref": message_ref.0,
            "attachment": kind,
        });
        if let Some(caption) = caption {
            line["caption"] = serde_json::Value::from(caption);
        }
        self.send_raw(&line.to_string()).await;
        message_ref
    }

    pub async fn recv_line(&mut self) -> String {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timeout waiting for action")
            .unwrap();
        assert!(n > 0, "gateway connection closed");
        line
    }

    pub async fn recv_action(&mut self) -> GatewayAction {
        let line = self.recv_line().await;
        serde_json::from_str(&line).unwrap_or_else(|e| panic!("bad action {line:?}: {e}"))
    }

    /// Read actions until one satisfies `pred`, returning it and its raw line.
    pub async fn recv_matching(
        &mut self,
        mut pred: impl FnMut(&GatewayAction) -> bool,
    ) -> (GatewayAction, String) {
        loop {
            let line = self.recv_line().await;
            let action: GatewayAction = serde_json::from_str(&line).unwrap();
            if pred(&action) {
                return (action, line);
            }
        }
    }

    pub async fn report_failure(&mut self, kind: &str, message_ref: MessageRef, reason: &str) {
        let line = serde_json::json!({
            "type": "delivery_failed",
            "kind": kind,
            "ref": message_ref.0,
            "reason": reason,
        });
        self.send_raw(&line.to_string()).await;
    }

    pub async fn expect_text(&mut self, to: i64, text: &str) {
        self.recv_matching(|a| {
            matches!(a, GatewayAction::DeliverText { to: t, text: body }
                if *t == ParticipantId(to) && body == text)
        })
        .await;
    }

    /// Collect every action that arrives within `window`.
    pub async fn drain(&mut self, window: Duration) -> Vec<GatewayAction> {
        let mut actions = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let mut line = String::new();
            match tokio::time::timeout_at(deadline, self.reader.read_line(&mut line)).await {
                Ok(Ok(n)) if n > 0 => actions.push(serde_json::from_str(&line).unwrap()),
                _ => return actions,
            }
        }
    }

    fn next_message_ref(&mut self) -> MessageRef {
        let r = MessageRef(self.next_ref);
        self.next_ref += 1;
        r
    }
}
