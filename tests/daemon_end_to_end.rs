//! ---
//! upw_section: "15-testing-qa-runbook"
//! upw_subsection: "integration-tests"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "End-to-end daemon runs against a fake inventory channel."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use upwatch_common::AppConfig;
use upwatch_core::{Daemon, DaemonHandle, DaemonStatus};
use upwatch_remote::MemoryRemote;

#[derive(Default)]
struct Inventory {
    installed: BTreeMap<String, String>,
    published: BTreeMap<String, Vec<String>>,
    identity_complete: bool,
    refuse_subscriptions: bool,
}

/// Line-protocol inventory channel served from memory.
struct FakeChannel {
    addr: SocketAddr,
    state: Arc<Mutex<Inventory>>,
    events: broadcast::Sender<String>,
}

impl FakeChannel {
    async fn start(inventory: Inventory) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(inventory));
        let (events, _) = broadcast::channel(64);
        let server_state = state.clone();
        let server_events = events.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, server_state.clone(), server_events.clone()));
            }
        });
        Self {
            addr,
            state,
            events,
        }
    }

    fn install(&self, service: &str, version: &str) {
        self.state
            .lock()
            .unwrap()
            .installed
            .insert(service.to_owned(), version.to_owned());
    }

    fn publish(&self, service: &str, versions: &[&str]) {
        self.state.lock().unwrap().published.insert(
            service.to_owned(),
            versions.iter().map(|v| (*v).to_owned()).collect(),
        );
    }

    fn complete_identity(&self) {
        self.state.lock().unwrap().identity_complete = true;
    }

    fn emit(&self, event: Value) {
        let _ = self.events.send(event.to_string());
    }

    fn subscribers(&self) -> usize {
        self.events.receiver_count()
    }

    fn config(&self, poll_interval: Duration) -> AppConfig {
        let mut config = AppConfig::default();
        config.inventory.host = self.addr.ip().to_string();
        config.inventory.port = self.addr.port();
        config.inventory.request_timeout = Duration::from_secs(1);
        config.reconcile.poll_interval = poll_interval;
        config.listener.base_delay = Duration::from_millis(10);
        config.listener.max_delay = Duration::from_millis(50);
        config.listener.jitter = Duration::ZERO;
        config.startup.escalate_after = 2;
        config
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<Inventory>>, events: broadcast::Sender<String>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
        return;
    }
    let request: Value = serde_json::from_str(line.trim()).unwrap();
    let command = request["command"].as_str().unwrap_or_default().to_owned();

    let reply = {
        let inventory = state.lock().unwrap();
        match command.as_str() {
            "get_installed_services" => {
                let services: Vec<Value> = inventory
                    .installed
                    .iter()
                    .map(|(name, version)| json!({"name": name, "version": version}))
                    .collect();
                json!({"status": "ok", "data": services})
            }
            "get_service_versions" => {
                let service = request["params"]["service"].as_str().unwrap_or_default();
                let versions = inventory.published.get(service).cloned().unwrap_or_default();
                json!({"status": "ok", "data": versions})
            }
            "get_device_id" => json!({"status": "ok", "data": "device-7"}),
            "get_project_id" => json!({"status": "ok", "data": "fleet"}),
            "get_api_key" => json!({"status": "ok", "data": "key"}),
            "get_refresh_token" if inventory.identity_complete => {
                json!({"status": "ok", "data": "refresh"})
            }
            "get_refresh_token" => json!({"status": "error", "message": "not provisioned"}),
            "subscribe" if inventory.refuse_subscriptions => {
                json!({"status": "error", "message": "subscriptions disabled"})
            }
            "subscribe" => json!({"status": "ok", "data": Value::Null}),
            other => json!({"status": "error", "message": format!("unknown command {other}")}),
        }
    };

    let streaming = command == "subscribe" && reply["status"] == "ok";
    let feed = streaming.then(|| events.subscribe());
    if write_half
        .write_all(format!("{reply}\n").as_bytes())
        .await
        .is_err()
    {
        return;
    }
    let Some(mut feed) = feed else {
        return;
    };
    while let Ok(event) = feed.recv().await {
        if write_half
            .write_all(format!("{event}\n").as_bytes())
            .await
            .is_err()
        {
            return;
        }
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn wait_for_status(
    status: &mut watch::Receiver<DaemonStatus>,
    matches: impl FnMut(&DaemonStatus) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(matches))
        .await
        .expect("status not reached in time")
        .expect("daemon status channel closed");
}

fn start(channel: &FakeChannel, remote: &MemoryRemote, poll_interval: Duration) -> DaemonHandle {
    Daemon::new(channel.config(poll_interval))
        .with_remote(Arc::new(remote.clone()))
        .start()
}

fn updatable(entries: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
    Some(
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cold_start_publishes_and_notification_clears_update() {
    let channel = FakeChannel::start(Inventory {
        identity_complete: true,
        ..Inventory::default()
    })
    .await;
    channel.install("button-handler", "0.1.0");
    channel.publish("button-handler", &["0.1.0", "0.1.1"]);
    let remote = MemoryRemote::new();

    let handle = start(&channel, &remote, Duration::from_secs(3600));
    wait_until(|| remote.snapshot() == updatable(&[("button-handler", "0.1.1")])).await;
    wait_until(|| channel.subscribers() > 0).await;

    channel.install("button-handler", "0.1.1");
    channel.emit(json!({"event": "service_updated", "service": "button-handler", "version": "0.1.1"}));
    wait_until(|| remote.snapshot() == updatable(&[])).await;

    assert_eq!(remote.writes(), 2);
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_against_matching_record_does_not_write() {
    let channel = FakeChannel::start(Inventory {
        identity_complete: true,
        ..Inventory::default()
    })
    .await;
    channel.install("A", "1.1.0");
    channel.publish("A", &["1.2.0"]);
    let remote = MemoryRemote::with_entries(updatable(&[("A", "1.2.0")]).unwrap());

    let handle = start(&channel, &remote, Duration::from_secs(3600));
    wait_until(|| remote.reads() == 1).await;
    wait_until(|| channel.subscribers() > 0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(remote.write_attempts(), 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresolved_identity_is_reported_until_provisioned() {
    let channel = FakeChannel::start(Inventory::default()).await;
    channel.install("a", "1.0.0");
    channel.publish("a", &["1.0.1"]);
    let remote = MemoryRemote::new();

    let handle = start(&channel, &remote, Duration::from_secs(3600));
    let mut status = handle.status();
    wait_for_status(&mut status, |s| {
        matches!(s, DaemonStatus::ConfigUnresolved { attempts, .. } if *attempts >= 2)
    })
    .await;
    assert_eq!(remote.reads(), 0);

    channel.complete_identity();
    wait_for_status(&mut status, |s| matches!(s, DaemonStatus::Running { .. })).await;
    wait_until(|| remote.snapshot() == updatable(&[("a", "1.0.1")])).await;

    handle.shutdown().await.unwrap();
    assert_eq!(*status.borrow(), DaemonStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timer_keeps_reconciling_without_notifications() {
    let channel = FakeChannel::start(Inventory {
        identity_complete: true,
        refuse_subscriptions: true,
        ..Inventory::default()
    })
    .await;
    channel.install("a", "1.0.0");
    channel.publish("a", &["1.0.0"]);
    let remote = MemoryRemote::new();

    let handle = start(&channel, &remote, Duration::from_secs(1));
    wait_until(|| remote.reads() == 1).await;

    channel.publish("a", &["1.0.0", "1.1.0"]);
    wait_until(|| remote.snapshot() == updatable(&[("a", "1.1.0")])).await;

    handle.shutdown().await.unwrap();
}
