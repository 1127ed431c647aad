//! SceneDB Server - Unix socket server for the replicated scene store
//!
//! Runs a whole deterministic cluster (per-shard logs + replicas) in one
//! process and exposes the client surface over a Unix socket.
//!
//! Usage:
//!   scenedb-server /path/to/cluster-dir [--socket /tmp/scenedb.sock]
//!
//! Protocol:
//!   Request:  [4-byte length BE] [MessagePack payload]
//!   Response: [4-byte length BE] [MessagePack payload]
//!
//! The cluster directory carries `cluster_config.json`; a missing file is
//! created with the reference configuration (2 shards, 3 replicas,
//! MaxLatency 16).

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{error, info, warn};

use scenedb::cluster::{ClusterStore, NodeView};
use scenedb::config::ClusterConfig;
use scenedb::metrics::MetricsSnapshot;
use scenedb::scene::{NodeId, SceneOp};
use scenedb::session::ClientSession;
use scenedb::shard::ShardId;
use scenedb::txn::coordinator::TxnOutcome;

// Global client ID counter
static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

/// How often the maintenance thread advances the tick clock and drains
/// appliers. The HLC `MaxLatency` window is measured in these ticks.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Wire Protocol Types
// ============================================================================

/// Request from client
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Request {
    /// Submit a transaction of scene operations
    Submit { ops: Vec<SceneOp> },

    /// Read one node from the leader of its owning shard
    GetNode { id: NodeId },

    /// Ordered children of a node
    OrderedChildren { id: NodeId },

    /// Migrate the subtree rooted at `node` to `new_shard`
    MoveShard {
        node: NodeId,
        #[serde(rename = "newShard")]
        new_shard: ShardId,
    },

    /// Mark a replica crashed
    CrashReplica { replica: usize },

    /// Replay and rejoin a crashed replica
    RecoverReplica { replica: usize },

    /// Leader-change notification for a shard
    SetLeader {
        shard: ShardId,
        leader: Option<usize>,
    },

    /// Server status and metrics
    Status,

    /// Stop the server
    Shutdown,
}

/// Response to client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    Ok,
    Error {
        error: String,
        code: &'static str,
    },
    Txn {
        outcome: TxnOutcome,
    },
    Node {
        node: NodeView,
    },
    Children {
        children: Vec<NodeId>,
    },
    Recovery {
        shards_replayed: usize,
        entries_replayed: usize,
    },
    Status {
        status: StatusInfo,
    },
}

#[derive(Debug, Serialize)]
pub struct StatusInfo {
    pub shards: u16,
    pub replicas: usize,
    pub max_latency: u64,
    pub metrics: MetricsSnapshot,
    pub memory_mb: u64,
}

// ============================================================================
// Request handling
// ============================================================================

fn handle_request(
    cluster: &Arc<Mutex<ClusterStore>>,
    session: &mut ClientSession,
    request: Request,
) -> Response {
    match request {
        Request::Submit { ops } => {
            session.record_submit();
            let mut store = cluster.lock().unwrap();
            match store.submit(ops) {
                Ok(outcome) => Response::Txn { outcome },
                Err(err) => error_response(err),
            }
        }
        Request::GetNode { id } => {
            session.record_read();
            let store = cluster.lock().unwrap();
            match store.get(id) {
                Ok(node) => Response::Node { node },
                Err(err) => error_response(err),
            }
        }
        Request::OrderedChildren { id } => {
            session.record_read();
            let store = cluster.lock().unwrap();
            match store.ordered_children(id) {
                Ok(children) => Response::Children { children },
                Err(err) => error_response(err),
            }
        }
        Request::MoveShard { node, new_shard } => {
            session.record_submit();
            let mut store = cluster.lock().unwrap();
            match store.move_shard(node, new_shard) {
                Ok(outcome) => Response::Txn { outcome },
                Err(err) => error_response(err),
            }
        }
        Request::CrashReplica { replica } => {
            let mut store = cluster.lock().unwrap();
            match store.crash(replica) {
                Ok(()) => Response::Ok,
                Err(err) => error_response(err),
            }
        }
        Request::RecoverReplica { replica } => {
            let mut store = cluster.lock().unwrap();
            match store.recover(replica) {
                Ok(report) => Response::Recovery {
                    shards_replayed: report.shards_replayed,
                    entries_replayed: report.entries_replayed,
                },
                Err(err) => error_response(err),
            }
        }
        Request::SetLeader { shard, leader } => {
            let store = cluster.lock().unwrap();
            if shard >= store.config().shards {
                return Response::Error {
                    error: format!("Unknown shard: {}", shard),
                    code: "UNKNOWN_SHARD",
                };
            }
            store.set_leader(shard, leader);
            Response::Ok
        }
        Request::Status => {
            let store = cluster.lock().unwrap();
            let config = store.config();
            Response::Status {
                status: StatusInfo {
                    shards: config.shards,
                    replicas: config.replicas,
                    max_latency: config.max_latency,
                    metrics: store.metrics().snapshot(),
                    memory_mb: process_memory_mb(),
                },
            }
        }
        Request::Shutdown => Response::Ok,
    }
}

fn error_response(err: scenedb::SceneError) -> Response {
    Response::Error {
        code: err.code(),
        error: err.to_string(),
    }
}

fn process_memory_mb() -> u64 {
    let mut sys = System::new();
    sys.refresh_processes();
    sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| sys.process(pid))
        .map(|p| p.memory() / (1024 * 1024))
        .unwrap_or(0)
}

// ============================================================================
// Framing
// ============================================================================

fn read_message(stream: &mut UnixStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > 16 * 1024 * 1024 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(Some(buf))
}

fn write_message(stream: &mut UnixStream, data: &[u8]) -> std::io::Result<()> {
    let len = data.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(data)?;
    stream.flush()?;
    Ok(())
}

// ============================================================================
// Client loop
// ============================================================================

fn handle_client(mut stream: UnixStream, cluster: Arc<Mutex<ClusterStore>>, client_id: usize) {
    info!(client_id, "client connected");
    let mut session = ClientSession::new(client_id);

    loop {
        let msg = match read_message(&mut stream) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                info!(
                    client_id,
                    txns = session.txns_submitted,
                    reads = session.reads_served,
                    "client disconnected"
                );
                break;
            }
            Err(e) => {
                warn!(client_id, error = %e, "client read error");
                break;
            }
        };

        let request: Request = match rmp_serde::from_slice(&msg) {
            Ok(req) => req,
            Err(e) => {
                let response = Response::Error {
                    error: format!("Invalid request: {}", e),
                    code: "INVALID_REQUEST",
                };
                if let Ok(bytes) = rmp_serde::to_vec_named(&response) {
                    let _ = write_message(&mut stream, &bytes);
                }
                continue;
            }
        };

        let is_shutdown = matches!(request, Request::Shutdown);
        let response = handle_request(&cluster, &mut session, request);

        let resp_bytes = match rmp_serde::to_vec_named(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(client_id, error = %e, "response serialize error");
                continue;
            }
        };

        if let Err(e) = write_message(&mut stream, &resp_bytes) {
            warn!(client_id, error = %e, "client write error");
            break;
        }

        if is_shutdown {
            info!(client_id, "shutdown requested");
            std::process::exit(0);
        }
    }
}

// ============================================================================
// Main
// ============================================================================

fn load_or_create_config(dir: &Path) -> scenedb::Result<ClusterConfig> {
    std::fs::create_dir_all(dir)?;
    match ClusterConfig::read_from(dir)? {
        Some(config) => Ok(config),
        None => {
            let config = ClusterConfig::default();
            config.write_to(dir)?;
            info!(path = %dir.display(), "wrote reference cluster config");
            Ok(config)
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("scenedb-server {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }

    if args.len() < 2 || args.iter().any(|a| a == "--help" || a == "-h") {
        println!("scenedb-server {}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Replicated, sharded scene-graph store server");
        println!();
        println!("Usage: scenedb-server <cluster-dir> [--socket <socket-path>]");
        println!();
        println!("Arguments:");
        println!("  <cluster-dir>  Directory holding cluster_config.json");
        println!("  --socket       Unix socket path (default: /tmp/scenedb.sock)");
        std::process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cluster_dir = PathBuf::from(&args[1]);
    let socket_path = args
        .iter()
        .position(|a| a == "--socket")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp/scenedb.sock"));

    let config = match load_or_create_config(&cluster_dir) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load cluster config");
            std::process::exit(1);
        }
    };
    info!(
        shards = config.shards,
        replicas = config.replicas,
        max_latency = config.max_latency,
        "starting cluster"
    );

    let store = match ClusterStore::new(config) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to start cluster");
            std::process::exit(1);
        }
    };
    let clock = store.clock();
    let cluster = Arc::new(Mutex::new(store));

    // Maintenance thread: advance the tick clock, drain appliers, collect
    // terminal transactions.
    {
        let cluster = Arc::clone(&cluster);
        thread::spawn(move || loop {
            thread::sleep(TICK_INTERVAL);
            clock.tick();
            let mut store = cluster.lock().unwrap();
            if let Err(e) = store.step() {
                error!(error = %e, "applier step failed");
            }
            store.gc_txns();
        });
    }

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            error!(path = %socket_path.display(), error = %e, "failed to bind socket");
            std::process::exit(1);
        }
    };
    info!(path = %socket_path.display(), "listening");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);
                let cluster = Arc::clone(&cluster);
                thread::spawn(move || handle_client(stream, cluster, client_id));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}
