//! Upstream MCP server management
//!
//! Stdio upstreams are child processes speaking newline-delimited JSON-RPC;
//! HTTP upstreams are plain POST endpoints. Spawning and reaping are
//! serialized per upstream name; request dispatch to a live upstream takes
//! no lock. Each upstream carries an in-flight bound past which callers fail
//! fast instead of queueing forever.

use crate::config::UpstreamSpec;
use aegis_core::{rpc, Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tracing::{debug, error, info, warn};

/// In-flight requests allowed per upstream before callers are shed
const MAX_IN_FLIGHT: usize = 64;

/// A notification that arrived from an upstream
#[derive(Debug, Clone)]
pub struct UpstreamNotification {
    /// Which upstream sent it
    pub origin: String,

    /// The notification message
    pub message: rpc::Request,
}

/// A connection to one upstream server
#[async_trait]
pub trait UpstreamConnection: Send + Sync {
    /// Send a request and await its response
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<rpc::Response>;
}

/// Stdio child-process upstream
pub struct StdioUpstream {
    name: String,
    stdin: Mutex<tokio::process::ChildStdin>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<rpc::Response>>>>,
    next_id: AtomicU64,
    in_flight: Semaphore,
    _child: Mutex<Child>,
}

impl StdioUpstream {
    /// Spawn the child process and start its reader task
    pub fn spawn(
        spec: &UpstreamSpec,
        notifications: mpsc::UnboundedSender<UpstreamNotification>,
    ) -> Result<Arc<Self>> {
        let command = spec
            .command
            .as_deref()
            .ok_or_else(|| Error::config(format!("upstream '{}' has no command", spec.name)))?;

        let mut cmd = Command::new(command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::upstream(format!("failed to spawn '{}': {}", spec.name, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::upstream(format!("no stdin for '{}'", spec.name)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::upstream(format!("no stdout for '{}'", spec.name)))?;

        let upstream = Arc::new(Self {
            name: spec.name.clone(),
            stdin: Mutex::new(stdin),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            in_flight: Semaphore::new(MAX_IN_FLIGHT),
            _child: Mutex::new(child),
        });

        let pending = Arc::clone(&upstream.pending);
        let name = spec.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let raw: Value = match serde_json::from_str(&line) {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(upstream = %name, "unparseable upstream line: {}", e);
                        continue;
                    }
                };

                // A message with an id and a result/error member answers one
                // of our calls; one with a method is upstream-initiated.
                let is_response = raw.get("id").is_some()
                    && (raw.get("result").is_some() || raw.get("error").is_some());
                if is_response {
                    if let Ok(response) = serde_json::from_value::<rpc::Response>(raw) {
                        if let Some(id) = response.id.as_u64() {
                            if let Some(tx) = pending.lock().await.remove(&id) {
                                let _ = tx.send(response);
                            }
                        }
                    }
                    continue;
                }

                match serde_json::from_value::<rpc::Request>(raw) {
                    Ok(message) if message.is_notification() => {
                        let _ = notifications.send(UpstreamNotification {
                            origin: name.clone(),
                            message,
                        });
                    }
                    Ok(_) => debug!(upstream = %name, "ignoring server-initiated request"),
                    Err(e) => warn!(upstream = %name, "unrecognized upstream message: {}", e),
                }
            }
            info!(upstream = %name, "stdout closed, upstream reader exiting");
        });

        Ok(upstream)
    }
}

#[async_trait]
impl UpstreamConnection for StdioUpstream {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<rpc::Response> {
        let _permit = self.in_flight.try_acquire().map_err(|_| {
            Error::upstream(format!("upstream '{}' is saturated", self.name))
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = rpc::Request::new(id, method, params);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let line = format!("{}\n", serde_json::to_string(&request)?);
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.pending.lock().await.remove(&id);
                return Err(Error::upstream(format!(
                    "write to '{}' failed: {}",
                    self.name, e
                )));
            }
            let _ = stdin.flush().await;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                Err(Error::upstream(format!("upstream '{}' closed", self.name)))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::upstream(format!(
                    "upstream '{}' timed out after {}ms",
                    self.name,
                    timeout.as_millis()
                )))
            }
        }
    }
}

/// HTTP POST upstream
pub struct HttpUpstream {
    name: String,
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
    in_flight: Semaphore,
}

impl HttpUpstream {
    /// Create a connection to an HTTP upstream
    pub fn new(spec: &UpstreamSpec) -> Result<Self> {
        let url = spec
            .url
            .clone()
            .ok_or_else(|| Error::config(format!("upstream '{}' has no url", spec.name)))?;
        Ok(Self {
            name: spec.name.clone(),
            url,
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
            in_flight: Semaphore::new(MAX_IN_FLIGHT),
        })
    }
}

#[async_trait]
impl UpstreamConnection for HttpUpstream {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<rpc::Response> {
        let _permit = self.in_flight.try_acquire().map_err(|_| {
            Error::upstream(format!("upstream '{}' is saturated", self.name))
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = rpc::Request::new(id, method, params);

        let response = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::upstream(format!("'{}' unreachable: {}", self.name, e)))?;

        response
            .json()
            .await
            .map_err(|e| Error::upstream(format!("'{}' returned bad json: {}", self.name, e)))
    }
}

/// Registry of live upstream connections
pub struct UpstreamManager {
    connections: RwLock<HashMap<String, Arc<dyn UpstreamConnection>>>,
    /// Serializes spawn/reap per upstream name
    spawn_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    notifications: mpsc::UnboundedSender<UpstreamNotification>,
}

impl UpstreamManager {
    /// Create a manager; the receiver carries upstream notifications
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UpstreamNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                connections: RwLock::new(HashMap::new()),
                spawn_locks: Mutex::new(HashMap::new()),
                notifications: tx,
            },
            rx,
        )
    }

    /// Spawn or connect every configured upstream
    pub async fn spawn_all(&self, specs: &[UpstreamSpec]) -> Result<()> {
        for spec in specs {
            if let Err(e) = self.spawn(spec).await {
                // One broken upstream must not keep the proxy down.
                error!(upstream = %spec.name, "failed to start upstream: {}", e);
            }
        }
        Ok(())
    }

    /// Spawn or connect one upstream, serialized per name
    pub async fn spawn(&self, spec: &UpstreamSpec) -> Result<()> {
        let lock = {
            let mut locks = self.spawn_locks.lock().await;
            Arc::clone(locks.entry(spec.name.clone()).or_default())
        };
        let _guard = lock.lock().await;

        let connection: Arc<dyn UpstreamConnection> = if spec.command.is_some() {
            StdioUpstream::spawn(spec, self.notifications.clone())?
        } else {
            Arc::new(HttpUpstream::new(spec)?)
        };

        self.connections.write().insert(spec.name.clone(), connection);
        metrics::gauge!("aegis_active_upstreams").set(self.connections.read().len() as f64);
        info!(upstream = %spec.name, "upstream ready");
        Ok(())
    }

    /// Register an already-built connection (tests, embedded upstreams)
    pub fn register(&self, name: impl Into<String>, connection: Arc<dyn UpstreamConnection>) {
        self.connections.write().insert(name.into(), connection);
    }

    /// Names of live upstreams
    pub fn names(&self) -> Vec<String> {
        self.connections.read().keys().cloned().collect()
    }

    /// Dispatch a request to a named upstream
    pub async fn request(
        &self,
        name: &str,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<rpc::Response> {
        let connection = self
            .connections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::upstream(format!("unknown upstream '{}'", name)))?;

        let started = Instant::now();
        let result = connection.request(method, params, timeout).await;
        metrics::histogram!("aegis_upstream_latency_ms", "upstream" => name.to_string())
            .record(started.elapsed().as_millis() as f64);
        result
    }
}
