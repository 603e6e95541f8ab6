//! In-process fakes for the session and pool seams.
//!
//! Remote targets are real loopback TCP echo servers, so relays are exercised
//! end to end; only the encrypted session itself is simulated.

use crate::error::VtsError;
use crate::models::{PoolConfig, Rows, TunnelConfig};
use crate::services::pool::{DataPool, PoolBackend};
use crate::services::transport::{BoxedStream, TransportConnector, TunnelTransport};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Start a TCP echo server on a free loopback port.
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Counts live instances and remembers the highest count ever seen.
#[derive(Default)]
pub struct LiveCounter {
    live: AtomicUsize,
    max_live: AtomicUsize,
}

impl LiveCounter {
    fn acquire(&self) {
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now, Ordering::SeqCst);
    }

    fn release(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    /// Instances currently live.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live instances.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

/// Simulated session forwarding every stream to a local echo server.
pub struct FakeTransport {
    echo: SocketAddr,
    gone: CancellationToken,
    closed_once: AtomicBool,
    fail_opens: AtomicUsize,
    targets: Mutex<Vec<(String, u16)>>,
    counter: Option<Arc<LiveCounter>>,
}

impl FakeTransport {
    /// Create a standalone session.
    pub fn new(echo: SocketAddr) -> Self {
        Self {
            echo,
            gone: CancellationToken::new(),
            closed_once: AtomicBool::new(false),
            fail_opens: AtomicUsize::new(0),
            targets: Mutex::new(Vec::new()),
            counter: None,
        }
    }

    /// Make the next `n` stream opens fail.
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Every (host, port) a stream was requested for.
    pub fn targets(&self) -> Vec<(String, u16)> {
        self.targets.lock().clone()
    }

    /// Check if the session was closed or killed.
    pub fn is_gone(&self) -> bool {
        self.gone.is_cancelled()
    }

    /// Simulate the remote side dropping the session.
    pub fn kill(&self) {
        self.gone.cancel();
    }
}

#[async_trait]
impl TunnelTransport for FakeTransport {
    async fn open_stream(
        &self,
        host: &str,
        port: u16,
        _originator: SocketAddr,
    ) -> Result<BoxedStream, VtsError> {
        self.targets.lock().push((host.to_string(), port));
        if self.gone.is_cancelled() {
            return Err(VtsError::forward("session is gone"));
        }
        let fail = self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(VtsError::forward("administratively prohibited"));
        }
        let stream = TcpStream::connect(self.echo)
            .await
            .map_err(|e| VtsError::forward_with_source("echo target unreachable", e))?;
        Ok(Box::new(stream))
    }

    async fn closed(&self) {
        self.gone.cancelled().await;
    }

    async fn close(&self) {
        self.gone.cancel();
        if !self.closed_once.swap(true, Ordering::SeqCst) {
            if let Some(counter) = &self.counter {
                counter.release();
            }
        }
    }
}

/// Connector whose connect results follow a script.
///
/// Each `false` in the script fails one connect attempt; once the script is
/// exhausted every attempt succeeds.
pub struct FakeConnector {
    echo: SocketAddr,
    script: Mutex<VecDeque<bool>>,
    sessions: Mutex<Vec<Arc<FakeTransport>>>,
    attempts: AtomicUsize,
    /// Live session accounting.
    pub counter: Arc<LiveCounter>,
}

impl FakeConnector {
    /// Create a connector forwarding to `echo`.
    pub fn new(echo: SocketAddr) -> Self {
        Self {
            echo,
            script: Mutex::new(VecDeque::new()),
            sessions: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            counter: Arc::new(LiveCounter::default()),
        }
    }

    /// Queue connect outcomes.
    pub fn with_script(self, outcomes: impl IntoIterator<Item = bool>) -> Self {
        self.script.lock().extend(outcomes);
        self
    }

    /// Queue more connect outcomes later on.
    pub fn push_script(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.script.lock().extend(outcomes);
    }

    /// Number of connect attempts so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Most recently established session.
    pub fn current(&self) -> Option<Arc<FakeTransport>> {
        self.sessions.lock().last().cloned()
    }
}

/// Shared handle so tests keep access after the supervisor takes ownership.
#[derive(Clone)]
pub struct SharedConnector(pub Arc<FakeConnector>);

#[async_trait]
impl TransportConnector for SharedConnector {
    type Transport = SharedTransport;

    async fn connect(&self, _config: &TunnelConfig) -> Result<SharedTransport, VtsError> {
        let connector = &self.0;
        connector.attempts.fetch_add(1, Ordering::SeqCst);
        if connector.script.lock().pop_front() == Some(false) {
            return Err(VtsError::session("authentication rejected"));
        }
        connector.counter.acquire();
        let mut transport = FakeTransport::new(connector.echo);
        transport.counter = Some(connector.counter.clone());
        let transport = Arc::new(transport);
        connector.sessions.lock().push(transport.clone());
        Ok(SharedTransport(transport))
    }
}

/// A [`FakeTransport`] owned jointly by the supervisor and the test.
pub struct SharedTransport(pub Arc<FakeTransport>);

#[async_trait]
impl TunnelTransport for SharedTransport {
    async fn open_stream(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, VtsError> {
        self.0.open_stream(host, port, originator).await
    }

    async fn closed(&self) {
        self.0.closed().await;
    }

    async fn close(&self) {
        self.0.close().await;
    }
}

/// Simulated pool answering every query with fixed rows.
pub struct FakePool {
    probe_ok: bool,
    check_hangs: bool,
    rows: Rows,
    failing_sql: Option<String>,
    fault: CancellationToken,
    closed: AtomicBool,
    counter: Arc<LiveCounter>,
}

impl FakePool {
    /// Trigger a pool-level runtime fault.
    pub fn fault(&self) {
        self.fault.cancel();
    }

    /// Check if the pool was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataPool for FakePool {
    async fn probe(&self) -> Result<(), VtsError> {
        if self.check_hangs {
            std::future::pending::<()>().await;
        }
        if self.probe_ok {
            Ok(())
        } else {
            Err(VtsError::pool_creation("connection refused"))
        }
    }

    async fn query(&self, sql: &str) -> Result<Rows, VtsError> {
        if self.failing_sql.as_deref() == Some(sql) {
            return Err(VtsError::query("relation \"missing\" does not exist"));
        }
        Ok(self.rows.clone())
    }

    async fn faulted(&self) -> VtsError {
        self.fault.cancelled().await;
        VtsError::pool_runtime("terminating connection due to administrator command")
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counter.release();
        }
    }
}

/// Pool backend whose probe results follow a script.
pub struct FakeBackend {
    script: Mutex<VecDeque<bool>>,
    hang_checks: bool,
    rows: Rows,
    failing_sql: Option<String>,
    pools: Mutex<Vec<Arc<FakePool>>>,
    /// Live pool accounting.
    pub counter: Arc<LiveCounter>,
    configs: Mutex<Vec<PoolConfig>>,
}

impl FakeBackend {
    /// Create a backend whose pools return `rows`.
    pub fn new(rows: Rows) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            hang_checks: false,
            rows,
            failing_sql: None,
            pools: Mutex::new(Vec::new()),
            counter: Arc::new(LiveCounter::default()),
            configs: Mutex::new(Vec::new()),
        }
    }

    /// Queue probe outcomes; `false` fails the probe of one created pool.
    pub fn with_script(self, outcomes: impl IntoIterator<Item = bool>) -> Self {
        self.script.lock().extend(outcomes);
        self
    }

    /// Make every liveness check hang until pool creation is cancelled.
    pub fn with_hanging_liveness_checks(mut self) -> Self {
        self.hang_checks = true;
        self
    }

    /// Make queries with exactly this SQL fail.
    pub fn with_failing_sql(mut self, sql: impl Into<String>) -> Self {
        self.failing_sql = Some(sql.into());
        self
    }

    /// Number of pools created so far.
    pub fn created(&self) -> usize {
        self.pools.lock().len()
    }

    /// Most recently created pool.
    pub fn current(&self) -> Option<Arc<FakePool>> {
        self.pools.lock().last().cloned()
    }

    /// Configurations pools were created with.
    pub fn configs(&self) -> Vec<PoolConfig> {
        self.configs.lock().clone()
    }
}

/// Shared handle so tests keep access after the supervisor takes ownership.
#[derive(Clone)]
pub struct SharedBackend(pub Arc<FakeBackend>);

#[async_trait]
impl PoolBackend for SharedBackend {
    type Pool = SharedPool;

    async fn create(&self, config: &PoolConfig) -> Result<SharedPool, VtsError> {
        let backend = &self.0;
        backend.configs.lock().push(config.clone());
        let probe_ok = backend.script.lock().pop_front().unwrap_or(true);
        backend.counter.acquire();
        let pool = Arc::new(FakePool {
            probe_ok,
            check_hangs: backend.hang_checks,
            rows: backend.rows.clone(),
            failing_sql: backend.failing_sql.clone(),
            fault: CancellationToken::new(),
            closed: AtomicBool::new(false),
            counter: backend.counter.clone(),
        });
        backend.pools.lock().push(pool.clone());
        Ok(SharedPool(pool))
    }
}

/// A [`FakePool`] owned jointly by the supervisor and the test.
pub struct SharedPool(pub Arc<FakePool>);

#[async_trait]
impl DataPool for SharedPool {
    async fn probe(&self) -> Result<(), VtsError> {
        self.0.probe().await
    }

    async fn query(&self, sql: &str) -> Result<Rows, VtsError> {
        self.0.query(sql).await
    }

    async fn faulted(&self) -> VtsError {
        self.0.faulted().await
    }

    fn close(&self) {
        self.0.close();
    }
}

/// Build `n` rows with descending `timestamp` values.
pub fn vehicle_rows(n: usize) -> Rows {
    (0..n)
        .map(|i| {
            let mut row = serde_json::Map::new();
            row.insert("imei".to_string(), serde_json::json!("356307042441013"));
            row.insert("timestamp".to_string(), serde_json::json!(1_700_000_000 - i as i64));
            row.insert("speed".to_string(), serde_json::json!(42));
            row
        })
        .collect()
}
