//! The per-connection wire engine.
//!
//! One open wire runs exactly two background tasks: a reader that frames
//! incoming messages, handles the three asynchronous kinds inline, and queues
//! the rest for consumers; and a writer that drains queued frames into the
//! socket, coalescing whatever is already buffered into one write.
//!
//! Every request/response exchange is a pipeline: take the write lock, queue
//! the frames plus a trailing `Sync`, take the read lock *before* releasing
//! the write lock (so responses pair up FIFO with requests), then read and
//! finally drain through the `ReadyForQuery` that the `Sync` guarantees. The
//! drain runs on success and failure alike, which is what keeps concurrent
//! callers on one wire from ever seeing each other's leftovers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result, ServerError};
use crate::protocol::*;
use crate::query::{Query, Row};
use crate::sasl::ScramClient;
use crate::sql::{quote_ident, SqlFragment};
use crate::statement::{RowTemplate, Statement, StatementCache, StatementInfo};
use crate::transaction::{Transaction, TxEntry};
use crate::types::{Codecs, Value};

/// Byte source for `COPY ... FROM STDIN`.
pub type CopySource = Box<dyn AsyncRead + Send + Unpin>;
/// Byte sink for `COPY ... TO STDOUT`.
pub type CopySink = Box<dyn AsyncWrite + Send + Unpin>;

const COPY_CHUNK: usize = 8192;
const QUEUE_DEPTH: usize = 64;

/// A `NOTIFY` delivered on a listened channel.
#[derive(Debug, Clone)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// Events observable via [`Wire::events`].
#[derive(Debug, Clone)]
pub enum WireEvent {
    Connect,
    Close { reason: String },
    Notice(ServerError),
    Parameter {
        name: String,
        value: String,
        previous: Option<String>,
    },
    Notification(Notification),
}

// ============================================================================
// Inner state
// ============================================================================

struct Outbound {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl Outbound {
    async fn send(&self, frame: Bytes) -> Result<()> {
        match &self.tx {
            Some(tx) => tx.send(frame).await.map_err(|_| Error::ConnectionClosed),
            None => Err(Error::ConnectionClosed),
        }
    }

    async fn send_msg<M: FrontendMessage>(&self, msg: &M) -> Result<()> {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf)?;
        self.send(buf.freeze()).await
    }
}

struct Inbound {
    rx: Option<mpsc::Receiver<BackendMessage>>,
}

impl Inbound {
    async fn recv(&mut self) -> Result<BackendMessage> {
        match &mut self.rx {
            Some(rx) => rx.recv().await.ok_or(Error::ConnectionClosed),
            None => Err(Error::ConnectionClosed),
        }
    }
}

struct Shared {
    params: HashMap<String, String>,
    tx_status: TransactionStatus,
    connected: bool,
    closing: bool,
    /// Bumped on every (re)connect; stale socket tasks compare against it.
    generation: u64,
    backend_key: Option<(i32, i32)>,
    next_tx: u64,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    reconnecting: bool,
}

pub(crate) struct WireInner {
    config: Config,
    codecs: Arc<Codecs>,
    shared: Mutex<Shared>,
    statements: Mutex<StatementCache>,
    channels: Mutex<HashMap<String, broadcast::Sender<Notification>>>,
    pub(crate) tx_stack: AsyncMutex<Vec<TxEntry>>,
    wlock: AsyncMutex<Outbound>,
    rlock: AsyncMutex<Inbound>,
    events: broadcast::Sender<WireEvent>,
}

impl Drop for WireInner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut();
        if let Some(t) = shared.reader.take() {
            t.abort();
        }
        if let Some(t) = shared.writer.take() {
            t.abort();
        }
    }
}

/// Outcome of one round of row reading.
pub(crate) struct RowsOutcome {
    pub rows: Vec<Row>,
    pub tag: String,
    pub done: bool,
}

impl WireInner {
    pub(crate) fn new(config: Config) -> Arc<Self> {
        let codecs = Arc::new(config.codecs.clone());
        let capacity = config.statement_cache_capacity;
        let (events, _) = broadcast::channel(QUEUE_DEPTH);
        Arc::new(Self {
            config,
            codecs,
            shared: Mutex::new(Shared {
                params: HashMap::new(),
                tx_status: TransactionStatus::Idle,
                connected: false,
                closing: false,
                generation: 0,
                backend_key: None,
                next_tx: 0,
                reader: None,
                writer: None,
                reconnecting: false,
            }),
            statements: Mutex::new(StatementCache::new(capacity)),
            channels: Mutex::new(HashMap::new()),
            tx_stack: AsyncMutex::new(Vec::new()),
            wlock: AsyncMutex::new(Outbound { tx: None }),
            rlock: AsyncMutex::new(Inbound { rx: None }),
            events,
        })
    }

    pub(crate) fn codecs(&self) -> &Codecs {
        &self.codecs
    }

    pub(crate) fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    pub(crate) fn next_tx_id(&self) -> u64 {
        let mut shared = self.shared.lock();
        shared.next_tx += 1;
        shared.next_tx
    }

    pub(crate) fn tx_status(&self) -> TransactionStatus {
        self.shared.lock().tx_status
    }

    // ------------------------------------------------------------------
    // Connect / disconnect
    // ------------------------------------------------------------------

    pub(crate) async fn connect(self: &Arc<Self>) -> Result<()> {
        let mut out = self.wlock.lock().await;
        let mut inb = self.rlock.lock().await;
        if self.shared.lock().connected {
            return Ok(());
        }
        let result = self.connect_locked(&mut out, &mut inb).await;
        if result.is_err() {
            out.tx = None;
            inb.rx = None;
            let mut shared = self.shared.lock();
            if let Some(t) = shared.reader.take() {
                t.abort();
            }
            if let Some(t) = shared.writer.take() {
                t.abort();
            }
        }
        result
    }

    async fn connect_locked(
        self: &Arc<Self>,
        out: &mut Outbound,
        inb: &mut Inbound,
    ) -> Result<()> {
        let socket = self.open_socket().await?;
        let (read_half, write_half) = tokio::io::split(socket);
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<BackendMessage>(QUEUE_DEPTH);

        let generation = {
            let mut shared = self.shared.lock();
            shared.generation += 1;
            if let Some(t) = shared.reader.take() {
                t.abort();
            }
            if let Some(t) = shared.writer.take() {
                t.abort();
            }
            shared.reader = Some(tokio::spawn(reader_task(
                read_half,
                in_tx,
                Arc::downgrade(self),
                shared.generation,
            )));
            shared.writer = Some(tokio::spawn(writer_task(write_half, out_rx)));
            shared.generation
        };

        out.tx = Some(out_tx);
        inb.rx = Some(in_rx);

        self.authenticate(out, inb).await?;

        {
            let mut shared = self.shared.lock();
            shared.connected = true;
            shared.closing = false;
        }
        info!(
            host = %self.config.host,
            port = self.config.port,
            generation,
            "connected"
        );
        let _ = self.events.send(WireEvent::Connect);

        // Re-establish LISTEN registrations while both locks are still held,
        // so no user query can run on this session before the channels are
        // live again.
        let names: Vec<String> = self.channels.lock().keys().cloned().collect();
        if !names.is_empty() {
            let script: String = names
                .iter()
                .map(|n| format!("LISTEN {}; ", quote_ident(n)))
                .collect();
            debug!(channels = names.len(), "restoring LISTEN registrations");
            out.send_msg(&QueryMessage { query: &script }).await?;
            self.drain_ready(inb).await?;
        }
        Ok(())
    }

    async fn open_socket(&self) -> Result<Box<dyn Socket>> {
        #[cfg(unix)]
        if let Some(path) = self.config.socket_path() {
            let stream = UnixStream::connect(&path).await?;
            return Ok(Box::new(stream));
        }
        #[cfg(not(unix))]
        if self.config.socket_path().is_some() {
            return Err(Error::protocol("unix sockets are not supported here"));
        }
        let stream = TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
        stream.set_nodelay(true)?;
        SockRef::from(&stream).set_keepalive(true)?;
        Ok(Box::new(stream))
    }

    async fn authenticate(&self, out: &mut Outbound, inb: &mut Inbound) -> Result<()> {
        out.send_msg(&StartupMessage {
            params: self.config.startup_params(),
        })
        .await?;

        loop {
            match inb.recv().await? {
                BackendMessage::Authentication(auth) => match auth {
                    Authentication::Ok => {}
                    Authentication::CleartextPassword => {
                        let password = self.require_password()?;
                        out.send_msg(&PasswordMessage {
                            password: password.to_string(),
                        })
                        .await?;
                    }
                    Authentication::Sasl { mechanisms } => {
                        self.sasl_exchange(out, inb, &mechanisms).await?;
                    }
                    Authentication::Md5Password { .. } => {
                        return Err(Error::Auth("md5 authentication is not supported".into()))
                    }
                    Authentication::KerberosV5 => {
                        return Err(Error::Auth("kerberos authentication is not supported".into()))
                    }
                    Authentication::Gss => {
                        return Err(Error::Auth("gss authentication is not supported".into()))
                    }
                    Authentication::Sspi => {
                        return Err(Error::Auth("sspi authentication is not supported".into()))
                    }
                    Authentication::SaslContinue { .. } | Authentication::SaslFinal { .. } => {
                        return Err(Error::protocol("SASL continuation outside an exchange"))
                    }
                },
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.shared.lock().backend_key = Some((process_id, secret_key));
                }
                BackendMessage::NegotiateProtocolVersion {
                    newest_minor,
                    unsupported_options,
                } => {
                    warn!(newest_minor, ?unsupported_options, "server downgraded protocol");
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.shared.lock().tx_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { error } => return Err(error.into()),
                other => return Err(unexpected("startup message", &other)),
            }
        }
    }

    fn require_password(&self) -> Result<&str> {
        self.config
            .password
            .as_deref()
            .ok_or_else(|| Error::Auth("password required but not configured".into()))
    }

    async fn sasl_exchange(
        &self,
        out: &mut Outbound,
        inb: &mut Inbound,
        mechanisms: &[String],
    ) -> Result<()> {
        if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
            return Err(Error::Auth(format!(
                "no supported SASL mechanism among {mechanisms:?}"
            )));
        }
        let mut scram = ScramClient::new(self.require_password()?);
        out.send_msg(&SaslInitialResponse {
            mechanism: "SCRAM-SHA-256".to_string(),
            data: scram.client_first_message(),
        })
        .await?;

        loop {
            match inb.recv().await? {
                BackendMessage::Authentication(Authentication::SaslContinue { data }) => {
                    let response = scram.process_server_first(&data)?;
                    out.send_msg(&SaslResponse { data: response }).await?;
                }
                BackendMessage::Authentication(Authentication::SaslFinal { data }) => {
                    scram.verify_server_final(&data)?;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { error } => return Err(error.into()),
                other => return Err(unexpected("SASL challenge", &other)),
            }
        }
    }

    /// Tear down after an unexpected socket failure. Called by the reader
    /// task; stale generations are ignored.
    fn handle_disconnect(self: &Arc<Self>, generation: u64, reason: &str) {
        let schedule = {
            let mut shared = self.shared.lock();
            if shared.generation != generation {
                return;
            }
            let was_connected = shared.connected;
            shared.connected = false;
            shared.params.clear();
            shared.backend_key = None;
            shared.tx_status = TransactionStatus::Idle;
            if let Some(t) = shared.reader.take() {
                t.abort();
            }
            if let Some(t) = shared.writer.take() {
                t.abort();
            }
            let schedule = was_connected
                && !shared.closing
                && !shared.reconnecting
                && self.config.reconnect_delay.is_some();
            if schedule {
                shared.reconnecting = true;
            }
            schedule
        };
        self.statements.lock().clear();
        if let Ok(mut stack) = self.tx_stack.try_lock() {
            stack.clear();
        }
        warn!(reason, "connection lost");
        let _ = self.events.send(WireEvent::Close {
            reason: reason.to_string(),
        });
        if schedule {
            let delay = self.config.reconnect_delay.unwrap_or(Duration::from_secs(1));
            tokio::spawn(reconnect_loop(Arc::downgrade(self), delay));
        }
    }

    pub(crate) async fn close(&self) {
        self.shared.lock().closing = true;
        let mut out = self.wlock.lock().await;
        if out.tx.is_some() {
            let _ = out.send_msg(&TerminateMessage).await;
        }
        // Dropping the sender lets the writer flush Terminate and exit.
        out.tx = None;
        let mut inb = self.rlock.lock().await;
        inb.rx = None;
        drop(inb);
        drop(out);

        {
            let mut shared = self.shared.lock();
            shared.generation += 1;
            shared.connected = false;
            shared.params.clear();
            shared.backend_key = None;
            shared.tx_status = TransactionStatus::Idle;
            if let Some(t) = shared.reader.take() {
                t.abort();
            }
            shared.writer.take();
        }
        self.statements.lock().clear();
        if let Ok(mut stack) = self.tx_stack.try_lock() {
            stack.clear();
        }
        debug!("closed by client");
        let _ = self.events.send(WireEvent::Close {
            reason: "closed by client".to_string(),
        });
    }

    pub(crate) async fn cancel(&self) -> Result<()> {
        let (process_id, secret_key) = self
            .shared
            .lock()
            .backend_key
            .ok_or(Error::ConnectionClosed)?;
        let mut socket = self.open_socket().await?;
        let mut buf = BytesMut::new();
        CancelRequest {
            process_id,
            secret_key,
        }
        .encode(&mut buf)?;
        socket.write_all(&buf).await?;
        let _ = socket.shutdown().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Asynchronous-message filter (runs on the reader task)
    // ------------------------------------------------------------------

    fn filter_async(&self, msg: BackendMessage) -> Option<BackendMessage> {
        match msg {
            BackendMessage::NoticeResponse { notice } => {
                log_notice(&notice);
                let _ = self.events.send(WireEvent::Notice(notice));
                None
            }
            BackendMessage::ParameterStatus { name, value } => {
                let previous = self
                    .shared
                    .lock()
                    .params
                    .insert(name.clone(), value.clone());
                let _ = self.events.send(WireEvent::Parameter {
                    name,
                    value,
                    previous,
                });
                None
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                let notification = Notification {
                    process_id,
                    channel,
                    payload,
                };
                if let Some(tx) = self.channels.lock().get(&notification.channel) {
                    let _ = tx.send(notification.clone());
                }
                let _ = self.events.send(WireEvent::Notification(notification));
                None
            }
            other => Some(other),
        }
    }

    // ------------------------------------------------------------------
    // Pipelining
    // ------------------------------------------------------------------

    /// Write phase of a pipeline: queue `head`, stream any `COPY IN` source,
    /// queue `tail`, and always finish with `Sync`. Returns the read-lock
    /// guard (acquired before the write lock is released, so pipelines pair
    /// FIFO) plus the first write-side error.
    async fn exchange_start(
        &self,
        frames: Result<(BytesMut, Option<BytesMut>)>,
        mut stdin: Option<CopySource>,
    ) -> (MutexGuard<'_, Inbound>, Option<Error>) {
        let out = self.wlock.lock().await;
        let mut first_err: Option<Error> = None;

        match frames {
            Ok((head, tail)) => {
                if let Err(e) = out.send(head.freeze()).await {
                    first_err = Some(e);
                }
                if first_err.is_none() {
                    if let Some(source) = stdin.as_mut() {
                        if let Err(e) = stream_copy_in(&out, source).await {
                            first_err = Some(e);
                        }
                    }
                }
                if first_err.is_none() {
                    if let Some(tail) = tail {
                        if let Err(e) = out.send(tail.freeze()).await {
                            first_err = Some(e);
                        }
                    }
                }
            }
            Err(e) => first_err = Some(e),
        }

        // The Sync goes out even after a failed write so the server answers
        // with the ReadyForQuery the drain is waiting for.
        let mut sync = BytesMut::new();
        SyncMessage
            .encode(&mut sync)
            .expect("sync frame has no fallible fields");
        if let Err(e) = out.send(sync.freeze()).await {
            first_err.get_or_insert(e);
        }

        let inb = self.rlock.lock().await;
        drop(out);
        (inb, first_err)
    }

    /// Read until `ReadyForQuery`, latching any `ErrorResponse` on the way.
    async fn drain_ready(&self, inb: &mut Inbound) -> Result<()> {
        let mut pending: Option<Error> = None;
        loop {
            match inb.recv().await? {
                BackendMessage::ReadyForQuery { status } => {
                    self.shared.lock().tx_status = status;
                    return match pending {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                }
                BackendMessage::ErrorResponse { error } => {
                    pending.get_or_insert(error.into());
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Extended-query operations
    // ------------------------------------------------------------------

    /// Cached statement for a query text; evicted statements are closed on
    /// the server in the background.
    pub(crate) fn statement_for(self: &Arc<Self>, text: &str) -> Arc<Statement> {
        let (stmt, evicted) = self.statements.lock().get_or_insert(text);
        if let Some(name) = evicted {
            let wire = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = wire.run_close_statement(&name).await {
                    debug!(statement = %name, error = %e, "evicted statement close failed");
                }
            });
        }
        stmt
    }

    /// Parse and describe a statement.
    pub(crate) async fn run_parse(&self, stmt: &Statement) -> Result<StatementInfo> {
        let frames: Result<(BytesMut, Option<BytesMut>)> = (|| {
            let mut head = BytesMut::new();
            ParseMessage {
                statement: &stmt.name,
                query: &stmt.query,
                param_types: &[],
            }
            .encode(&mut head)?;
            DescribeMessage {
                kind: b'S',
                name: &stmt.name,
            }
            .encode(&mut head)?;
            Ok((head, None))
        })();

        let (mut inb, write_err) = self.exchange_start(frames, None).await;
        if let Some(e) = write_err {
            let _ = self.drain_ready(&mut inb).await;
            return Err(e);
        }
        let result = self.read_parse(&mut inb).await;
        let drained = self.drain_ready(&mut inb).await;
        drop(inb);
        match result {
            Ok(info) => drained.map(|_| info),
            Err(e) => Err(e),
        }
    }

    async fn read_parse(&self, inb: &mut Inbound) -> Result<StatementInfo> {
        match inb.recv().await? {
            BackendMessage::ParseComplete => {}
            BackendMessage::ErrorResponse { error } => return Err(error.into()),
            other => return Err(unexpected("ParseComplete", &other)),
        }
        let param_types = match inb.recv().await? {
            BackendMessage::ParameterDescription { param_types } => param_types,
            BackendMessage::ErrorResponse { error } => return Err(error.into()),
            other => return Err(unexpected("ParameterDescription", &other)),
        };
        let template = match inb.recv().await? {
            BackendMessage::RowDescription { fields } => Some(Arc::new(RowTemplate::new(&fields))),
            BackendMessage::NoData => None,
            BackendMessage::ErrorResponse { error } => return Err(error.into()),
            other => return Err(unexpected("RowDescription or NoData", &other)),
        };
        Ok(StatementInfo {
            param_types,
            template,
        })
    }

    /// Bind a portal and run its first Execute. With `close_portal` the
    /// portal is closed in the same pipeline (the fast path); otherwise the
    /// caller owns it and keeps issuing [`Self::run_execute_more`].
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_bind_execute(
        &self,
        stmt: &Statement,
        portal: &str,
        params: &[Option<String>],
        row_limit: i32,
        close_portal: bool,
        stdin: Option<CopySource>,
        template: Option<&Arc<RowTemplate>>,
        stdout: &mut Option<CopySink>,
    ) -> Result<RowsOutcome> {
        let frames: Result<(BytesMut, Option<BytesMut>)> = (|| {
            let mut head = BytesMut::new();
            BindMessage {
                portal,
                statement: &stmt.name,
                params,
            }
            .encode(&mut head)?;
            ExecuteMessage { portal, row_limit }.encode(&mut head)?;
            let tail = if close_portal {
                let mut tail = BytesMut::new();
                CloseMessage {
                    kind: b'P',
                    name: portal,
                }
                .encode(&mut tail)?;
                Some(tail)
            } else {
                None
            };
            Ok((head, tail))
        })();

        let (mut inb, write_err) = self.exchange_start(frames, stdin).await;
        if let Some(e) = write_err {
            let _ = self.drain_ready(&mut inb).await;
            return Err(e);
        }
        let result = self.read_bind_rows(&mut inb, template, stdout).await;
        let drained = self.drain_ready(&mut inb).await;
        drop(inb);
        match result {
            Ok(outcome) => drained.map(|_| outcome),
            Err(e) => Err(e),
        }
    }

    /// One more Execute round against an open portal.
    pub(crate) async fn run_execute_more(
        &self,
        portal: &str,
        row_limit: i32,
        template: Option<&Arc<RowTemplate>>,
        stdout: &mut Option<CopySink>,
    ) -> Result<RowsOutcome> {
        let frames: Result<(BytesMut, Option<BytesMut>)> = (|| {
            let mut head = BytesMut::new();
            ExecuteMessage { portal, row_limit }.encode(&mut head)?;
            Ok((head, None))
        })();

        let (mut inb, write_err) = self.exchange_start(frames, None).await;
        if let Some(e) = write_err {
            let _ = self.drain_ready(&mut inb).await;
            return Err(e);
        }
        let result = self.read_rows(&mut inb, template, stdout).await;
        let drained = self.drain_ready(&mut inb).await;
        drop(inb);
        match result {
            Ok(outcome) => drained.map(|_| outcome),
            Err(e) => Err(e),
        }
    }

    /// Best-effort portal reclamation.
    pub(crate) async fn run_close_portal(&self, portal: &str) -> Result<()> {
        self.run_close(b'P', portal).await
    }

    pub(crate) async fn run_close_statement(&self, name: &str) -> Result<()> {
        self.run_close(b'S', name).await
    }

    async fn run_close(&self, kind: u8, name: &str) -> Result<()> {
        let frames: Result<(BytesMut, Option<BytesMut>)> = (|| {
            let mut head = BytesMut::new();
            CloseMessage { kind, name }.encode(&mut head)?;
            Ok((head, None))
        })();

        let (mut inb, write_err) = self.exchange_start(frames, None).await;
        if let Some(e) = write_err {
            let _ = self.drain_ready(&mut inb).await;
            return Err(e);
        }
        let result = loop {
            match inb.recv().await {
                Ok(BackendMessage::CloseComplete) => break Ok(()),
                Ok(BackendMessage::ErrorResponse { error }) => break Err(Error::from(error)),
                Ok(_) => continue,
                Err(e) => break Err(e),
            }
        };
        let drained = self.drain_ready(&mut inb).await;
        drop(inb);
        result.and(drained)
    }

    // ------------------------------------------------------------------
    // Simple queries
    // ------------------------------------------------------------------

    /// Run a (possibly multi-statement) simple query. Yields one row chunk
    /// per result set plus the final command tag. Errors latch until the
    /// session reaches `ReadyForQuery` so the wire stays usable.
    pub(crate) async fn run_simple(
        &self,
        query: &str,
        stdin: Option<CopySource>,
        stdout: &mut Option<CopySink>,
    ) -> Result<(Vec<Vec<Row>>, String)> {
        let frames: Result<(BytesMut, Option<BytesMut>)> = (|| {
            let mut head = BytesMut::new();
            QueryMessage { query }.encode(&mut head)?;
            Ok((head, None))
        })();

        let (mut inb, write_err) = self.exchange_start(frames, stdin).await;
        if let Some(e) = write_err {
            let _ = self.drain_ready(&mut inb).await;
            return Err(e);
        }
        let result = self.read_simple(&mut inb, stdout).await;
        // The Sync appended by the pipeline produces one more ReadyForQuery
        // beyond the one the Query itself elicited.
        let drained = self.drain_ready(&mut inb).await;
        drop(inb);
        match result {
            Ok(v) => drained.map(|_| v),
            Err(e) => Err(e),
        }
    }

    /// Convenience for protocol-internal statements (BEGIN, LISTEN, ...).
    pub(crate) async fn execute_sql(&self, sql: &str) -> Result<String> {
        let mut no_stdout = None;
        let (_, tag) = self.run_simple(sql, None, &mut no_stdout).await?;
        Ok(tag)
    }

    async fn read_simple(
        &self,
        inb: &mut Inbound,
        stdout: &mut Option<CopySink>,
    ) -> Result<(Vec<Vec<Row>>, String)> {
        let mut pending: Option<Error> = None;
        let mut template: Option<Arc<RowTemplate>> = None;
        let mut rows: Vec<Row> = Vec::new();
        let mut chunks: Vec<Vec<Row>> = Vec::new();
        let mut tag = String::new();

        loop {
            match inb.recv().await? {
                BackendMessage::RowDescription { fields } => {
                    template = Some(Arc::new(RowTemplate::new(&fields)));
                    rows = Vec::new();
                }
                BackendMessage::DataRow { columns } => {
                    match self.build_row(template.as_ref(), columns) {
                        Ok(row) => rows.push(row),
                        Err(e) => {
                            pending.get_or_insert(e);
                        }
                    }
                }
                BackendMessage::CommandComplete { tag: t } => {
                    if template.take().is_some() {
                        chunks.push(std::mem::take(&mut rows));
                    }
                    tag = t;
                }
                BackendMessage::EmptyQueryResponse => {}
                BackendMessage::CopyInResponse => {}
                BackendMessage::CopyOutResponse | BackendMessage::CopyBothResponse => {
                    match self.read_copy_out(inb, stdout).await {
                        Ok(Some(t)) => tag = t,
                        Ok(None) => {}
                        Err(e) => {
                            pending.get_or_insert(e);
                        }
                    }
                }
                BackendMessage::CopyData { .. } | BackendMessage::CopyDone => {}
                BackendMessage::ErrorResponse { error } => {
                    pending.get_or_insert(error.into());
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.shared.lock().tx_status = status;
                    return match pending {
                        Some(e) => Err(e),
                        None => Ok((chunks, tag)),
                    };
                }
                other => return Err(unexpected("simple query response", &other)),
            }
        }
    }

    // ------------------------------------------------------------------
    // Row reading
    // ------------------------------------------------------------------

    async fn read_bind_rows(
        &self,
        inb: &mut Inbound,
        template: Option<&Arc<RowTemplate>>,
        stdout: &mut Option<CopySink>,
    ) -> Result<RowsOutcome> {
        match inb.recv().await? {
            BackendMessage::BindComplete => {}
            BackendMessage::ErrorResponse { error } => return Err(error.into()),
            other => return Err(unexpected("BindComplete", &other)),
        }
        self.read_rows(inb, template, stdout).await
    }

    async fn read_rows(
        &self,
        inb: &mut Inbound,
        template: Option<&Arc<RowTemplate>>,
        stdout: &mut Option<CopySink>,
    ) -> Result<RowsOutcome> {
        let mut template = template.cloned();
        let mut rows = Vec::new();
        loop {
            match inb.recv().await? {
                BackendMessage::DataRow { columns } => {
                    rows.push(self.build_row(template.as_ref(), columns)?);
                }
                BackendMessage::CommandComplete { tag } => {
                    return Ok(RowsOutcome {
                        rows,
                        tag,
                        done: true,
                    })
                }
                BackendMessage::PortalSuspended => {
                    return Ok(RowsOutcome {
                        rows,
                        tag: String::new(),
                        done: false,
                    })
                }
                BackendMessage::EmptyQueryResponse => {
                    return Ok(RowsOutcome {
                        rows,
                        tag: String::new(),
                        done: true,
                    })
                }
                BackendMessage::RowDescription { fields } => {
                    template = Some(Arc::new(RowTemplate::new(&fields)));
                }
                BackendMessage::NoData => {}
                BackendMessage::CopyInResponse => {}
                BackendMessage::CopyOutResponse | BackendMessage::CopyBothResponse => {
                    if let Some(tag) = self.read_copy_out(inb, stdout).await? {
                        return Ok(RowsOutcome {
                            rows,
                            tag,
                            done: true,
                        });
                    }
                }
                BackendMessage::CopyData { .. } | BackendMessage::CopyDone => {}
                BackendMessage::ErrorResponse { error } => return Err(error.into()),
                other => return Err(unexpected("row data", &other)),
            }
        }
    }

    /// Forward a `COPY OUT` stream into the sink (or discard it). Returns
    /// the command tag when the copy terminated with `CommandComplete`
    /// directly (the walsender path).
    async fn read_copy_out(
        &self,
        inb: &mut Inbound,
        stdout: &mut Option<CopySink>,
    ) -> Result<Option<String>> {
        loop {
            match inb.recv().await? {
                BackendMessage::CopyData { data } => {
                    if let Some(sink) = stdout.as_mut() {
                        sink.write_all(&data).await?;
                    }
                }
                BackendMessage::CopyDone => {
                    if let Some(sink) = stdout.as_mut() {
                        sink.flush().await?;
                    }
                    return Ok(None);
                }
                BackendMessage::CommandComplete { tag } => {
                    if let Some(sink) = stdout.as_mut() {
                        sink.flush().await?;
                    }
                    return Ok(Some(tag));
                }
                BackendMessage::ErrorResponse { error } => return Err(error.into()),
                other => return Err(unexpected("copy data", &other)),
            }
        }
    }

    fn build_row(
        &self,
        template: Option<&Arc<RowTemplate>>,
        columns: Vec<Option<Bytes>>,
    ) -> Result<Row> {
        let template = template
            .ok_or_else(|| Error::protocol("DataRow without a preceding RowDescription"))?;
        Row::from_wire(Arc::clone(template), columns, &self.codecs)
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    pub(crate) async fn listen(&self, name: &str) -> Result<broadcast::Receiver<Notification>> {
        if let Some(tx) = self.channels.lock().get(name) {
            return Ok(tx.subscribe());
        }
        if self.tx_status() != TransactionStatus::Idle {
            warn!(
                channel = name,
                "LISTEN inside a transaction: the registration disappears if it rolls back"
            );
        }
        self.execute_sql(&format!("LISTEN {}", quote_ident(name)))
            .await?;
        // A concurrent listener may have won the race while we awaited.
        let mut channels = self.channels.lock();
        let tx = channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(128).0);
        Ok(tx.subscribe())
    }

    pub(crate) async fn unlisten(&self, name: &str) -> Result<()> {
        if self.channels.lock().remove(name).is_none() {
            return Err(Error::ChannelClosed(name.to_string()));
        }
        self.execute_sql(&format!("UNLISTEN {}", quote_ident(name)))
            .await?;
        Ok(())
    }
}

fn unexpected(expected: &str, got: &BackendMessage) -> Error {
    Error::protocol(format!("expected {expected}, got {got:?}"))
}

fn log_notice(notice: &ServerError) {
    match notice.severity.as_str() {
        "DEBUG" | "LOG" => debug!(code = %notice.code, "{}", notice.message),
        "INFO" | "NOTICE" => info!(code = %notice.code, "{}", notice.message),
        "WARNING" => warn!(code = %notice.code, "{}", notice.message),
        _ => error!(code = %notice.code, "{}", notice.message),
    }
}

// ============================================================================
// Socket tasks
// ============================================================================

trait Socket: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Socket for T {}

async fn stream_copy_in(out: &Outbound, source: &mut CopySource) -> Result<()> {
    let mut chunk = vec![0u8; COPY_CHUNK];
    loop {
        match source.read(&mut chunk).await {
            Ok(0) => {
                let mut buf = BytesMut::new();
                CopyDoneMessage.encode(&mut buf)?;
                return out.send(buf.freeze()).await;
            }
            Ok(n) => {
                let mut buf = BytesMut::new();
                CopyDataMessage { data: &chunk[..n] }.encode(&mut buf)?;
                out.send(buf.freeze()).await?;
            }
            Err(e) => {
                let mut buf = BytesMut::new();
                CopyFailMessage {
                    message: &e.to_string(),
                }
                .encode(&mut buf)?;
                let _ = out.send(buf.freeze()).await;
                return Err(Error::Io(e));
            }
        }
    }
}

async fn reader_task(
    mut read_half: ReadHalf<Box<dyn Socket>>,
    tx: mpsc::Sender<BackendMessage>,
    wire: Weak<WireInner>,
    generation: u64,
) {
    let mut buf = BytesMut::with_capacity(32 * 1024);
    let reason = loop {
        let msg = match next_message(&mut read_half, &mut buf).await {
            Ok(msg) => msg,
            Err(e) => break e.to_string(),
        };
        let Some(inner) = wire.upgrade() else { return };
        let forwarded = inner.filter_async(msg);
        drop(inner);
        if let Some(msg) = forwarded {
            if tx.send(msg).await.is_err() {
                // The inbound queue was replaced or the wire is gone.
                return;
            }
        }
    };
    drop(tx);
    if let Some(inner) = wire.upgrade() {
        inner.handle_disconnect(generation, &reason);
    }
}

async fn next_message(
    read_half: &mut ReadHalf<Box<dyn Socket>>,
    buf: &mut BytesMut,
) -> Result<BackendMessage> {
    loop {
        if buf.len() >= Header::SIZE {
            let header = Header::parse(&buf[..Header::SIZE])?;
            let total = Header::SIZE + header.body_len();
            if buf.len() >= total {
                let mut frame = buf.split_to(total).freeze();
                frame.advance(Header::SIZE);
                return BackendMessage::decode(header.tag, frame);
            }
            buf.reserve(total - buf.len());
        }
        if read_half.read_buf(buf).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

async fn writer_task(mut write_half: WriteHalf<Box<dyn Socket>>, mut rx: mpsc::Receiver<Bytes>) {
    let mut buf = BytesMut::new();
    while let Some(first) = rx.recv().await {
        buf.clear();
        buf.extend_from_slice(&first);
        // Coalesce whatever else is already queued into the same write.
        while let Ok(more) = rx.try_recv() {
            buf.extend_from_slice(&more);
        }
        if write_half.write_all(&buf).await.is_err() {
            break;
        }
        if write_half.flush().await.is_err() {
            break;
        }
    }
}

async fn reconnect_loop(wire: Weak<WireInner>, delay: Duration) {
    loop {
        tokio::time::sleep(delay).await;
        let Some(inner) = wire.upgrade() else { return };
        if inner.shared.lock().closing {
            inner.shared.lock().reconnecting = false;
            return;
        }
        match inner.connect().await {
            Ok(()) => {
                inner.shared.lock().reconnecting = false;
                return;
            }
            Err(e) => warn!(error = %e, "reconnect attempt failed"),
        }
    }
}

// ============================================================================
// Public facade
// ============================================================================

/// One PostgreSQL connection. Cheap to clone; all clones share the wire.
///
/// Concurrent queries on one wire are pipelined: each takes its turn at the
/// write and read locks in FIFO order, so responses can never cross over.
#[derive(Clone)]
pub struct Wire {
    inner: Arc<WireInner>,
}

impl Wire {
    /// Connect and authenticate.
    pub async fn connect(config: Config) -> Result<Self> {
        let inner = WireInner::new(config);
        inner.connect().await?;
        Ok(Wire { inner })
    }

    /// Build a lazy [`Query`] from a composed fragment.
    pub fn query(&self, fragment: &SqlFragment) -> Query {
        let (text, params) = fragment.format();
        Query::new(Arc::clone(&self.inner), text, params)
    }

    /// Build a lazy [`Query`] from raw text and parameter values.
    pub fn query_raw(&self, text: impl Into<String>, params: Vec<Value>) -> Query {
        Query::new(Arc::clone(&self.inner), text.into(), params)
    }

    /// Open a transaction (or a savepoint when one is already open).
    pub async fn begin(&self) -> Result<Transaction> {
        Transaction::begin(Arc::clone(&self.inner)).await
    }

    /// Subscribe to a notification channel, issuing `LISTEN` on first use.
    pub async fn listen(&self, name: &str) -> Result<Channel> {
        let rx = self.inner.listen(name).await?;
        Ok(Channel {
            name: name.to_string(),
            wire: Arc::clone(&self.inner),
            rx,
        })
    }

    /// Drop a channel registration and issue `UNLISTEN`.
    pub async fn unlisten(&self, name: &str) -> Result<()> {
        self.inner.unlisten(name).await
    }

    /// `SELECT pg_notify($1, $2)`.
    pub async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        self.query_raw(
            "SELECT pg_notify($1, $2)",
            vec![Value::from(channel), Value::from(payload)],
        )
        .execute()
        .await?;
        Ok(())
    }

    /// Current server parameters (`ParameterStatus` accumulation).
    pub fn parameters(&self) -> HashMap<String, String> {
        self.inner.shared.lock().params.clone()
    }

    /// One server parameter.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.inner.shared.lock().params.get(name).cloned()
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.inner.tx_status()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.shared.lock().connected
    }

    /// Number of prepared statements currently cached on this wire.
    pub fn cached_statements(&self) -> usize {
        self.inner.statements.lock().len()
    }

    /// Subscribe to wire events.
    pub fn events(&self) -> broadcast::Receiver<WireEvent> {
        self.inner.events.subscribe()
    }

    /// Ask the server to cancel whatever this wire is running, via a fresh
    /// socket carrying the key data captured at startup.
    pub async fn cancel(&self) -> Result<()> {
        self.inner.cancel().await
    }

    /// Close gracefully. Pending pipelines fail with connection-closed and
    /// no reconnect is scheduled.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

impl std::fmt::Debug for Wire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wire")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// A listened notification channel.
///
/// Registrations survive reconnects: the wire re-issues `LISTEN` for every
/// registered name before letting queries back onto the session.
pub struct Channel {
    name: String,
    wire: Arc<WireInner>,
    rx: broadcast::Receiver<Notification>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next notification, in server delivery order.
    pub async fn recv(&mut self) -> Result<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(n) => return Ok(n),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(channel = %self.name, missed, "notification receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::ChannelClosed(self.name.clone()))
                }
            }
        }
    }

    /// Unsubscribe this channel name entirely.
    pub async fn unlisten(self) -> Result<()> {
        self.wire.unlisten(&self.name).await
    }
}
