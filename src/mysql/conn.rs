//! A MySQL connection driven by the event loop's reactor.
//!
//! The socket is nonblocking; reads and writes suspend the calling fiber
//! on readiness. One sequence counter per command: reset to 0 before the
//! command is sent, verified and incremented on every packet in both
//! directions. A gap marks the connection broken - the packet stream can
//! no longer be trusted. Every public command acquires the connection's
//! fiber mutex around its full send/receive cycle; without it, two fibers
//! interleaving on one socket would corrupt the sequence counter and the
//! stream itself.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

use mio::net::TcpStream;
use tracing::instrument;

use crate::col::Column;
use crate::constant::{
    CAPABILITIES_ALWAYS_ENABLED, CAPABILITIES_CONFIGURABLE, CapabilityFlags, ServerStatusFlags,
};
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::promise::FiberMutex;
use crate::protocol::command::{
    parse_prepare_ok, write_close_statement, write_execute, write_init_db, write_ping,
    write_prepare, write_query, write_quit, write_reset_statement,
};
use crate::protocol::handshake::{
    AuthSwitchRequest, CachingSha2Continuation, HandshakeResponse, InitialHandshake,
    NATIVE_PASSWORD_PLUGIN, is_auth_continuation, parse_caching_sha2_continuation,
    scramble_for_plugin,
};
use crate::protocol::packet::{MAX_PAYLOAD, write_frames};
use crate::protocol::primitive::Reader;
use crate::protocol::response::{
    ErrPacket, OkPacket, is_eof, is_err, is_result_end, result_end_status,
};
use crate::protocol::resultset::{parse_binary_row, parse_text_row};
use crate::row::{QueryOutcome, ResultSet};
use crate::runtime::Handle;
use crate::runtime::net;
use crate::value::Param;

use super::stmt::Statement;
use super::transaction::IsolationLevel;

/// utf8mb4_general_ci
const DEFAULT_CHARSET: u8 = 45;

const MAX_PACKET_SIZE: u32 = 1 << 24;

struct ConnInner {
    handle: Handle,
    stream: TcpStream,
    mutex: FiberMutex,
    seq: Cell<u8>,
    capabilities: Cell<CapabilityFlags>,
    status: Cell<ServerStatusFlags>,
    server_version: RefCell<String>,
    connection_id: Cell<u32>,
    broken: Cell<bool>,
    in_transaction: Cell<bool>,
    autocommit: Cell<bool>,
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        use std::os::fd::AsRawFd;
        // Any watcher still registered for this socket is now dangling.
        self.handle
            .shared()
            .poller
            .borrow_mut()
            .clear(self.stream.as_raw_fd());
    }
}

/// A MySQL connection. Cheap to clone; all clones share the socket and the
/// command mutex.
#[derive(Clone)]
pub struct Conn {
    inner: Rc<ConnInner>,
}

impl Conn {
    /// Connect and authenticate.
    ///
    /// Accepts anything convertible to [`Opts`], URL strings included:
    ///
    /// ```rs
    /// let conn = Conn::connect(&handle, "mysql://root:pw@localhost:3306/db").await?;
    /// ```
    pub async fn connect<O>(handle: &Handle, opts: O) -> Result<Conn>
    where
        O: TryInto<Opts>,
        Error: From<O::Error>,
    {
        let opts: Opts = opts.try_into()?;
        let connect_timeout = opts.connect_timeout;
        net::timed(handle, connect_timeout, Self::connect_inner(handle, opts)).await
    }

    async fn connect_inner(handle: &Handle, opts: Opts) -> Result<Conn> {
        let host = opts
            .host
            .as_deref()
            .ok_or_else(|| Error::BadConfig("missing host in connection options".into()))?;
        let stream = net::connect(handle, host, opts.port, opts.tcp_nodelay).await?;
        let conn = Conn {
            inner: Rc::new(ConnInner {
                handle: handle.clone(),
                stream,
                mutex: FiberMutex::new(),
                seq: Cell::new(0),
                capabilities: Cell::new(CapabilityFlags::empty()),
                status: Cell::new(ServerStatusFlags::empty()),
                server_version: RefCell::new(String::new()),
                connection_id: Cell::new(0),
                broken: Cell::new(false),
                in_transaction: Cell::new(false),
                autocommit: Cell::new(true),
            }),
        };
        conn.handshake(&opts).await?;
        Ok(conn)
    }

    /// Drive the connection phase: greeting, handshake response, then the
    /// auth exchange (auth switch and caching_sha2 fast path included).
    async fn handshake(&self, opts: &Opts) -> Result<()> {
        let mut payload = Vec::new();
        self.read_payload(&mut payload).await?;
        let greeting = InitialHandshake::parse(&payload)?;

        let mut client = CAPABILITIES_ALWAYS_ENABLED
            | (opts.capabilities & CAPABILITIES_CONFIGURABLE);
        if opts.db.is_some() {
            client |= CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        }
        let negotiated = client & greeting.capabilities;

        let required = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH;
        if !negotiated.contains(required) {
            return Err(Error::Unsupported(format!(
                "server lacks required capabilities (offered {:?})",
                greeting.capabilities
            )));
        }

        self.inner.capabilities.set(negotiated);
        self.inner.connection_id.set(greeting.connection_id);
        *self.inner.server_version.borrow_mut() = greeting.server_version.clone();

        let password = opts.password.as_deref().unwrap_or("");
        let plugin = if greeting.auth_plugin.is_empty() {
            NATIVE_PASSWORD_PLUGIN.to_string()
        } else {
            greeting.auth_plugin.clone()
        };
        let scramble = scramble_for_plugin(&plugin, password, &greeting.nonce)?;

        let mut response = Vec::new();
        HandshakeResponse {
            capabilities: negotiated,
            max_packet_size: MAX_PACKET_SIZE,
            charset: DEFAULT_CHARSET,
            username: &opts.user,
            auth_response: &scramble,
            database: opts.db.as_deref(),
            auth_plugin: &plugin,
        }
        .write(&mut response);
        self.write_payload(&response).await?;

        loop {
            self.read_payload(&mut payload).await?;
            match payload.first() {
                Some(0x00) => {
                    let ok = OkPacket::parse(&payload)?;
                    self.apply_status(ok.status);
                    tracing::debug!(
                        connection_id = self.inner.connection_id.get(),
                        server = %self.inner.server_version.borrow(),
                        "connected"
                    );
                    return Ok(());
                }
                Some(0xFF) => {
                    let err = ErrPacket::parse(&payload)?;
                    return Err(Error::Auth {
                        code: err.code,
                        message: err.message,
                    });
                }
                Some(0xFE) => {
                    let switch = AuthSwitchRequest::parse(&payload)?;
                    let scramble =
                        scramble_for_plugin(&switch.plugin, password, &switch.nonce)?;
                    self.write_payload(&scramble).await?;
                }
                Some(0x01) if is_auth_continuation(&payload) => {
                    match parse_caching_sha2_continuation(&payload)? {
                        CachingSha2Continuation::Success => {}
                        CachingSha2Continuation::FullAuthRequired => {
                            return Err(Error::Unsupported(
                                "caching_sha2_password full authentication (needs TLS or RSA)"
                                    .into(),
                            ));
                        }
                    }
                }
                _ => return Err(self.fail(Error::InvalidPacket)),
            }
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn server_version(&self) -> String {
        self.inner.server_version.borrow().clone()
    }

    pub fn connection_id(&self) -> u32 {
        self.inner.connection_id.get()
    }

    pub fn capabilities(&self) -> CapabilityFlags {
        self.inner.capabilities.get()
    }

    pub fn is_broken(&self) -> bool {
        self.inner.broken.get()
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.in_transaction.get()
    }

    pub fn autocommit(&self) -> bool {
        self.inner.autocommit.get()
    }

    pub(crate) fn handle(&self) -> Handle {
        self.inner.handle.clone()
    }

    fn deprecate_eof(&self) -> bool {
        self.inner
            .capabilities
            .get()
            .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF)
    }

    /// Mark the connection broken on errors that poison the stream.
    fn fail(&self, error: Error) -> Error {
        if error.is_fatal_for_connection() {
            self.inner.broken.set(true);
        }
        error
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.inner.broken.get() {
            Err(Error::from(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection is broken",
            )))
        } else {
            Ok(())
        }
    }

    fn apply_status(&self, status: ServerStatusFlags) {
        self.inner.status.set(status);
        self.inner
            .in_transaction
            .set(status.contains(ServerStatusFlags::SERVER_STATUS_IN_TRANS));
        self.inner
            .autocommit
            .set(status.contains(ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT));
    }

    // ------------------------------------------------------------------
    // Framing
    // ------------------------------------------------------------------

    /// Read one full payload, concatenating 16 MiB continuation packets.
    /// Verifies the sequence id of every packet.
    async fn read_payload(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.clear();
        loop {
            let mut header = [0u8; 4];
            net::read_exact(&self.inner.handle, &self.inner.stream, &mut header)
                .await
                .map_err(|e| self.fail(e))?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            let actual = header[3];
            let expected = self.inner.seq.get();
            if actual != expected {
                return Err(self.fail(Error::SequenceMismatch { expected, actual }));
            }
            self.inner.seq.set(expected.wrapping_add(1));

            let start = buf.len();
            buf.resize(start + len, 0);
            net::read_exact(&self.inner.handle, &self.inner.stream, &mut buf[start..])
                .await
                .map_err(|e| self.fail(e))?;
            if len < MAX_PAYLOAD {
                return Ok(());
            }
        }
    }

    /// Frame and send one payload at the current sequence position.
    #[instrument(skip_all)]
    async fn write_payload(&self, payload: &[u8]) -> Result<()> {
        let mut frames = Vec::with_capacity(payload.len() + 4);
        let next = write_frames(&mut frames, self.inner.seq.get(), payload);
        self.inner.seq.set(next);
        net::write_all(&self.inner.handle, &self.inner.stream, &frames)
            .await
            .map_err(|e| self.fail(e))
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Execute a text-protocol query.
    #[instrument(skip_all)]
    pub async fn query(&self, sql: &str) -> Result<QueryOutcome> {
        let _guard = self.inner.mutex.lock().await;
        self.ensure_usable()?;
        self.inner.seq.set(0);
        let mut cmd = Vec::with_capacity(sql.len() + 1);
        write_query(&mut cmd, sql);
        self.write_payload(&cmd).await?;
        self.read_command_result(false).await
    }

    /// Execute a query and discard any rows.
    pub async fn query_drop(&self, sql: &str) -> Result<()> {
        self.query(sql).await.map(|_| ())
    }

    /// Prepare a statement.
    #[instrument(skip_all)]
    pub async fn prepare(&self, sql: &str) -> Result<Statement> {
        let _guard = self.inner.mutex.lock().await;
        self.ensure_usable()?;
        self.inner.seq.set(0);
        let mut cmd = Vec::with_capacity(sql.len() + 1);
        write_prepare(&mut cmd, sql);
        self.write_payload(&cmd).await?;

        let mut payload = Vec::new();
        self.read_payload(&mut payload).await?;
        if is_err(&payload) {
            return Err(Error::Server(ErrPacket::parse(&payload)?));
        }
        let (statement_id, num_params, num_columns) = {
            let ok = parse_prepare_ok(&payload).map_err(|e| self.fail(e))?;
            (ok.statement_id(), ok.num_params(), ok.num_columns())
        };

        // Parameter then column definition groups; each terminated by an
        // EOF unless DEPRECATE_EOF was negotiated.
        let deprecate_eof = self.deprecate_eof();
        for group_len in [num_params, num_columns] {
            if group_len == 0 {
                continue;
            }
            for _ in 0..group_len {
                self.read_payload(&mut payload).await?;
            }
            if !deprecate_eof {
                self.read_payload(&mut payload).await?;
                if !is_eof(&payload) {
                    return Err(self.fail(Error::InvalidPacket));
                }
            }
        }

        Ok(Statement::new(
            self.clone(),
            statement_id,
            num_params,
            num_columns,
        ))
    }

    /// Execute a prepared statement (binary protocol). The parameter count
    /// is validated before anything touches the wire.
    #[instrument(skip_all)]
    pub(crate) async fn execute_statement(
        &self,
        statement_id: u32,
        param_count: u16,
        params: &[Param],
    ) -> Result<QueryOutcome> {
        if params.len() != param_count as usize {
            return Err(Error::ParamCountMismatch {
                expected: param_count,
                actual: params.len(),
            });
        }
        let _guard = self.inner.mutex.lock().await;
        self.ensure_usable()?;
        self.inner.seq.set(0);
        let mut cmd = Vec::new();
        write_execute(&mut cmd, statement_id, params);
        self.write_payload(&cmd).await?;
        self.read_command_result(true).await
    }

    /// COM_STMT_CLOSE; fire-and-forget on the wire (no response packet).
    pub(crate) async fn close_statement(&self, statement_id: u32) -> Result<()> {
        let _guard = self.inner.mutex.lock().await;
        self.ensure_usable()?;
        self.inner.seq.set(0);
        let mut cmd = Vec::new();
        write_close_statement(&mut cmd, statement_id);
        self.write_payload(&cmd).await
    }

    /// COM_STMT_RESET: discard server-side statement state.
    pub(crate) async fn reset_statement(&self, statement_id: u32) -> Result<()> {
        let _guard = self.inner.mutex.lock().await;
        self.ensure_usable()?;
        self.inner.seq.set(0);
        let mut cmd = Vec::new();
        write_reset_statement(&mut cmd, statement_id);
        self.write_payload(&cmd).await?;
        let mut payload = Vec::new();
        self.read_payload(&mut payload).await?;
        if is_err(&payload) {
            return Err(Error::Server(ErrPacket::parse(&payload)?));
        }
        Ok(())
    }

    /// Switch the default database (COM_INIT_DB).
    pub async fn select_db(&self, db: &str) -> Result<()> {
        let _guard = self.inner.mutex.lock().await;
        self.ensure_usable()?;
        self.inner.seq.set(0);
        let mut cmd = Vec::with_capacity(db.len() + 1);
        write_init_db(&mut cmd, db);
        self.write_payload(&cmd).await?;
        let mut payload = Vec::new();
        self.read_payload(&mut payload).await?;
        if is_err(&payload) {
            return Err(Error::Server(ErrPacket::parse(&payload)?));
        }
        let ok = OkPacket::parse(&payload).map_err(|e| self.fail(e))?;
        self.apply_status(ok.status);
        Ok(())
    }

    /// Liveness check (COM_PING).
    pub async fn ping(&self) -> Result<()> {
        let _guard = self.inner.mutex.lock().await;
        self.ensure_usable()?;
        self.inner.seq.set(0);
        let mut cmd = Vec::new();
        write_ping(&mut cmd);
        self.write_payload(&cmd).await?;
        let mut payload = Vec::new();
        self.read_payload(&mut payload).await?;
        if is_err(&payload) {
            return Err(Error::Server(ErrPacket::parse(&payload)?));
        }
        let ok = OkPacket::parse(&payload).map_err(|e| self.fail(e))?;
        self.apply_status(ok.status);
        Ok(())
    }

    /// COM_QUIT. The connection is unusable afterwards.
    pub async fn quit(&self) -> Result<()> {
        let _guard = self.inner.mutex.lock().await;
        if self.inner.broken.get() {
            return Ok(());
        }
        self.inner.seq.set(0);
        let mut cmd = Vec::new();
        write_quit(&mut cmd);
        let result = self.write_payload(&cmd).await;
        self.inner.broken.set(true);
        result
    }

    /// Restore a connection to a reusable state: roll back a live
    /// transaction and re-enable autocommit.
    pub async fn reset(&self) -> Result<()> {
        if self.inner.in_transaction.get() {
            self.query_drop("ROLLBACK").await?;
            self.inner.in_transaction.set(false);
        }
        if !self.inner.autocommit.get() {
            self.set_autocommit(true).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transaction control
    // ------------------------------------------------------------------

    /// Set the isolation level, then `START TRANSACTION`.
    pub async fn begin_transaction(&self, level: IsolationLevel) -> Result<()> {
        if self.inner.in_transaction.get() {
            return Err(Error::NestedTransaction);
        }
        self.query_drop(&format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            level.as_sql()
        ))
        .await?;
        self.query_drop("START TRANSACTION").await?;
        self.inner.in_transaction.set(true);
        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        self.query_drop("COMMIT").await?;
        self.inner.in_transaction.set(false);
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        self.query_drop("ROLLBACK").await?;
        self.inner.in_transaction.set(false);
        Ok(())
    }

    pub async fn savepoint(&self, name: &str) -> Result<()> {
        self.query_drop(&format!("SAVEPOINT {}", quote_identifier(name)))
            .await
    }

    pub async fn rollback_to(&self, name: &str) -> Result<()> {
        self.query_drop(&format!("ROLLBACK TO SAVEPOINT {}", quote_identifier(name)))
            .await
    }

    pub async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.query_drop(&format!("RELEASE SAVEPOINT {}", quote_identifier(name)))
            .await
    }

    pub async fn set_autocommit(&self, on: bool) -> Result<()> {
        self.query_drop(if on {
            "SET autocommit=1"
        } else {
            "SET autocommit=0"
        })
        .await?;
        self.inner.autocommit.set(on);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Response driving
    // ------------------------------------------------------------------

    /// Read a command response: OK, ERR, or a result set in text or binary
    /// row format.
    async fn read_command_result(&self, binary: bool) -> Result<QueryOutcome> {
        let mut payload = Vec::new();
        self.read_payload(&mut payload).await?;
        if payload.is_empty() {
            return Err(self.fail(Error::InvalidPacket));
        }
        match payload[0] {
            0x00 => {
                let ok = OkPacket::parse(&payload).map_err(|e| self.fail(e))?;
                self.apply_status(ok.status);
                Ok(QueryOutcome::Done(ok.into()))
            }
            0xFF => Err(Error::Server(ErrPacket::parse(&payload)?)),
            0xFB => Err(Error::Unsupported(
                "LOCAL INFILE requests are not supported".into(),
            )),
            _ => {
                let column_count = {
                    let mut r = Reader::new(&payload);
                    r.lenenc_int().map_err(|e| self.fail(e))? as usize
                };
                let deprecate_eof = self.deprecate_eof();

                let mut cols = Vec::with_capacity(column_count);
                for _ in 0..column_count {
                    self.read_payload(&mut payload).await?;
                    cols.push(Column::parse(&payload).map_err(|e| self.fail(e))?);
                }
                if !deprecate_eof {
                    self.read_payload(&mut payload).await?;
                    if !is_eof(&payload) {
                        return Err(self.fail(Error::InvalidPacket));
                    }
                }

                let columns: Rc<[Column]> = cols.into();
                let mut rows = Vec::new();
                loop {
                    self.read_payload(&mut payload).await?;
                    if is_err(&payload) {
                        return Err(Error::Server(ErrPacket::parse(&payload)?));
                    }
                    if is_result_end(&payload, deprecate_eof) {
                        let status = result_end_status(&payload, deprecate_eof)
                            .map_err(|e| self.fail(e))?;
                        self.apply_status(status);
                        break;
                    }
                    let row = if binary {
                        parse_binary_row(&payload, &columns)
                    } else {
                        parse_text_row(&payload, &columns)
                    }
                    .map_err(|e| self.fail(e))?;
                    rows.push(row);
                }
                Ok(QueryOutcome::Rows(ResultSet { columns, rows }))
            }
        }
    }
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}
