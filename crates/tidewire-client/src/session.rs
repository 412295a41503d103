//! The per-connection session: state machine, token pump and the
//! query/RPC submission surface.
//!
//! Lifecycle: `New` → (login) `Idle` → `Querying` → `Pending` → `Reading`
//! → `Idle` …; any unrecoverable I/O or framing error parks the session in
//! `Dead`. All transitions happen here. Server-reported errors (syntax,
//! constraint violations) leave the session usable; only interface-class
//! failures kill it.

use std::time::Duration;

use tidewire_proto::batch::encode_batch;
use tidewire_proto::collation::Collation;
use tidewire_proto::packet::PacketKind;
use tidewire_proto::rpc::{ProcId, RpcParam, RpcRequest};
use tidewire_proto::token::{Done, EnvChange, LoginAck, RoutingTarget, ServerMessage, TokenId};
use tidewire_proto::value::Value;
use tidewire_proto::version::TdsVersion;
use tidewire_stream::tokens::{
    read_colmetadata, read_done, read_env_change, read_login_ack, read_nbcrow,
    read_return_value, read_row, read_server_message, read_sspi, read_token_id,
    skip_length_prefixed, ColumnMeta,
};
use tidewire_stream::{StreamError, TdsLink, Transport};

use crate::auth::AuthProvider;
use crate::error::{Error, Result, STATEMENT_TERMINATED};
use crate::params::{substitute, Params};
use crate::results::{ResultSet, TokenState};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, login not yet run.
    New,
    /// Ready for a request.
    Idle,
    /// A request is being written.
    Querying,
    /// A request was sent; the response has not been opened.
    Pending,
    /// The response is being read.
    Reading,
    /// Unrecoverable; the transport is unusable.
    Dead,
}

/// Environment announced by the server via ENVCHANGE.
#[derive(Debug, Default)]
pub struct Environment {
    /// Current database.
    pub database: Option<String>,
    /// Current language.
    pub language: Option<String>,
    /// Session collation for non-Unicode text.
    pub collation: Collation,
    /// Mirroring partner advertised by the server.
    pub mirror_partner: Option<String>,
    /// Redirect received during login.
    pub routing: Option<RoutingTarget>,
    /// Transaction descriptor for ALL_HEADERS; 0 in auto-commit.
    pub transaction_descriptor: u64,
}

/// What one token did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenEvent {
    Metadata,
    Row,
    Done,
    ReturnStatus,
    ReturnValue,
    Env,
    Message,
    LoginAck,
    Auth,
    Skipped,
}

/// One TDS session over a transport.
pub struct Session<T> {
    pub(crate) link: TdsLink<T>,
    pub(crate) state: SessionState,
    pub(crate) version: TdsVersion,
    pub(crate) env: Environment,
    pub(crate) results: ResultSet,
    pub(crate) token: TokenState,
    pub(crate) messages: Vec<ServerMessage>,
    pub(crate) in_cancel: bool,
    pub(crate) spid: u16,
    pub(crate) rows_affected: u64,
    pub(crate) query_timeout: Option<Duration>,
    pub(crate) auth: Option<Box<dyn AuthProvider>>,
    pub(crate) output_order: Vec<u16>,
    pub(crate) login_ack: Option<LoginAck>,
    pub(crate) auth_round: bool,
}

impl<T: Transport> Session<T> {
    /// Create a session that still has to log in.
    pub fn new(link: TdsLink<T>, version: TdsVersion) -> Self {
        Self {
            link,
            state: SessionState::New,
            version,
            env: Environment::default(),
            results: ResultSet::default(),
            token: TokenState::default(),
            messages: Vec::new(),
            in_cancel: false,
            spid: 0,
            rows_affected: 0,
            query_timeout: None,
            auth: None,
            output_order: Vec::new(),
            login_ack: None,
            auth_round: false,
        }
    }

    /// Attach a ready session to an already logged-in connection
    /// (additional MARS sessions share the connection's login).
    pub fn attach(link: TdsLink<T>, version: TdsVersion) -> Self {
        let mut session = Self::new(link, version);
        session.state = SessionState::Idle;
        session
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated TDS version.
    #[must_use]
    pub fn version(&self) -> TdsVersion {
        self.version
    }

    /// Server process id echoed in the current response.
    #[must_use]
    pub fn spid(&self) -> u16 {
        self.spid
    }

    /// Rows affected by the last statement that reported a count.
    #[must_use]
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// Messages accumulated during the current request.
    #[must_use]
    pub fn messages(&self) -> &[ServerMessage] {
        &self.messages
    }

    /// Columns of the current result set.
    #[must_use]
    pub fn columns(&self) -> &[ColumnMeta] {
        &self.results.columns
    }

    /// Stored-procedure return status, once seen.
    #[must_use]
    pub fn return_status(&self) -> Option<i32> {
        self.token.has_status.then_some(self.token.return_status)
    }

    /// Environment announced by the server.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Set the per-read query timeout.
    pub fn set_query_timeout(&mut self, timeout: Option<Duration>) {
        self.query_timeout = timeout;
        self.link.set_read_timeout(timeout);
    }

    /// Take the buffered row.
    pub fn take_row(&mut self) -> Option<Vec<Value>> {
        self.results.take_row()
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    pub(crate) fn require_idle(&self) -> Result<()> {
        match self.state {
            SessionState::Idle => Ok(()),
            SessionState::New => Err(Error::Interface("session has not logged in".into())),
            SessionState::Dead => Err(Error::Interface("session is dead".into())),
            _ => Err(Error::Interface(
                "a previous operation is still in progress".into(),
            )),
        }
    }

    pub(crate) fn start_request(&mut self) {
        self.messages.clear();
        self.token.reset();
        self.results = ResultSet::default();
        self.rows_affected = 0;
        self.output_order.clear();
        self.in_cancel = false;
    }

    pub(crate) async fn send_request(&mut self, kind: PacketKind, payload: &[u8]) -> Result<()> {
        self.state = SessionState::Querying;
        match self.link.send_message(kind, payload).await {
            Ok(()) => {
                self.state = SessionState::Pending;
                Ok(())
            }
            Err(e) => {
                // Writes fail fast; the caller may retry on a fresh
                // connection, this session goes back to Idle.
                self.state = SessionState::Idle;
                Err(e.into())
            }
        }
    }

    /// Submit a plain SQL batch.
    pub async fn submit_plain_query(&mut self, sql: &str) -> Result<()> {
        self.require_idle()?;
        self.start_request();
        tracing::debug!(sql, "submitting batch");
        let payload = encode_batch(sql, self.version, self.env.transaction_descriptor);
        self.send_request(PacketKind::Query, &payload).await
    }

    /// Submit an RPC request.
    pub async fn submit_rpc(&mut self, request: &RpcRequest) -> Result<()> {
        self.require_idle()?;
        self.start_request();
        self.output_order = request
            .params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_output())
            .map(|(i, _)| i as u16)
            .collect();
        let payload = request
            .encode(self.version, self.env.transaction_descriptor)
            .map_err(|e| Error::Data(e.to_string()))?;
        self.send_request(PacketKind::Rpc, &payload).await
    }

    /// Execute SQL, reparameterizing `%s` / `%(name)s` placeholders through
    /// sp_executesql when parameters are present.
    pub async fn execute(&mut self, sql: &str, params: Option<&Params>) -> Result<()> {
        let Some(params) = params.filter(|p| !p.is_empty()) else {
            return self.submit_plain_query(sql).await;
        };
        let bound = substitute(sql, params)?;
        let declarations = bound.declarations(self.version);
        let mut request = RpcRequest::internal(ProcId::ExecuteSql)
            .with_param(RpcParam::input(
                "",
                Value::from(bound.sql.clone()),
                self.version,
            ))
            .with_param(RpcParam::input("", Value::from(declarations), self.version));
        for (i, value) in bound.values.iter().enumerate() {
            request = request.with_param(RpcParam::input(
                format!("@P{}", i + 1),
                value.clone(),
                self.version,
            ));
        }
        self.submit_rpc(&request).await
    }

    /// Execute once per parameter set, accumulating row counts.
    pub async fn executemany(&mut self, sql: &str, seq: &[Params]) -> Result<u64> {
        let mut total = 0;
        for params in seq {
            self.execute(sql, Some(params)).await?;
            self.drain_response().await?;
            total += self.rows_affected;
        }
        self.rows_affected = total;
        Ok(total)
    }

    /// Execute and return the first column of the first row.
    pub async fn execute_scalar(
        &mut self,
        sql: &str,
        params: Option<&Params>,
    ) -> Result<Option<Value>> {
        self.execute(sql, params).await?;
        let mut scalar = None;
        if self.find_result_or_done().await? && self.next_row().await? {
            scalar = self.take_row().and_then(|row| row.into_iter().next());
        }
        self.drain_response().await?;
        Ok(scalar)
    }

    /// Call a stored procedure. Returns true when a result set is ready.
    pub async fn callproc(&mut self, name: &str, params: Vec<RpcParam>) -> Result<bool> {
        let mut request = RpcRequest::named(name);
        for param in params {
            request = request.with_param(param);
        }
        self.submit_rpc(&request).await?;
        self.process_rpc().await
    }

    /// Drain the rest of the response and return output-parameter values
    /// in declaration order. Further row fetches fail fast afterwards.
    pub async fn get_proc_outputs(&mut self) -> Result<Vec<Value>> {
        self.token.skipped_to_status = true;
        self.drain_response().await?;
        let order = self.output_order.clone();
        Ok(order
            .iter()
            .map(|ordinal| {
                self.token
                    .output_params
                    .get(ordinal)
                    .map_or(Value::Null, |rv| rv.value.clone())
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Response traversal
    // ------------------------------------------------------------------

    /// Open the server response if it has not been opened yet.
    pub(crate) async fn ensure_reading(&mut self) -> Result<()> {
        if self.state == SessionState::Pending {
            let (kind, spid) = self.link.begin_response().await.map_err(|e| self.kill(e))?;
            if kind != PacketKind::Reply {
                return Err(self.kill(StreamError::InvalidState(
                    "response packet is not a tabular reply",
                )));
            }
            self.spid = spid;
            self.state = SessionState::Reading;
        }
        Ok(())
    }

    fn kill(&mut self, err: StreamError) -> Error {
        // A timed-out read is not fatal: the cancel path recovers it.
        if !matches!(err, StreamError::ReadTimeout) {
            self.state = SessionState::Dead;
        }
        Error::Stream(err)
    }

    /// Pump until a COLMETADATA (true) or the response's final DONE
    /// (false). Intermediate DONEs carrying MORE and COUNT preserve their
    /// row count for `rows_affected`.
    pub async fn find_result_or_done(&mut self) -> Result<bool> {
        self.fail_if_skipped()?;
        loop {
            if self.state == SessionState::Idle {
                return Ok(false);
            }
            match self.pump().await? {
                TokenEvent::Metadata => return Ok(true),
                TokenEvent::Done => {
                    if self.state == SessionState::Idle {
                        return Ok(false);
                    }
                }
                _ => {}
            }
        }
    }

    /// Variant of [`Session::find_result_or_done`] for RPC responses:
    /// count-less DONEs inside the procedure are passed over without
    /// touching `rows_affected`.
    pub async fn process_rpc(&mut self) -> Result<bool> {
        self.find_result_or_done().await
    }

    /// Pump until the next ROW/NBCROW (true, row buffered) or the DONE
    /// closing the current result set (false).
    pub async fn next_row(&mut self) -> Result<bool> {
        self.fail_if_skipped()?;
        if self.in_cancel || self.state == SessionState::Idle {
            return Ok(false);
        }
        loop {
            match self.pump().await? {
                TokenEvent::Row => return Ok(true),
                TokenEvent::Done | TokenEvent::Metadata => return Ok(false),
                _ => {}
            }
        }
    }

    /// Advance to the next result set. Returns false when the response
    /// carries no further sets.
    pub async fn next_set(&mut self) -> Result<bool> {
        self.fail_if_skipped()?;
        if self.state == SessionState::Idle {
            return Ok(false);
        }
        loop {
            match self.pump().await? {
                TokenEvent::Metadata => return Ok(true),
                TokenEvent::Done if self.state == SessionState::Idle => return Ok(false),
                _ => {}
            }
        }
    }

    /// Pump until RETURNSTATUS. Further row fetches fail fast.
    pub async fn find_return_status(&mut self) -> Result<i32> {
        self.token.skipped_to_status = true;
        while !self.token.has_status {
            if self.state == SessionState::Idle {
                return Err(Error::Interface(
                    "response ended without a return status".into(),
                ));
            }
            self.pump().await?;
        }
        Ok(self.token.return_status)
    }

    /// Consume the rest of the response.
    pub async fn drain_response(&mut self) -> Result<()> {
        while matches!(self.state, SessionState::Pending | SessionState::Reading) {
            self.pump().await?;
        }
        Ok(())
    }

    fn fail_if_skipped(&self) -> Result<()> {
        if self.token.skipped_to_status {
            Err(Error::Interface(
                "rows are no longer available after reading procedure outputs".into(),
            ))
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Cancel the in-flight request, if any, and drain to the
    /// acknowledging DONE. The session returns to Idle.
    pub async fn cancel_if_pending(&mut self) -> Result<()> {
        match self.state {
            SessionState::Idle | SessionState::New | SessionState::Dead => Ok(()),
            _ => {
                self.link.send_cancel().await.map_err(|e| self.kill(e))?;
                self.in_cancel = true;
                self.drain_cancel().await
            }
        }
    }

    async fn drain_cancel(&mut self) -> Result<()> {
        while self.in_cancel {
            self.ensure_reading().await?;
            self.process_token().await?;
        }
        self.state = SessionState::Idle;
        Ok(())
    }

    // ------------------------------------------------------------------
    // The token pump
    // ------------------------------------------------------------------

    /// Process one token, handling read timeouts by cancelling.
    pub(crate) async fn pump(&mut self) -> Result<TokenEvent> {
        self.ensure_reading().await?;
        match self.process_token().await {
            Ok(event) => Ok(event),
            Err(Error::Stream(StreamError::ReadTimeout)) => {
                tracing::debug!("query timed out; sending attention");
                self.link.send_cancel().await.map_err(|e| self.kill(e))?;
                self.in_cancel = true;
                // The server finishes the response (or starts one, if the
                // timeout hit before its first packet) with an
                // attention-acknowledging DONE; drain to it.
                self.drain_cancel().await?;
                Err(Error::Timeout)
            }
            Err(e) => Err(e),
        }
    }

    /// Read and dispatch exactly one token.
    pub(crate) async fn process_token(&mut self) -> Result<TokenEvent> {
        let id = match read_token_id(&mut self.link).await {
            Ok(id) => id,
            Err(e) => return Err(self.kill_stream(e)),
        };
        match id {
            TokenId::ColMetaData => {
                let columns = match read_colmetadata(&mut self.link, self.version).await {
                    Ok(c) => c,
                    Err(e) => return Err(self.kill_stream(e)),
                };
                self.results.reset(columns);
                Ok(TokenEvent::Metadata)
            }
            TokenId::Row => {
                let row = match read_row(&mut self.link, &self.results.columns).await {
                    Ok(row) => row,
                    Err(e) => return Err(self.kill_stream(e)),
                };
                self.token.more_rows = true;
                self.results.row = Some(row);
                Ok(TokenEvent::Row)
            }
            TokenId::NbcRow => {
                if !self.version.is_73_plus() {
                    return Err(self.kill(StreamError::InvalidState(
                        "NBCROW before TDS 7.3",
                    )));
                }
                let row = match read_nbcrow(&mut self.link, &self.results.columns).await {
                    Ok(row) => row,
                    Err(e) => return Err(self.kill_stream(e)),
                };
                self.token.more_rows = true;
                self.results.row = Some(row);
                Ok(TokenEvent::Row)
            }
            TokenId::ReturnStatus => {
                let status = match self.link.read_i32().await {
                    Ok(v) => v,
                    Err(e) => return Err(self.kill_stream(e)),
                };
                self.token.has_status = true;
                self.token.return_status = status;
                Ok(TokenEvent::ReturnStatus)
            }
            TokenId::ReturnValue => {
                let rv = match read_return_value(&mut self.link, self.version).await {
                    Ok(rv) => rv,
                    Err(e) => return Err(self.kill_stream(e)),
                };
                let ordinal = if self.version.is_72_plus() {
                    rv.ordinal
                } else {
                    // Pre-7.2 servers do not number output parameters;
                    // correlate by arrival order against the request.
                    self.output_order
                        .get(self.token.return_value_index as usize)
                        .copied()
                        .unwrap_or(self.token.return_value_index)
                };
                self.token.return_value_index += 1;
                self.token.output_params.insert(ordinal, rv);
                Ok(TokenEvent::ReturnValue)
            }
            TokenId::EnvChange => {
                let change = match read_env_change(&mut self.link).await {
                    Ok(c) => c,
                    Err(e) => return Err(self.kill_stream(e)),
                };
                self.apply_env_change(change);
                Ok(TokenEvent::Env)
            }
            TokenId::Info | TokenId::Error => {
                let message = match read_server_message(
                    &mut self.link,
                    id == TokenId::Error,
                    self.version,
                )
                .await
                {
                    Ok(m) => m,
                    Err(e) => return Err(self.kill_stream(e)),
                };
                tracing::debug!(
                    number = message.number,
                    class = message.class,
                    text = %message.message,
                    "server message"
                );
                self.messages.push(message);
                Ok(TokenEvent::Message)
            }
            TokenId::LoginAck => {
                let ack = match read_login_ack(&mut self.link).await {
                    Ok(a) => a,
                    Err(e) => return Err(self.kill_stream(e)),
                };
                if let Some(version) = ack.tds_version {
                    self.version = version;
                }
                tracing::debug!(version = %self.version, server = %ack.prog_name, "login acknowledged");
                self.login_ack = Some(ack);
                Ok(TokenEvent::LoginAck)
            }
            TokenId::Order | TokenId::TabName | TokenId::ColInfo => {
                if let Err(e) = skip_length_prefixed(&mut self.link).await {
                    return Err(self.kill_stream(e));
                }
                Ok(TokenEvent::Skipped)
            }
            TokenId::FedAuthInfo => {
                // DWORD length, then opaque data for the auth capability.
                let len = match self.link.read_u32().await {
                    Ok(v) => v as usize,
                    Err(e) => return Err(self.kill_stream(e)),
                };
                if let Err(e) = self.link.read_bytes(len).await {
                    return Err(self.kill_stream(e));
                }
                Ok(TokenEvent::Skipped)
            }
            TokenId::Sspi => {
                let challenge = match read_sspi(&mut self.link).await {
                    Ok(c) => c,
                    Err(e) => return Err(self.kill_stream(e)),
                };
                self.auth_round = true;
                if let Some(auth) = self.auth.as_mut() {
                    if let Some(response) = auth.handle_next(challenge) {
                        self.link
                            .send_message(PacketKind::Auth, &response)
                            .await
                            .map_err(|e| self.kill(e))?;
                    }
                }
                Ok(TokenEvent::Auth)
            }
            TokenId::Done | TokenId::DoneProc | TokenId::DoneInProc => {
                let done = match read_done(&mut self.link, id, self.version).await {
                    Ok(d) => d,
                    Err(e) => return Err(self.kill_stream(e)),
                };
                self.handle_done(done)?;
                Ok(TokenEvent::Done)
            }
        }
    }

    fn kill_stream(&mut self, err: StreamError) -> Error {
        // Protocol-grammar and transport failures are fatal; the stream
        // position is unknowable afterwards. Timeouts recover via cancel.
        if !matches!(err, StreamError::ReadTimeout) {
            self.state = SessionState::Dead;
        }
        Error::Stream(err)
    }

    fn handle_done(&mut self, done: Done) -> Result<()> {
        self.token.more_rows = false;
        self.token.last_done = Some(done);

        if done.status.contains(tidewire_proto::token::DoneStatus::COUNT) {
            self.rows_affected = done.row_count;
        }
        if done.cancelled() {
            self.in_cancel = false;
        }
        if !done.more() {
            // Final completion of the response.
            self.state = SessionState::Idle;
        }
        if done
            .status
            .contains(tidewire_proto::token::DoneStatus::ERROR)
            && !done.cancelled()
            && !self.in_cancel
        {
            return Err(self.take_last_error());
        }
        Ok(())
    }

    /// The last accumulated error message, classified; 3621 is elided.
    fn take_last_error(&mut self) -> Error {
        let last = self
            .messages
            .iter()
            .rev()
            .find(|m| m.is_error && m.number != STATEMENT_TERMINATED);
        match last {
            Some(message) => Error::from_server_message(message),
            None => Error::Operational {
                number: 0,
                message: "statement failed with no server message".into(),
            },
        }
    }

    fn apply_env_change(&mut self, change: EnvChange) {
        match change {
            EnvChange::Database { new, .. } => self.env.database = Some(new),
            EnvChange::Language { new } => self.env.language = Some(new),
            EnvChange::PacketSize { size } => {
                tracing::debug!(size, "server changed packet size");
                self.link.set_block_size(size as usize);
            }
            EnvChange::Collation { new } => {
                if let Some(collation) = new {
                    self.env.collation = collation;
                }
            }
            EnvChange::BeginTransaction { descriptor } => {
                self.env.transaction_descriptor = descriptor;
            }
            EnvChange::CommitTransaction | EnvChange::RollbackTransaction => {
                self.env.transaction_descriptor = 0;
            }
            EnvChange::MirrorPartner { server } => self.env.mirror_partner = Some(server),
            EnvChange::Routing(target) => {
                tracing::debug!(host = %target.host, port = target.port, "routing requested");
                self.env.routing = Some(target);
            }
            EnvChange::Other { kind } => {
                tracing::trace!(kind, "ignoring envchange");
            }
        }
    }
}

