//! Connection establishment: pre-login, TLS splice, MARS setup, login,
//! retry with backoff, failover partner rotation and routing.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

use tidewire_proto::packet::PacketKind;
use tidewire_proto::prelogin::{
    negotiate_encryption, EncryptionLevel, NegotiatedEncryption, PreLogin,
};
use tidewire_proto::token::RoutingTarget;
use tidewire_proto::version::TdsVersion;
use tidewire_stream::browser::resolve_instance;
use tidewire_stream::{
    splice_handshake, SmpManager, SmpStream, TdsLink, TdsTransport, TlsSettings, Transport,
};

use crate::auth::AuthProvider;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::login::LoginOutcome;
use crate::session::Session;

/// An established connection: one session, or a MARS multiplexer with a
/// main session and the ability to open more.
pub enum Connection {
    /// Single session over the physical transport.
    Plain(Session<TdsTransport>),
    /// MARS: sessions multiplexed over one transport.
    Mars(MarsConnection),
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("Connection::Plain"),
            Self::Mars(_) => f.write_str("Connection::Mars"),
        }
    }
}

impl Connection {
    /// True when MARS was negotiated.
    #[must_use]
    pub fn is_mars(&self) -> bool {
        matches!(self, Self::Mars(_))
    }
}

/// A MARS-enabled connection.
pub struct MarsConnection {
    manager: SmpManager<TdsTransport>,
    /// The session the login ran on.
    pub main: Session<SmpStream<TdsTransport>>,
    version: TdsVersion,
    block_size: usize,
}

impl MarsConnection {
    /// Open an additional session sharing the connection's login.
    pub async fn new_session(&self) -> Result<Session<SmpStream<TdsTransport>>> {
        let stream = self.manager.open_session().await?;
        Ok(Session::attach(
            TdsLink::with_block_size(stream, self.block_size),
            self.version,
        ))
    }
}

// ---------------------------------------------------------------------
// Retry schedule (pure)
// ---------------------------------------------------------------------

/// Per-attempt time budget: starts at 8% of the total and grows by
/// another 8% each round.
#[must_use]
pub fn attempt_timeout(total: Duration, round: u32) -> Duration {
    total.mul_f64(0.08 * f64::from(round + 1))
}

/// Inter-attempt delay: starts at 200ms and doubles up to a 1s cap.
#[must_use]
pub fn attempt_delay(round: u32) -> Duration {
    let millis = 200u64.saturating_mul(1u64 << round.min(8));
    Duration::from_millis(millis.min(1000))
}

// ---------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------

/// Connect using the configuration's credentials, driving the full
/// pre-login / login / post-login sequence with retries, failover
/// rotation and one routing hop.
pub async fn connect(config: &Config) -> Result<Connection> {
    let deadline = Instant::now() + config.login_timeout;

    let mut servers: VecDeque<String> = VecDeque::new();
    servers.push_back(config.server.clone());
    if let Some(partner) = &config.failover_partner {
        servers.push_back(partner.clone());
    }

    let mut round = 0u32;
    loop {
        let server = servers
            .front()
            .cloned()
            .unwrap_or_else(|| config.server.clone());
        let budget = attempt_timeout(config.login_timeout, round);
        let remaining = deadline.saturating_duration_since(Instant::now());
        let budget = budget.min(remaining);

        let attempt = timeout(budget, connect_once(config, &server, None, true));
        let outcome = match attempt.await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };

        match outcome {
            Ok(connection) => return Ok(connection),
            Err(e) if e.suppresses_retry() => return Err(e),
            Err(e) => {
                let delay = attempt_delay(round);
                if Instant::now() + delay >= deadline {
                    return Err(e);
                }
                tracing::debug!(server = %server, round, error = %e, "connect attempt failed");
                sleep(delay).await;
                servers.rotate_left(1);
                round += 1;
            }
        }
    }
}

/// A single connect attempt with an explicit auth capability. No retry
/// loop: auth providers are stateful and not reusable across attempts.
pub async fn connect_with_auth(
    config: &Config,
    auth: Box<dyn AuthProvider>,
) -> Result<Connection> {
    connect_once(config, &config.server.clone(), Some(auth), true).await
}

/// One attempt against one server, following at most one routing hop.
async fn connect_once(
    config: &Config,
    server: &str,
    auth: Option<Box<dyn AuthProvider>>,
    allow_routing: bool,
) -> Result<Connection> {
    let port = match config.port {
        Some(port) => port,
        None => match &config.instance {
            Some(instance) => {
                resolve_instance(server, instance, Duration::from_secs(1)).await?
            }
            None => 1433,
        },
    };

    let tcp = TcpStream::connect((server, port))
        .await
        .map_err(|e| Error::Interface(format!("cannot reach {server}:{port}: {e}")))?;
    tcp.set_nodelay(true)
        .map_err(|e| Error::Interface(e.to_string()))?;

    match establish(config, server, tcp, auth).await? {
        Established::Ready(connection) => Ok(connection),
        Established::Routed(target) => {
            if !allow_routing {
                return Err(Error::Interface(
                    "server routed more than once".into(),
                ));
            }
            tracing::debug!(host = %target.host, port = target.port, "following route");
            let mut routed = config.clone();
            routed.port = Some(target.port);
            routed.instance = None;
            let routed_server = target.host.clone();
            Box::pin(connect_once(&routed, &routed_server, None, false)).await
        }
    }
}

enum Established {
    Ready(Connection),
    Routed(RoutingTarget),
}

/// Pre-login, TLS splice, MARS wrap, LOGIN7, post-login `USE`.
async fn establish(
    config: &Config,
    server: &str,
    tcp: TcpStream,
    auth: Option<Box<dyn AuthProvider>>,
) -> Result<Established> {
    let mut link = TdsLink::with_block_size(TdsTransport::Plain(tcp), config.block_size);

    // The client's wire preference: "login only" is requested as Off.
    let preference = if config.enc_login_only {
        EncryptionLevel::Off
    } else {
        config.encryption
    };
    let fed_auth = config.tds_version.is_74_plus()
        && auth.as_ref().is_some_and(|a| a.fed_auth());

    let mut prelogin = PreLogin::client(config.tds_version, preference).with_mars(config.use_mars);
    if let Some(instance) = &config.instance {
        prelogin = prelogin.with_instance(instance.clone());
    }
    if fed_auth {
        prelogin = prelogin.with_fed_auth(true);
    }

    link.send_message(PacketKind::PreLogin, &prelogin.encode())
        .await?;
    let (_, _) = link.begin_response().await?;
    let mut response = Vec::new();
    while !link.stream_finished() {
        let chunk = link.read_whole_packet().await?;
        response.extend_from_slice(&chunk);
    }
    let server_reply = PreLogin::decode(&response)?;
    // The echoed instance name is informational only and not validated.

    let negotiated = negotiate_encryption(preference, server_reply.encryption)
        .map_err(|e| Error::Interface(e.to_string()))?;
    let mars = config.use_mars && server_reply.mars;

    let link = match negotiated {
        NegotiatedEncryption::Plain => link,
        NegotiatedEncryption::LoginOnly | NegotiatedEncryption::Full => {
            if mars && negotiated == NegotiatedEncryption::LoginOnly {
                return Err(Error::Interface(
                    "login-only encryption cannot be combined with MARS".into(),
                ));
            }
            let (transport, state) = link.into_parts();
            let tcp = match transport {
                TdsTransport::Plain(tcp) => tcp,
                TdsTransport::Tls(_) => {
                    return Err(Error::Interface("transport already encrypted".into()));
                }
            };
            let settings = TlsSettings {
                validate_certificate: config.validate_host,
                ca_file: config.cafile.clone(),
                server_name: None,
            };
            let tls = splice_handshake(tcp, server, &settings).await?;
            TdsLink::from_parts(TdsTransport::Tls(Box::new(tls)), state)
        }
    };

    if mars {
        let block_size = link.block_size();
        let (transport, _state) = link.into_parts();
        let manager = SmpManager::new(transport);
        let stream = manager.open_session().await?;
        let mut session = Session::new(
            TdsLink::with_block_size(stream, block_size),
            config.tds_version,
        );
        match session.run_login(config, auth).await? {
            LoginOutcome::Routed(target) => return Ok(Established::Routed(target)),
            LoginOutcome::LoggedIn => {}
        }
        finish_login(&mut session, config).await?;
        let version = session.version();
        let block_size = session.link.block_size();
        return Ok(Established::Ready(Connection::Mars(MarsConnection {
            manager,
            main: session,
            version,
            block_size,
        })));
    }

    let mut session = Session::new(link, config.tds_version);
    match session.run_login(config, auth).await? {
        LoginOutcome::Routed(target) => return Ok(Established::Routed(target)),
        LoginOutcome::LoggedIn => {}
    }

    // "Encrypt login only": drop back to plaintext now that LOGIN is done.
    let mut session = if negotiated == NegotiatedEncryption::LoginOnly {
        session.downgrade_transport()
    } else {
        session
    };
    finish_login(&mut session, config).await?;
    Ok(Established::Ready(Connection::Plain(session)))
}

/// Post-login housekeeping shared by both transport shapes.
async fn finish_login<T: Transport>(session: &mut Session<T>, config: &Config) -> Result<()> {
    session.set_query_timeout(config.query_timeout);
    if let Some(database) = &config.database {
        let current = session.environment().database.clone();
        if current.as_deref() != Some(database.as_str()) {
            session
                .submit_plain_query(&format!("USE [{database}]"))
                .await?;
            session.drain_response().await?;
        }
    }
    Ok(())
}

impl Session<TdsTransport> {
    /// Strip the TLS wrapper after a login-only encrypted exchange.
    #[must_use]
    pub fn downgrade_transport(self) -> Self {
        let Session {
            link,
            state,
            version,
            env,
            results,
            token,
            messages,
            in_cancel,
            spid,
            rows_affected,
            query_timeout,
            auth,
            output_order,
            login_ack,
            auth_round,
        } = self;
        Self {
            link: link.map_transport(TdsTransport::unwrap_tls),
            state,
            version,
            env,
            results,
            token,
            messages,
            in_cancel,
            spid,
            rows_affected,
            query_timeout,
            auth,
            output_order,
            login_ack,
            auth_round,
        }
    }
}
