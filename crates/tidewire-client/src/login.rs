//! The LOGIN7 exchange.
//!
//! Pre-login and transport setup live in [`crate::connect`]; this module
//! drives the LOGIN7 message and the post-login token pump: SSPI
//! challenge rounds, LOGINACK, the environment ENVCHANGEs, and the final
//! DONE. A routing ENVCHANGE terminates login early; the orchestrator
//! reconnects to the redirect target.

use bytes::{BufMut, Bytes, BytesMut};
use tidewire_proto::login7::{FedAuthLibrary, Login7};
use tidewire_proto::packet::PacketKind;
use tidewire_proto::token::RoutingTarget;
use tidewire_stream::Transport;

use crate::auth::AuthProvider;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::{Session, SessionState};

/// How the login exchange ended.
#[derive(Debug)]
pub enum LoginOutcome {
    /// The session is authenticated and Idle.
    LoggedIn,
    /// The server redirected; reconnect to the target.
    Routed(RoutingTarget),
}

/// Build the LOGIN7 message from the configuration.
pub(crate) fn build_login7(config: &Config, sspi: Option<Bytes>, fed_auth: bool) -> Login7 {
    let mut login = Login7::new(config.tds_version, config.block_size as u32);
    login.client_host_name = config.client_host.clone();
    login.user_name = config.user.clone().unwrap_or_default();
    login.password = config.password.clone().unwrap_or_default();
    login.app_name = config.app_name.clone();
    login.server_name = config.server.clone();
    login.language = config.language.clone().unwrap_or_default();
    login.database = config.database.clone().unwrap_or_default();
    login.client_lcid = config.client_lcid;
    login.client_time_zone = config.client_time_zone;
    login.type_flags.read_only_intent = config.readonly;
    login.sspi = sspi;
    if fed_auth {
        login.fed_auth = Some((FedAuthLibrary::SecurityToken, true));
    }
    login
}

impl<T: Transport> Session<T> {
    /// Send LOGIN7 and pump the response(s) until the server acknowledges
    /// the login, fails it, or routes us elsewhere.
    pub(crate) async fn run_login(
        &mut self,
        config: &Config,
        mut auth: Option<Box<dyn AuthProvider>>,
    ) -> Result<LoginOutcome> {
        let mut sspi = None;
        let mut fed_token = None;
        if let Some(provider) = auth.as_mut() {
            if provider.fed_auth() {
                fed_token = Some(provider.create_packet());
            } else {
                sspi = Some(provider.create_packet());
            }
        }
        let login = build_login7(config, sspi, fed_token.is_some());
        self.auth = auth;
        self.start_request();

        self.state = SessionState::Querying;
        self.link
            .send_message(PacketKind::Login, &login.encode())
            .await?;

        if let Some(token) = fed_token {
            let mut payload = BytesMut::with_capacity(4 + token.len());
            payload.put_u32_le(token.len() as u32);
            payload.put_slice(&token);
            self.link
                .send_message(PacketKind::FedAuthToken, &payload)
                .await?;
        }
        self.state = SessionState::Pending;

        loop {
            self.auth_round = false;
            self.ensure_reading().await?;
            while self.state == SessionState::Reading {
                self.process_token().await?;
            }

            if let Some(target) = self.env.routing.clone() {
                // The auth capability is done with regardless of outcome.
                self.auth = None;
                return Ok(LoginOutcome::Routed(target));
            }
            if self.login_ack.is_some() {
                self.auth = None;
                self.state = SessionState::Idle;
                tracing::debug!(spid = self.spid, version = %self.version, "logged in");
                return Ok(LoginOutcome::LoggedIn);
            }
            if self.auth_round {
                // The SSPI exchange continues in another response.
                self.state = SessionState::Pending;
                continue;
            }
            self.auth = None;
            return Err(Error::Login {
                number: 0,
                message: "login ended without acknowledgment".into(),
            });
        }
    }
}
