//! # tidewire-client
//!
//! The session engine of tidewire: the per-session state machine and token
//! pump, query/RPC/bulk submission, the login handshake including the TLS
//! splice and MARS setup, and the connection orchestrator with retry,
//! failover-partner and routing support.
//!
//! A [`Session`] is single-threaded cooperative with respect to itself:
//! `&mut self` enforces that no two operations on one session are ever in
//! flight. Concurrency comes from MARS: independent sessions of one
//! [`Connection`] run concurrently and serialize at the SMP layer.

pub mod auth;
pub mod bulk;
pub mod config;
pub mod connect;
pub mod error;
pub mod login;
pub mod params;
pub mod results;
pub mod session;
pub mod transaction;

pub use auth::AuthProvider;
pub use bulk::BulkColumn;
pub use config::Config;
pub use connect::{connect, connect_with_auth, Connection, MarsConnection};
pub use error::Error;
pub use params::Params;
pub use session::{Session, SessionState};
