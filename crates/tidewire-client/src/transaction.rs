//! Transaction control.
//!
//! On TDS 7.2+ transaction control is a transaction-manager request
//! packet; the server answers BEGIN with an ENVCHANGE carrying the
//! transaction descriptor that all later requests echo in ALL_HEADERS.
//! Older dialects get plain SQL, conditioned on `@@TRANCOUNT` so that a
//! commit after a server-side rollback is not an error.
//!
//! The query timeout is lifted for commit and rollback and restored on
//! every exit path: a transaction-control packet must not be cancelled
//! halfway.

use tidewire_proto::packet::PacketKind;
use tidewire_proto::trans::{encode_begin, encode_commit, encode_rollback, IsolationLevel};
use tidewire_stream::{StreamError, Transport};

use crate::error::{Error, Result};
use crate::session::Session;

impl<T: Transport> Session<T> {
    /// Begin a transaction.
    pub async fn begin_transaction(&mut self, isolation: IsolationLevel) -> Result<()> {
        self.require_idle()?;
        if self.version.is_72_plus() {
            self.start_request();
            let payload = encode_begin(self.env.transaction_descriptor, isolation);
            self.send_request(PacketKind::Trans, &payload).await?;
            self.drain_response().await
        } else {
            let sql = match isolation_sql(isolation) {
                Some(level) => {
                    format!("SET TRANSACTION ISOLATION LEVEL {level}\nBEGIN TRANSACTION")
                }
                None => "BEGIN TRANSACTION".to_owned(),
            };
            self.submit_plain_query(&sql).await?;
            self.drain_response().await
        }
    }

    /// Commit the current transaction.
    pub async fn commit(&mut self) -> Result<()> {
        self.transaction_control(TxControl::Commit).await
    }

    /// Roll back the current transaction.
    pub async fn rollback(&mut self) -> Result<()> {
        self.transaction_control(TxControl::Rollback).await
    }

    async fn transaction_control(&mut self, op: TxControl) -> Result<()> {
        self.require_idle()?;

        // Lift the timeout for the duration; restored on every path.
        let saved = self.query_timeout;
        self.set_query_timeout(None);
        let result = self.transaction_control_inner(op).await;
        self.set_query_timeout(saved);

        match result {
            Ok(()) => Ok(()),
            // A connection torn down mid-commit/rollback carries no
            // information: the transaction is gone either way.
            Err(Error::Stream(StreamError::Io(e))) if is_connection_reset(&e) => {
                tracing::warn!(error = %e, "connection reset during transaction control");
                Ok(())
            }
            Err(Error::Stream(StreamError::ConnectionClosed)) => {
                tracing::warn!("connection closed during transaction control");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn transaction_control_inner(&mut self, op: TxControl) -> Result<()> {
        if self.version.is_72_plus() {
            self.start_request();
            let payload = match op {
                TxControl::Commit => encode_commit(self.env.transaction_descriptor),
                TxControl::Rollback => encode_rollback(self.env.transaction_descriptor),
            };
            self.send_request(PacketKind::Trans, &payload).await?;
            self.drain_response().await
        } else {
            let sql = match op {
                TxControl::Commit => "IF @@TRANCOUNT > 0 COMMIT TRANSACTION",
                TxControl::Rollback => "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION",
            };
            self.submit_plain_query(sql).await?;
            self.drain_response().await
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TxControl {
    Commit,
    Rollback,
}

fn isolation_sql(isolation: IsolationLevel) -> Option<&'static str> {
    match isolation {
        IsolationLevel::Default => None,
        IsolationLevel::ReadUncommitted => Some("READ UNCOMMITTED"),
        IsolationLevel::ReadCommitted => Some("READ COMMITTED"),
        IsolationLevel::RepeatableRead => Some("REPEATABLE READ"),
        IsolationLevel::Serializable => Some("SERIALIZABLE"),
        IsolationLevel::Snapshot => Some("SNAPSHOT"),
    }
}

/// ECONNRESET, EPIPE and ENETRESET are swallowed during commit/rollback.
fn is_connection_reset(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
    ) || e.raw_os_error() == Some(102) // ENETRESET has no stable ErrorKind
}
