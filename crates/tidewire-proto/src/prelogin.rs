//! PRELOGIN negotiation.
//!
//! Pre-login is one packet in each direction carrying TLV-style options.
//! The client announces its protocol version, encryption preference,
//! instance name and MARS intent; the server answers with its version,
//! its encryption stance and, for federated authentication, a nonce.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error::ProtocolError;
use crate::version::TdsVersion;

/// Pre-login option ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreLoginOption {
    /// Protocol / product version.
    Version = 0x00,
    /// Encryption negotiation.
    Encryption = 0x01,
    /// Named-instance validation string.
    Instance = 0x02,
    /// Client thread id, informational.
    ThreadId = 0x03,
    /// MARS support flag.
    Mars = 0x04,
    /// Federated authentication required (TDS 7.4).
    FedAuthRequired = 0x06,
    /// Nonce for federated authentication.
    Nonce = 0x07,
    /// End of the option list.
    Terminator = 0xFF,
}

/// Encryption stance, client preference or server answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionLevel {
    /// Encrypt only the login sequence.
    #[default]
    Off = 0x00,
    /// Encrypt the whole connection.
    On = 0x01,
    /// No TLS available on this side.
    NotSupported = 0x02,
    /// Refuse unencrypted connections.
    Required = 0x03,
}

impl EncryptionLevel {
    /// Create from the wire byte; unknown values read as `Off`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::On,
            0x02 => Self::NotSupported,
            0x03 => Self::Required,
            _ => Self::Off,
        }
    }
}

/// What the transport does after pre-login completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedEncryption {
    /// No TLS at all.
    Plain,
    /// TLS wraps the LOGIN exchange, then unwraps.
    LoginOnly,
    /// TLS wraps the connection for its lifetime.
    Full,
}

/// Client and server could not agree on encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncryptionMismatch {
    /// Client wants TLS, server cannot provide it.
    #[error("server does not support encryption")]
    ServerNotSupported,
    /// Server refuses plaintext, client cannot provide TLS.
    #[error("encryption required by server")]
    RequiredByServer,
}

/// Resolve the client preference against the server's answer.
///
/// The login exchange itself is always encrypted when both sides can do TLS,
/// even for clients that asked for `Off`; only `NotSupported` yields a fully
/// plaintext connection.
pub fn negotiate_encryption(
    client: EncryptionLevel,
    server: EncryptionLevel,
) -> Result<NegotiatedEncryption, EncryptionMismatch> {
    use EncryptionLevel::{NotSupported, Off, On, Required};

    match (client, server) {
        (Off, NotSupported) => Ok(NegotiatedEncryption::Plain),
        (Off, _) => Ok(NegotiatedEncryption::LoginOnly),
        (On | Required, NotSupported) => Err(EncryptionMismatch::ServerNotSupported),
        (On | Required, _) => Ok(NegotiatedEncryption::Full),
        (NotSupported, Off | NotSupported) => Ok(NegotiatedEncryption::Plain),
        (NotSupported, On | Required) => Err(EncryptionMismatch::RequiredByServer),
    }
}

/// A PRELOGIN message, either direction.
#[derive(Debug, Clone, Default)]
pub struct PreLogin {
    /// Version field: the client puts its TDS version here; the server
    /// answers with its product version. Neither side validates the other's.
    pub version: u32,
    /// Sub-build, little-endian trailer of the version option.
    pub sub_build: u16,
    /// Encryption stance.
    pub encryption: EncryptionLevel,
    /// Instance name. The server's echo is not validated.
    pub instance: Option<String>,
    /// Client thread id.
    pub thread_id: Option<u32>,
    /// MARS offered / accepted.
    pub mars: bool,
    /// FEDAUTHREQUIRED option (TDS 7.4).
    pub fed_auth_required: bool,
    /// Server nonce for federated authentication.
    pub nonce: Option<[u8; 32]>,
}

impl PreLogin {
    /// Build the client-side message for a connection attempt.
    #[must_use]
    pub fn client(version: TdsVersion, encryption: EncryptionLevel) -> Self {
        Self {
            version: version.raw(),
            encryption,
            ..Self::default()
        }
    }

    /// Set the instance name option.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the MARS option.
    #[must_use]
    pub fn with_mars(mut self, mars: bool) -> Self {
        self.mars = mars;
        self
    }

    /// Request federated authentication (TDS 7.4).
    #[must_use]
    pub fn with_fed_auth(mut self, fed_auth: bool) -> Self {
        self.fed_auth_required = fed_auth;
        self
    }

    /// Encode into a PRELOGIN packet payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        // Option table entries are 5 bytes each (id + offset:u16 + len:u16),
        // closed by a 1-byte terminator. Offsets are absolute in the payload.
        let mut option_count = 3; // version, encryption, mars
        if self.instance.is_some() {
            option_count += 1;
        }
        if self.thread_id.is_some() {
            option_count += 1;
        }
        if self.fed_auth_required {
            option_count += 1;
        }
        if self.nonce.is_some() {
            option_count += 1;
        }

        let mut table = BytesMut::with_capacity(option_count * 5 + 1);
        let mut data = BytesMut::new();
        let mut offset = (option_count * 5 + 1) as u16;

        let mut put = |table: &mut BytesMut, id: PreLoginOption, body: &[u8]| {
            table.put_u8(id as u8);
            table.put_u16(offset);
            table.put_u16(body.len() as u16);
            data.extend_from_slice(body);
            offset += body.len() as u16;
        };

        let mut version = [0u8; 6];
        version[..4].copy_from_slice(&self.version.to_be_bytes());
        version[4..].copy_from_slice(&self.sub_build.to_le_bytes());
        put(&mut table, PreLoginOption::Version, &version);
        put(&mut table, PreLoginOption::Encryption, &[self.encryption as u8]);

        if let Some(ref instance) = self.instance {
            let mut body = instance.as_bytes().to_vec();
            body.push(0);
            put(&mut table, PreLoginOption::Instance, &body);
        }
        if let Some(thread_id) = self.thread_id {
            put(&mut table, PreLoginOption::ThreadId, &thread_id.to_le_bytes());
        }
        put(&mut table, PreLoginOption::Mars, &[u8::from(self.mars)]);
        if self.fed_auth_required {
            put(&mut table, PreLoginOption::FedAuthRequired, &[0x01]);
        }
        if let Some(ref nonce) = self.nonce {
            put(&mut table, PreLoginOption::Nonce, nonce);
        }

        table.put_u8(PreLoginOption::Terminator as u8);
        table.extend_from_slice(&data);
        table.freeze()
    }

    /// Decode a PRELOGIN payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = payload;
        let mut options = Vec::new();

        loop {
            if cursor.remaining() < 1 {
                return Err(ProtocolError::UnexpectedEof("prelogin option id"));
            }
            let id = cursor.get_u8();
            if id == PreLoginOption::Terminator as u8 {
                break;
            }
            if cursor.remaining() < 4 {
                return Err(ProtocolError::UnexpectedEof("prelogin option entry"));
            }
            let offset = cursor.get_u16() as usize;
            let length = cursor.get_u16() as usize;
            options.push((id, offset, length));
        }

        let mut decoded = Self::default();
        for (id, offset, length) in options {
            let Some(body) = payload.get(offset..offset + length) else {
                // An option pointing outside the payload is ignored, as are
                // ids this client does not know.
                continue;
            };
            match id {
                x if x == PreLoginOption::Version as u8 && length >= 4 => {
                    decoded.version = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                    if length >= 6 {
                        decoded.sub_build = u16::from_le_bytes([body[4], body[5]]);
                    }
                }
                x if x == PreLoginOption::Encryption as u8 && length >= 1 => {
                    decoded.encryption = EncryptionLevel::from_u8(body[0]);
                }
                x if x == PreLoginOption::Instance as u8 && length > 0 => {
                    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
                    if end > 0 {
                        if let Ok(s) = std::str::from_utf8(&body[..end]) {
                            decoded.instance = Some(s.to_owned());
                        }
                    }
                }
                x if x == PreLoginOption::ThreadId as u8 && length >= 4 => {
                    decoded.thread_id =
                        Some(u32::from_le_bytes([body[0], body[1], body[2], body[3]]));
                }
                x if x == PreLoginOption::Mars as u8 && length >= 1 => {
                    decoded.mars = body[0] != 0;
                }
                x if x == PreLoginOption::FedAuthRequired as u8 && length >= 1 => {
                    decoded.fed_auth_required = body[0] != 0;
                }
                x if x == PreLoginOption::Nonce as u8 && length >= 32 => {
                    let mut nonce = [0u8; 32];
                    nonce.copy_from_slice(&body[..32]);
                    decoded.nonce = Some(nonce);
                }
                _ => {}
            }
        }

        Ok(decoded)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn client_message_roundtrip() {
        let msg = PreLogin::client(TdsVersion::V7_4, EncryptionLevel::On)
            .with_instance("SQLEXPRESS")
            .with_mars(true);

        let decoded = PreLogin::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.version, TdsVersion::V7_4.raw());
        assert_eq!(decoded.encryption, EncryptionLevel::On);
        assert_eq!(decoded.instance.as_deref(), Some("SQLEXPRESS"));
        assert!(decoded.mars);
        assert!(!decoded.fed_auth_required);
    }

    #[test]
    fn fed_auth_and_nonce() {
        let mut msg = PreLogin::client(TdsVersion::V7_4, EncryptionLevel::Off).with_fed_auth(true);
        msg.nonce = Some([7u8; 32]);

        let decoded = PreLogin::decode(&msg.encode()).unwrap();
        assert!(decoded.fed_auth_required);
        assert_eq!(decoded.nonce, Some([7u8; 32]));
    }

    #[test]
    fn negotiation_truth_table() {
        use EncryptionLevel::{NotSupported, Off, On, Required};
        use NegotiatedEncryption::{Full, LoginOnly, Plain};

        assert_eq!(negotiate_encryption(Off, Off).unwrap(), LoginOnly);
        assert_eq!(negotiate_encryption(Off, On).unwrap(), LoginOnly);
        assert_eq!(negotiate_encryption(Off, NotSupported).unwrap(), Plain);
        assert_eq!(negotiate_encryption(Off, Required).unwrap(), LoginOnly);

        assert_eq!(negotiate_encryption(On, Off).unwrap(), Full);
        assert_eq!(negotiate_encryption(On, On).unwrap(), Full);
        assert_eq!(
            negotiate_encryption(On, NotSupported).unwrap_err(),
            EncryptionMismatch::ServerNotSupported
        );
        assert_eq!(negotiate_encryption(On, Required).unwrap(), Full);

        assert_eq!(negotiate_encryption(NotSupported, Off).unwrap(), Plain);
        assert_eq!(
            negotiate_encryption(NotSupported, On).unwrap_err(),
            EncryptionMismatch::RequiredByServer
        );
        assert_eq!(
            negotiate_encryption(NotSupported, NotSupported).unwrap(),
            Plain
        );
        assert_eq!(
            negotiate_encryption(NotSupported, Required).unwrap_err(),
            EncryptionMismatch::RequiredByServer
        );
    }

    #[test]
    fn unknown_options_are_skipped() {
        // Option id 0x42 with a body; decoder must ignore it.
        let mut payload = Vec::new();
        payload.push(0x42);
        payload.extend_from_slice(&11u16.to_be_bytes()); // offset past table
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.push(0x01); // encryption
        payload.extend_from_slice(&12u16.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.push(0xFF); // terminator
        payload.push(0xAA); // unknown option body
        payload.push(0x02); // encryption = NotSupported

        let decoded = PreLogin::decode(&payload).unwrap();
        assert_eq!(decoded.encryption, EncryptionLevel::NotSupported);
    }
}
