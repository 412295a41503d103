//! LOGIN7 packet construction.
//!
//! The LOGIN7 message carries client identity, credentials and connection
//! options. Layout per MS-TDS 2.2.6.4: a 94-byte fixed header, an
//! offset/length table pointing into a variable-length UCS-2 string
//! section, a 6-byte client id in the middle of the table, and an optional
//! feature-extension block.
//!
//! The password is obfuscated, not encrypted: nibbles swapped, bytes XORed
//! with 0xA5. TLS is what actually protects the exchange.

use bytes::{BufMut, Bytes, BytesMut};

use crate::version::TdsVersion;

/// Size of the LOGIN7 fixed header.
pub const LOGIN7_HEADER_LEN: usize = 94;

/// Option flags 1 (byte 24 of the fixed header).
#[derive(Debug, Clone, Copy)]
pub struct OptionFlags1 {
    /// Warn when a USE statement changes the database.
    pub use_db_notify: bool,
    /// Fail login if the initial database is unavailable.
    pub database_fatal: bool,
    /// Warn when SET LANGUAGE changes the language.
    pub set_lang_warn: bool,
    /// Dump/load disabled.
    pub dump_load_off: bool,
}

impl Default for OptionFlags1 {
    fn default() -> Self {
        Self {
            use_db_notify: true,
            database_fatal: false,
            set_lang_warn: true,
            dump_load_off: true,
        }
    }
}

impl OptionFlags1 {
    /// Pack into the wire byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.dump_load_off {
            flags |= 0x10;
        }
        if self.use_db_notify {
            flags |= 0x20;
        }
        if self.database_fatal {
            flags |= 0x40;
        }
        if self.set_lang_warn {
            flags |= 0x80;
        }
        flags
    }
}

/// Option flags 2 (byte 25).
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionFlags2 {
    /// Fail login if the requested language is unavailable.
    pub language_fatal: bool,
    /// ODBC-style defaults (implicit transactions off, ansi defaults).
    pub odbc: bool,
    /// SSPI credentials replace user/password.
    pub integrated_security: bool,
}

impl OptionFlags2 {
    /// Pack into the wire byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.language_fatal {
            flags |= 0x01;
        }
        if self.odbc {
            flags |= 0x02;
        }
        if self.integrated_security {
            flags |= 0x80;
        }
        flags
    }
}

/// Type flags (byte 26).
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeFlags {
    /// Application intent is read-only.
    pub read_only_intent: bool,
}

impl TypeFlags {
    /// Pack into the wire byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        if self.read_only_intent { 0x20 } else { 0x00 }
    }
}

/// Option flags 3 (byte 27).
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionFlags3 {
    /// A feature-extension block follows the string section.
    pub extension: bool,
    /// Tolerate collations this client does not know.
    pub unknown_collation_handling: bool,
}

impl OptionFlags3 {
    /// Pack into the wire byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.unknown_collation_handling {
            flags |= 0x08;
        }
        if self.extension {
            flags |= 0x10;
        }
        flags
    }
}

/// Federated-authentication library carried in the FEDAUTH feature data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FedAuthLibrary {
    /// A bearer token supplied up front, sent in a FEDAUTHTOKEN packet.
    SecurityToken = 0x02,
}

/// LOGIN7 message builder.
#[derive(Debug, Clone)]
pub struct Login7 {
    /// Requested TDS version.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub block_size: u32,
    /// Client program version.
    pub client_prog_version: u32,
    /// Client process id.
    pub client_pid: u32,
    /// Connection id, 0 for new connections.
    pub connection_id: u32,
    /// Option flags 1.
    pub option_flags1: OptionFlags1,
    /// Option flags 2.
    pub option_flags2: OptionFlags2,
    /// Type flags.
    pub type_flags: TypeFlags,
    /// Option flags 3.
    pub option_flags3: OptionFlags3,
    /// Client time zone offset from UTC in minutes.
    pub client_time_zone: i32,
    /// Client LCID.
    pub client_lcid: u32,
    /// Client machine name.
    pub client_host_name: String,
    /// Login name; empty under integrated security.
    pub user_name: String,
    /// Password; empty under integrated security.
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name as the client addressed it.
    pub server_name: String,
    /// Client library name.
    pub library_name: String,
    /// Initial language, empty for the server default.
    pub language: String,
    /// Initial database, empty for the login default.
    pub database: String,
    /// Client id; a MAC address historically, zeros today.
    pub client_id: [u8; 6],
    /// SSPI blob from the authentication capability.
    pub sspi: Option<Bytes>,
    /// Attach-database file path.
    pub attach_db_file: String,
    /// New password for a password change.
    pub new_password: String,
    /// Federated authentication: (library, server echoed FEDAUTHREQUIRED).
    pub fed_auth: Option<(FedAuthLibrary, bool)>,
}

impl Login7 {
    /// Create a login with required identity fields.
    #[must_use]
    pub fn new(tds_version: TdsVersion, block_size: u32) -> Self {
        Self {
            tds_version,
            block_size,
            client_prog_version: 0x0700_0000,
            client_pid: std::process::id(),
            connection_id: 0,
            option_flags1: OptionFlags1::default(),
            option_flags2: OptionFlags2::default(),
            type_flags: TypeFlags::default(),
            option_flags3: OptionFlags3::default(),
            client_time_zone: 0,
            client_lcid: 1033,
            client_host_name: String::new(),
            user_name: String::new(),
            password: String::new(),
            app_name: String::new(),
            server_name: String::new(),
            library_name: String::from("tidewire"),
            language: String::new(),
            database: String::new(),
            client_id: [0; 6],
            sspi: None,
            attach_db_file: String::new(),
            new_password: String::new(),
            fed_auth: None,
        }
    }

    /// Encode into a LOGIN packet payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let integrated = self.sspi.is_some();
        let extension = self.fed_auth.is_some();

        let user = if integrated { "" } else { self.user_name.as_str() };
        let password = if integrated { "" } else { self.password.as_str() };
        let sspi = self.sspi.as_deref().unwrap_or(&[]);

        let feature_block = self.encode_features();

        let mut buf = BytesMut::with_capacity(LOGIN7_HEADER_LEN + 256);
        buf.put_u32_le(0); // total length, patched at the end
        buf.put_u32(self.tds_version.raw());
        buf.put_u32_le(self.block_size);
        buf.put_u32_le(self.client_prog_version);
        buf.put_u32_le(self.client_pid);
        buf.put_u32_le(self.connection_id);

        let mut flags2 = self.option_flags2;
        flags2.integrated_security = integrated;
        let mut flags3 = self.option_flags3;
        flags3.extension = extension;

        buf.put_u8(self.option_flags1.to_byte());
        buf.put_u8(flags2.to_byte());
        buf.put_u8(self.type_flags.to_byte());
        buf.put_u8(flags3.to_byte());
        buf.put_i32_le(self.client_time_zone);
        buf.put_u32_le(self.client_lcid);

        // Offset/length table; offsets are absolute in the LOGIN7 payload.
        let mut offset = LOGIN7_HEADER_LEN as u16;
        let mut data = BytesMut::new();
        let mut ext_slot_pos = 0usize;

        put_str_entry(&mut buf, &mut data, &mut offset, &self.client_host_name);
        put_str_entry(&mut buf, &mut data, &mut offset, user);
        put_password_entry(&mut buf, &mut data, &mut offset, password);
        put_str_entry(&mut buf, &mut data, &mut offset, &self.app_name);
        put_str_entry(&mut buf, &mut data, &mut offset, &self.server_name);

        if extension {
            // The unused slot becomes a pointer to ibFeatureExtLong.
            buf.put_u16_le(offset);
            buf.put_u16_le(4);
            ext_slot_pos = data.len();
            data.put_u32_le(0); // patched below
            offset += 4;
        } else {
            buf.put_u16_le(offset);
            buf.put_u16_le(0);
        }

        put_str_entry(&mut buf, &mut data, &mut offset, &self.library_name);
        put_str_entry(&mut buf, &mut data, &mut offset, &self.language);
        put_str_entry(&mut buf, &mut data, &mut offset, &self.database);

        buf.put_slice(&self.client_id);

        // SSPI blob entry.
        buf.put_u16_le(offset);
        buf.put_u16_le(sspi.len().min(65535) as u16);
        data.put_slice(sspi);
        offset += sspi.len() as u16;

        put_str_entry(&mut buf, &mut data, &mut offset, &self.attach_db_file);
        put_str_entry(&mut buf, &mut data, &mut offset, &self.new_password);

        // cbSSPILong, used only when the blob exceeds 64KB. Ours never does.
        buf.put_u32_le(0);

        debug_assert_eq!(buf.len(), LOGIN7_HEADER_LEN);

        if extension {
            // The feature block sits right after the variable data.
            let feature_offset = (LOGIN7_HEADER_LEN + data.len()) as u32;
            data[ext_slot_pos..ext_slot_pos + 4]
                .copy_from_slice(&feature_offset.to_le_bytes());
        }

        buf.put_slice(&data);
        buf.put_slice(&feature_block);

        let total = buf.len() as u32;
        buf[0..4].copy_from_slice(&total.to_le_bytes());
        buf.freeze()
    }

    fn encode_features(&self) -> Bytes {
        let Some((library, echo)) = self.fed_auth else {
            return Bytes::new();
        };
        let mut buf = BytesMut::new();
        // FEDAUTH feature: options byte = library << 1 | fFedAuthEcho.
        buf.put_u8(0x02);
        buf.put_u32_le(1);
        buf.put_u8(((library as u8) << 1) | u8::from(echo));
        buf.put_u8(0xFF); // feature terminator
        buf.freeze()
    }
}

/// Append one offset/length table entry and its UCS-2 string data.
fn put_str_entry(table: &mut BytesMut, data: &mut BytesMut, offset: &mut u16, s: &str) {
    let chars = s.encode_utf16().count() as u16;
    table.put_u16_le(*offset);
    table.put_u16_le(chars);
    for u in s.encode_utf16() {
        data.put_u16_le(u);
    }
    *offset += chars * 2;
}

/// Like [`put_str_entry`], but the data bytes go through the obfuscator.
fn put_password_entry(table: &mut BytesMut, data: &mut BytesMut, offset: &mut u16, s: &str) {
    let chars = s.encode_utf16().count() as u16;
    table.put_u16_le(*offset);
    table.put_u16_le(chars);
    for u in s.encode_utf16() {
        for b in u.to_le_bytes() {
            data.put_u8(obfuscate_password_byte(b));
        }
    }
    *offset += chars * 2;
}

/// Obfuscate one password byte: swap nibbles, XOR with 0xA5.
#[must_use]
pub fn obfuscate_password_byte(b: u8) -> u8 {
    ((b << 4) | (b >> 4)) ^ 0xA5
}
