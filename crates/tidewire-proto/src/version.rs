//! TDS protocol version definitions.

use core::fmt;

/// TDS protocol version.
///
/// The value is the 4-byte version identifier sent in LOGIN7 and echoed
/// (possibly downgraded) by the server in LOGINACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 7.0 (SQL Server 7.0)
    pub const V7_0: Self = Self(0x7000_0000);

    /// TDS 7.1 (SQL Server 2000)
    pub const V7_1: Self = Self(0x7100_0000);

    /// TDS 7.1 revision 1 (SQL Server 2000 SP1)
    pub const V7_1_REV1: Self = Self(0x7100_0001);

    /// TDS 7.2 (SQL Server 2005)
    pub const V7_2: Self = Self(0x7209_0002);

    /// TDS 7.3A (SQL Server 2008)
    pub const V7_3A: Self = Self(0x730A_0003);

    /// TDS 7.3B (SQL Server 2008 R2)
    pub const V7_3B: Self = Self(0x730B_0003);

    /// TDS 7.4 (SQL Server 2012+)
    pub const V7_4: Self = Self(0x7400_0004);

    /// Create a version from its raw wire value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw wire value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Map the version field of a LOGINACK token to a client version.
    ///
    /// Servers answer with an interoperability encoding for the pre-7.2
    /// dialects (`0x07000000` / `0x07010000`) rather than the values the
    /// client requested; 7.2 and later are echoed verbatim.
    #[must_use]
    pub fn from_login_ack(raw: u32) -> Option<Self> {
        match raw {
            0x0700_0000 => Some(Self::V7_0),
            0x0701_0000 => Some(Self::V7_1),
            0x7100_0001 => Some(Self::V7_1_REV1),
            0x7209_0002 => Some(Self::V7_2),
            0x730A_0003 => Some(Self::V7_3A),
            0x730B_0003 => Some(Self::V7_3B),
            0x7400_0004 => Some(Self::V7_4),
            _ => None,
        }
    }

    /// Whether DONE tokens carry a 64-bit row count, PLP MAX types exist,
    /// RETURNVALUE carries an explicit ordinal, and requests start with an
    /// ALL_HEADERS section. All introduced in TDS 7.2.
    #[must_use]
    pub const fn is_72_plus(self) -> bool {
        self.0 >= Self::V7_2.0
    }

    /// Whether DATE/TIME/DATETIME2/DATETIMEOFFSET, NBCROW and table-valued
    /// parameters are available. Introduced in TDS 7.3.
    #[must_use]
    pub const fn is_73_plus(self) -> bool {
        self.0 >= Self::V7_3A.0
    }

    /// Whether the FEDAUTHREQUIRED prelogin option is understood (TDS 7.4).
    #[must_use]
    pub const fn is_74_plus(self) -> bool {
        self.0 >= Self::V7_4.0
    }

    /// Whether VARCHAR family type-info carries a collation (TDS 7.1+).
    #[must_use]
    pub const fn is_71_plus(self) -> bool {
        self.0 >= Self::V7_1.0
    }

    /// Parse a version from a "7.x" style string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "7.0" => Some(Self::V7_0),
            "7.1" => Some(Self::V7_1),
            "7.2" => Some(Self::V7_2),
            "7.3" | "7.3a" => Some(Self::V7_3A),
            "7.3b" => Some(Self::V7_3B),
            "7.4" => Some(Self::V7_4),
            _ => None,
        }
    }
}

impl Default for TdsVersion {
    fn default() -> Self {
        Self::V7_4
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::V7_0 => "TDS 7.0",
            Self::V7_1 | Self::V7_1_REV1 => "TDS 7.1",
            Self::V7_2 => "TDS 7.2",
            Self::V7_3A => "TDS 7.3A",
            Self::V7_3B => "TDS 7.3B",
            Self::V7_4 => "TDS 7.4",
            _ => return write!(f, "TDS 0x{:08X}", self.0),
        };
        f.write_str(name)
    }
}

impl From<u32> for TdsVersion {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<TdsVersion> for u32 {
    fn from(version: TdsVersion) -> Self {
        version.0
    }
}
