//! The one-byte flag registry shared by every node on the wire.
//!
//! Values below `0x20` are reserved for the protocol itself; application
//! payloads that want their own subtype tag must pick something `>= 0x20`.

/// A protocol-level flag byte.
///
/// Kept as a thin wrapper around `u8` rather than a closed enum: unknown
/// flags (future protocol versions, application subtypes) must still
/// round-trip through the wire codec without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Flag(pub u8);

impl Flag {
    pub const BROADCAST: Flag = Flag(0x00);
    pub const RENEGOTIATE: Flag = Flag(0x01);
    pub const WHISPER: Flag = Flag(0x02);
    pub const PING: Flag = Flag(0x03);
    pub const PONG: Flag = Flag(0x04);
    pub const HANDSHAKE: Flag = Flag(0x05);
    pub const NOTIFY: Flag = Flag(0x06);
    pub const PEERS: Flag = Flag(0x07);
    pub const REQUEST: Flag = Flag(0x08);
    pub const RESEND: Flag = Flag(0x09);
    pub const RESPONSE: Flag = Flag(0x0A);
    pub const STORE: Flag = Flag(0x0B);
    pub const RETRIEVE: Flag = Flag(0x0C);

    // Subflags used only inside a `renegotiate` message's first payload byte.
    pub const COMPRESSION: Flag = Flag(0x01);

    // Compression method identifiers.
    pub const BZ2: Flag = Flag(0x10);
    pub const GZIP: Flag = Flag(0x11);
    pub const LZMA: Flag = Flag(0x12);
    pub const ZLIB: Flag = Flag(0x13);

    /// First value an application subtype is allowed to use.
    pub const APPLICATION_MIN: u8 = 0x20;

    pub fn is_reserved(self) -> bool {
        self.0 < Self::APPLICATION_MIN
    }

    pub fn name(self) -> &'static str {
        match self {
            Flag::BROADCAST => "broadcast",
            Flag::RENEGOTIATE => "renegotiate",
            Flag::WHISPER => "whisper",
            Flag::PING => "ping",
            Flag::PONG => "pong",
            Flag::HANDSHAKE => "handshake",
            Flag::NOTIFY => "notify",
            Flag::PEERS => "peers",
            Flag::REQUEST => "request",
            Flag::RESEND => "resend",
            Flag::RESPONSE => "response",
            Flag::STORE => "store",
            Flag::RETRIEVE => "retrieve",
            Flag::BZ2 => "bz2",
            Flag::GZIP => "gzip",
            Flag::LZMA => "lzma",
            Flag::ZLIB => "zlib",
            _ => "application",
        }
    }
}

impl std::fmt::Display for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(0x{:02x})", self.name(), self.0)
    }
}

impl From<u8> for Flag {
    fn from(byte: u8) -> Self {
        Flag(byte)
    }
}

impl From<Flag> for u8 {
    fn from(flag: Flag) -> Self {
        flag.0
    }
}

/// The compression methods the codec knows how to apply. Distinct from
/// [`Flag`] because only a handful of flag values are valid compression
/// methods and call sites want that invariant in the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionMethod {
    Bz2,
    Gzip,
    Lzma,
    Zlib,
}

impl CompressionMethod {
    pub fn flag(self) -> Flag {
        match self {
            CompressionMethod::Bz2 => Flag::BZ2,
            CompressionMethod::Gzip => Flag::GZIP,
            CompressionMethod::Lzma => Flag::LZMA,
            CompressionMethod::Zlib => Flag::ZLIB,
        }
    }

    pub fn from_flag(flag: Flag) -> Option<Self> {
        match flag {
            Flag::BZ2 => Some(CompressionMethod::Bz2),
            Flag::GZIP => Some(CompressionMethod::Gzip),
            Flag::LZMA => Some(CompressionMethod::Lzma),
            Flag::ZLIB => Some(CompressionMethod::Zlib),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_range_matches_registry() {
        assert!(Flag::BROADCAST.is_reserved());
        assert!(Flag::RESPONSE.is_reserved());
        assert!(Flag(0x1F).is_reserved());
        assert!(!Flag(0x20).is_reserved());
    }

    #[test]
    fn compression_flag_roundtrip() {
        for method in [
            CompressionMethod::Bz2,
            CompressionMethod::Gzip,
            CompressionMethod::Lzma,
            CompressionMethod::Zlib,
        ] {
            assert_eq!(CompressionMethod::from_flag(method.flag()), Some(method));
        }
    }

    #[test]
    fn non_compression_flag_has_no_method() {
        assert_eq!(CompressionMethod::from_flag(Flag::HANDSHAKE), None);
    }

    #[test]
    fn display_shows_name_and_byte() {
        assert_eq!(Flag::PEERS.to_string(), "peers(0x07)");
    }
}
