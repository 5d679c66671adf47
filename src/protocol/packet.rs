use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload size (16MB - 1)
#[allow(dead_code)]
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL wire protocol packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Build a COM_QUERY packet from a SQL string
    pub fn query(sequence_id: u8, sql: &str) -> Self {
        let mut payload = BytesMut::with_capacity(sql.len() + 1);
        payload.put_u8(Command::Query as u8);
        payload.extend_from_slice(sql.as_bytes());
        Self::new(sequence_id, payload.freeze())
    }

    /// Build a COM_PING packet
    pub fn ping() -> Self {
        Self::new(0, Bytes::from_static(&[Command::Ping as u8]))
    }

    /// The command byte, if the payload is non-empty
    pub fn command(&self) -> Option<Command> {
        self.payload.first().map(|b| Command::from(*b))
    }

    /// An empty payload: the terminator of a LOAD DATA LOCAL INFILE stream
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Total wire length (header + payload)
    pub fn wire_len(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// Encode packet to bytes (header + payload)
    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.payload.len();
        // 3 bytes for length (little endian)
        dst.put_u8((len & 0xFF) as u8);
        dst.put_u8(((len >> 8) & 0xFF) as u8);
        dst.put_u8(((len >> 16) & 0xFF) as u8);
        // 1 byte for sequence id
        dst.put_u8(self.sequence_id);
        dst.extend_from_slice(&self.payload);
    }

    /// Try to decode packet from bytes, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let len = src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);

        if src.len() < PACKET_HEADER_SIZE + len {
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }
}

/// MySQL capability flags
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 13;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Default capabilities for the proxy.
    ///
    /// CLIENT_MULTI_STATEMENTS is advertised: the router pins multi-statement
    /// packets to the primary instead of rejecting them.
    ///
    /// CLIENT_DEPRECATE_EOF is NOT advertised because some backends negotiate
    /// it and still emit EOF packets.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_LOCAL_FILES
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}

/// MySQL server status flags carried in OK/EOF packets
#[allow(dead_code)]
pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXIST: u16 = 0x0008;
    pub const SERVER_STATUS_IN_TRANS_READONLY: u16 = 0x2000;
}

/// MySQL command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    ChangeUser = 0x11,
    BinlogDump = 0x12,
    TableDump = 0x13,
    ConnectOut = 0x14,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    Daemon = 0x1d,
    BinlogDumpGtid = 0x1e,
    ResetConnection = 0x1f,
    Unknown = 0xff,
}

impl Command {
    /// Whether the server sends any reply at all for this command
    pub fn creates_reply(self) -> bool {
        !matches!(
            self,
            Command::Quit | Command::StmtSendLongData | Command::StmtClose
        )
    }
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x08 => Command::Shutdown,
            0x09 => Command::Statistics,
            0x0a => Command::ProcessInfo,
            0x0b => Command::Connect,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x0f => Command::Time,
            0x10 => Command::DelayedInsert,
            0x11 => Command::ChangeUser,
            0x12 => Command::BinlogDump,
            0x13 => Command::TableDump,
            0x14 => Command::ConnectOut,
            0x15 => Command::RegisterSlave,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1d => Command::Daemon,
            0x1e => Command::BinlogDumpGtid,
            0x1f => Command::ResetConnection,
            _ => Command::Unknown,
        }
    }
}

/// Parse a length-encoded integer from a packet payload
pub fn parse_length_encoded_int(data: &[u8]) -> Option<u64> {
    if data.is_empty() {
        return None;
    }
    match data[0] {
        0..=0xFA => Some(data[0] as u64),
        0xFC if data.len() >= 3 => Some(u16::from_le_bytes([data[1], data[2]]) as u64),
        0xFD if data.len() >= 4 => {
            Some(u32::from_le_bytes([data[1], data[2], data[3], 0]) as u64)
        }
        0xFE if data.len() >= 9 => Some(u64::from_le_bytes([
            data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
        ])),
        _ => None,
    }
}

/// Encode a length-encoded integer
pub fn encode_length_encoded_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xFD);
        buf.put_u8((value & 0xFF) as u8);
        buf.put_u8(((value >> 8) & 0xFF) as u8);
        buf.put_u8(((value >> 16) & 0xFF) as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Detect a multi-statement COM_QUERY packet.
///
/// A packet is multi-statement when the client negotiated
/// CLIENT_MULTI_STATEMENTS and the SQL contains a `;` outside quotes and
/// comments with something other than whitespace after it. Scans bytes only;
/// no SQL is parsed.
pub fn is_multi_statement(payload: &Bytes, client_caps: u32) -> bool {
    if client_caps & capabilities::CLIENT_MULTI_STATEMENTS == 0 {
        return false;
    }
    if payload.first() != Some(&(Command::Query as u8)) {
        return false;
    }

    let sql = &payload[1..];
    let mut i = 0;
    let mut quote: Option<u8> = None;

    while i < sql.len() {
        let b = sql[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1; // skip escaped byte
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' | b'`' => quote = Some(b),
                b'#' => {
                    // comment to end of line
                    while i < sql.len() && sql[i] != b'\n' {
                        i += 1;
                    }
                }
                b'-' if sql.get(i + 1) == Some(&b'-') && sql.get(i + 2) == Some(&b' ') => {
                    while i < sql.len() && sql[i] != b'\n' {
                        i += 1;
                    }
                }
                b'/' if sql.get(i + 1) == Some(&b'*') => {
                    i += 2;
                    while i + 1 < sql.len() && !(sql[i] == b'*' && sql[i + 1] == b'/') {
                        i += 1;
                    }
                    i += 1;
                }
                b';' => {
                    // semicolon followed by anything but trailing whitespace
                    return sql[i + 1..].iter().any(|c| !c.is_ascii_whitespace());
                }
                _ => {}
            },
        }
        i += 1;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_payload(sql: &str) -> Bytes {
        let mut v = vec![Command::Query as u8];
        v.extend_from_slice(sql.as_bytes());
        Bytes::from(v)
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = Packet::query(1, "SELECT 1");
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);

        let decoded = Packet::decode(&mut buf).unwrap();
        assert_eq!(decoded.sequence_id, 1);
        assert_eq!(decoded.command(), Some(Command::Query));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_packet() {
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x00][..]);
        assert!(Packet::decode(&mut buf).is_none());

        // header present but payload short
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x00, 0x00, 0x03][..]);
        assert!(Packet::decode(&mut buf).is_none());
    }

    #[test]
    fn test_lenenc_int() {
        let mut buf = BytesMut::new();
        for v in [0u64, 250, 251, 65535, 65536, 1 << 25] {
            buf.clear();
            encode_length_encoded_int(&mut buf, v);
            assert_eq!(parse_length_encoded_int(&buf), Some(v));
        }
    }

    #[test]
    fn test_multi_statement_detected() {
        let caps = capabilities::CLIENT_MULTI_STATEMENTS;
        assert!(is_multi_statement(
            &query_payload("SELECT 1; SELECT 2"),
            caps
        ));
        // trailing semicolon is not multi-statement
        assert!(!is_multi_statement(&query_payload("SELECT 1;"), caps));
        assert!(!is_multi_statement(&query_payload("SELECT 1;  \n"), caps));
    }

    #[test]
    fn test_multi_statement_ignores_quotes_and_comments() {
        let caps = capabilities::CLIENT_MULTI_STATEMENTS;
        assert!(!is_multi_statement(
            &query_payload("SELECT 'a;b' FROM t"),
            caps
        ));
        assert!(!is_multi_statement(
            &query_payload("SELECT 1 /* ; SELECT 2 */"),
            caps
        ));
        assert!(!is_multi_statement(&query_payload("SELECT 1 -- ; x"), caps));
    }

    #[test]
    fn test_multi_statement_requires_capability() {
        assert!(!is_multi_statement(&query_payload("SELECT 1; SELECT 2"), 0));
    }
}
