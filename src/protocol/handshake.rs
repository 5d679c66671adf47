use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, encode_length_encoded_int, Packet};

/// MySQL initial handshake packet (server -> client)
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data_part1: [u8; 8],
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_data_part2: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Create the handshake the proxy presents to clients
    pub fn new(connection_id: u32) -> Self {
        let mut auth_data1 = [0u8; 8];
        let mut auth_data2 = vec![0u8; 12];

        use rand::RngCore;
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut auth_data1);
        rng.fill_bytes(&mut auth_data2);

        Self {
            protocol_version: 10,
            server_version: "8.0.0-hermes".to_string(),
            connection_id,
            auth_plugin_data_part1: auth_data1,
            capability_flags: DEFAULT_CAPABILITIES,
            character_set: 0x21, // utf8_general_ci
            status_flags: 0x0002,
            auth_plugin_data_part2: auth_data2,
            auth_plugin_name: "mysql_native_password".to_string(),
        }
    }

    /// Full 20-byte auth plugin data
    pub fn auth_plugin_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(20);
        data.extend_from_slice(&self.auth_plugin_data_part1);
        data.extend_from_slice(&self.auth_plugin_data_part2);
        data
    }

    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(self.protocol_version);
        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);
        buf.put_u32_le(self.connection_id);
        buf.extend_from_slice(&self.auth_plugin_data_part1);
        buf.put_u8(0); // filler
        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(((self.capability_flags >> 16) & 0xFFFF) as u16);

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            let len = self.auth_plugin_data_part1.len() + self.auth_plugin_data_part2.len() + 1;
            buf.put_u8(len as u8);
        } else {
            buf.put_u8(0);
        }

        buf.extend_from_slice(&[0u8; 10]); // reserved

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.extend_from_slice(&self.auth_plugin_data_part2);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(0, buf.freeze())
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let protocol_version = buf.get_u8();

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let server_version = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let connection_id = buf.get_u32_le();

        let mut auth_plugin_data_part1 = [0u8; 8];
        auth_plugin_data_part1.copy_from_slice(&buf[..8]);
        buf.advance(8);

        buf.advance(1); // filler

        let capability_flags_lower = buf.get_u16_le() as u32;
        let character_set = buf.get_u8();
        let status_flags = buf.get_u16_le();
        let capability_flags_upper = buf.get_u16_le() as u32;
        let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

        let auth_plugin_data_len = buf.get_u8();

        buf.advance(10); // reserved

        let mut auth_plugin_data_part2 = Vec::new();
        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = std::cmp::max(13, auth_plugin_data_len as usize - 8);
            let data_len = buf.iter().take(len).position(|&b| b == 0).unwrap_or(len);
            auth_plugin_data_part2.extend_from_slice(&buf[..data_len]);
            buf.advance(len);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            "mysql_native_password".to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data_part1,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data_part2,
            auth_plugin_name,
        })
    }
}

/// MySQL handshake response packet (client -> server)
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let capability_flags = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();

        buf.advance(23); // reserved

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let auth_response = if capability_flags
            & (CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA | CLIENT_SECURE_CONNECTION)
            != 0
        {
            let len = buf.get_u8() as usize;
            let data = buf[..len].to_vec();
            buf.advance(len);
            data
        } else {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let data = buf[..null_pos].to_vec();
            buf.advance((null_pos + 1).min(buf.len()));
            data
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let db = String::from_utf8_lossy(&buf[..null_pos]).to_string();
            buf.advance(null_pos + 1);
            (!db.is_empty()).then_some(db)
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            "mysql_native_password".to_string()
        };

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
        })
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.extend_from_slice(&[0u8; 23]);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// Compute the mysql_native_password auth response:
/// `SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))`
pub fn compute_auth_response(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let hash1 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(hash1);
    let hash2 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(auth_data);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    hash1
        .iter()
        .zip(hash3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// OK packet
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: 0x0002, // SERVER_STATUS_AUTOCOMMIT
            warnings: 0,
        }
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0x00);
        encode_length_encoded_int(&mut buf, self.affected_rows);
        encode_length_encoded_int(&mut buf, self.last_insert_id);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// ERR packet
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    /// The synthetic error sent for writes when no primary is selectable and
    /// the failure mode keeps the session open
    pub fn read_only() -> Self {
        Self::new(
            1792, // ER_CANT_EXECUTE_IN_READ_ONLY_TRANSACTION
            "25006",
            "The service is in read-only mode: no writable server is available",
        )
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0xFF);
        buf.put_u16_le(self.error_code);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.extend_from_slice(self.sql_state.as_bytes());
        }

        buf.extend_from_slice(self.error_message.as_bytes());

        Packet::new(sequence_id, buf.freeze())
    }

    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        if payload.first() != Some(&0xFF) {
            return None;
        }

        let mut buf = &payload[1..];
        if buf.len() < 2 {
            return None;
        }

        let error_code = buf.get_u16_le();

        let (sql_state, error_message) =
            if capabilities & CLIENT_PROTOCOL_41 != 0 && buf.first() == Some(&b'#') {
                buf.advance(1);
                if buf.len() >= 5 {
                    let sql_state = String::from_utf8_lossy(&buf[..5]).to_string();
                    buf.advance(5);
                    (sql_state, String::from_utf8_lossy(buf).to_string())
                } else {
                    ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
                }
            } else {
                ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
            };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// Check if packet is an OK packet
pub fn is_ok_packet(payload: &Bytes) -> bool {
    payload.first() == Some(&0x00)
}

/// Check if packet is an ERR packet
pub fn is_err_packet(payload: &Bytes) -> bool {
    payload.first() == Some(&0xFF)
}

/// Check if packet is an EOF packet (never under DEPRECATE_EOF)
pub fn is_eof_packet(payload: &Bytes, capabilities: u32) -> bool {
    if capabilities & CLIENT_DEPRECATE_EOF != 0 {
        false
    } else {
        payload.first() == Some(&0xFE) && payload.len() < 9
    }
}

/// Check if packet is a LOCAL INFILE request (0xFB followed by a file name)
pub fn is_local_infile_packet(payload: &Bytes) -> bool {
    payload.first() == Some(&0xFB)
}

/// Extract the server status flags from an OK packet payload
pub fn ok_status_flags(payload: &Bytes) -> Option<u16> {
    if !is_ok_packet(payload) {
        return None;
    }
    let mut buf = &payload[1..];
    skip_length_encoded_int(&mut buf)?; // affected rows
    skip_length_encoded_int(&mut buf)?; // last insert id
    if buf.len() < 2 {
        return None;
    }
    Some(buf.get_u16_le())
}

fn skip_length_encoded_int(buf: &mut &[u8]) -> Option<()> {
    let header = *buf.first()?;
    let skip = match header {
        0..=0xFA => 1,
        0xFC => 3,
        0xFD => 4,
        0xFE => 9,
        _ => return None,
    };
    if buf.len() < skip {
        return None;
    }
    buf.advance(skip);
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::status;

    #[test]
    fn test_handshake_roundtrip() {
        let hs = InitialHandshake::new(7);
        let packet = hs.encode();
        let parsed = InitialHandshake::parse(&packet.payload).unwrap();

        assert_eq!(parsed.protocol_version, 10);
        assert_eq!(parsed.server_version, "8.0.0-hermes");
        assert_eq!(parsed.connection_id, 7);
        assert_eq!(parsed.auth_plugin_data(), hs.auth_plugin_data());
        assert_eq!(parsed.auth_plugin_name, "mysql_native_password");
    }

    #[test]
    fn test_handshake_response_roundtrip() {
        let response = HandshakeResponse {
            capability_flags: DEFAULT_CAPABILITIES,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: "app".to_string(),
            auth_response: vec![1, 2, 3, 4],
            database: Some("orders".to_string()),
            auth_plugin_name: "mysql_native_password".to_string(),
        };

        let packet = response.encode(1);
        let parsed = HandshakeResponse::parse(&packet.payload).unwrap();

        assert_eq!(parsed.username, "app");
        assert_eq!(parsed.auth_response, vec![1, 2, 3, 4]);
        assert_eq!(parsed.database.as_deref(), Some("orders"));
    }

    #[test]
    fn test_auth_response_empty_password() {
        assert!(compute_auth_response("", b"12345678901234567890").is_empty());
        assert_eq!(
            compute_auth_response("secret", b"12345678901234567890").len(),
            20
        );
    }

    #[test]
    fn test_ok_status_flags() {
        let mut ok = OkPacket::new();
        ok.status_flags = status::SERVER_STATUS_IN_TRANS | status::SERVER_STATUS_IN_TRANS_READONLY;
        let packet = ok.encode(1, CLIENT_PROTOCOL_41);
        assert_eq!(ok_status_flags(&packet.payload), Some(ok.status_flags));
    }

    #[test]
    fn test_err_packet_roundtrip() {
        let err = ErrPacket::read_only();
        let packet = err.encode(1, CLIENT_PROTOCOL_41);
        assert!(is_err_packet(&packet.payload));

        let parsed = ErrPacket::parse(&packet.payload, CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(parsed.error_code, 1792);
        assert_eq!(parsed.sql_state, "25006");
    }

    #[test]
    fn test_packet_kind_predicates() {
        let ok = OkPacket::new().encode(0, CLIENT_PROTOCOL_41);
        assert!(is_ok_packet(&ok.payload));
        assert!(!is_err_packet(&ok.payload));

        let eof = Packet::new(0, Bytes::from_static(&[0xFE, 0x00, 0x00, 0x02, 0x00]));
        assert!(is_eof_packet(&eof.payload, 0));
        assert!(!is_eof_packet(&eof.payload, CLIENT_DEPRECATE_EOF));
    }
}
