use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use crate::protocol::{
    capabilities, compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet, ErrPacket,
    HandshakeResponse, InitialHandshake, Packet, PacketCodec,
};

/// Errors from a backend server connection
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection disconnected")]
    Disconnected,

    #[error("Connection not open")]
    NotConnected,
}

/// Authenticated connection to one MySQL server
pub struct MySqlConn {
    framed: Framed<TcpStream, PacketCodec>,
    capabilities: u32,
    addr: String,
}

/// Write half of a split connection
pub(crate) type ConnSink = SplitSink<Framed<TcpStream, PacketCodec>, Packet>;
/// Read half of a split connection
pub(crate) type ConnStream = SplitStream<Framed<TcpStream, PacketCodec>>;

impl MySqlConn {
    /// Connect and authenticate with mysql_native_password
    pub async fn connect(
        addr: &str,
        user: &str,
        password: &str,
        database: Option<&str>,
    ) -> Result<Self, BackendError> {
        debug!(addr = %addr, "Connecting to backend");

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;

        let mut framed = Framed::new(stream, PacketCodec);

        let handshake_packet = framed
            .next()
            .await
            .ok_or(BackendError::Disconnected)?
            .map_err(|e| BackendError::Io(e.to_string()))?;

        let server_handshake = InitialHandshake::parse(&handshake_packet.payload)
            .ok_or_else(|| BackendError::Protocol("Invalid server handshake".into()))?;

        let auth_response =
            compute_auth_response(password, &server_handshake.auth_plugin_data());

        let mut caps = capabilities::DEFAULT_CAPABILITIES & server_handshake.capability_flags;
        if database.is_none() {
            caps &= !capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: user.to_string(),
            auth_response,
            database: database.map(|d| d.to_string()),
            auth_plugin_name: server_handshake.auth_plugin_name.clone(),
        };

        framed
            .send(response.encode(1))
            .await
            .map_err(|e| BackendError::Io(e.to_string()))?;

        let reply = framed
            .next()
            .await
            .ok_or(BackendError::Disconnected)?
            .map_err(|e| BackendError::Io(e.to_string()))?;

        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload, caps)
                .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
            error!(addr = %addr, code = err.error_code, message = %err.error_message,
                   "Backend authentication failed");
            return Err(BackendError::Auth(err.error_message));
        }
        if !is_ok_packet(&reply.payload) {
            return Err(BackendError::Protocol(
                "Expected OK after authentication".into(),
            ));
        }

        debug!(addr = %addr, "Backend connection established");

        Ok(Self {
            framed,
            capabilities: caps,
            addr: addr.to_string(),
        })
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Split into sink/stream halves for the writer and reader tasks
    pub(crate) fn split(self) -> (ConnSink, ConnStream) {
        self.framed.split()
    }

    pub async fn send(&mut self, packet: Packet) -> Result<(), BackendError> {
        self.framed
            .send(packet)
            .await
            .map_err(|e| BackendError::Io(e.to_string()))
    }

    pub async fn recv(&mut self) -> Result<Packet, BackendError> {
        match self.framed.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => Err(BackendError::Io(e.to_string())),
            None => Err(BackendError::Disconnected),
        }
    }

    /// Run a text-protocol query and collect the full result set.
    /// Used by the monitor probes, never on the routed request path.
    pub async fn query(&mut self, sql: &str) -> Result<ResultSet, BackendError> {
        self.send(Packet::query(0, sql)).await?;

        let first = self.recv().await?;

        if is_err_packet(&first.payload) {
            let err = ErrPacket::parse(&first.payload, self.capabilities)
                .map(|e| e.error_message)
                .unwrap_or_else(|| "query failed".into());
            return Err(BackendError::Protocol(err));
        }
        if is_ok_packet(&first.payload) {
            return Ok(ResultSet::default());
        }

        let column_count = crate::protocol::parse_length_encoded_int(&first.payload)
            .ok_or_else(|| BackendError::Protocol("Bad column count".into()))? as usize;

        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let def = self.recv().await?;
            columns.push(parse_column_name(&def.payload).unwrap_or_default());
        }

        // EOF after column definitions unless the server deprecated it
        if self.capabilities & capabilities::CLIENT_DEPRECATE_EOF == 0 {
            let _eof = self.recv().await?;
        }

        let mut rows = Vec::new();
        loop {
            let packet = self.recv().await?;
            if is_ok_packet(&packet.payload)
                || is_err_packet(&packet.payload)
                || is_eof_packet(&packet.payload, self.capabilities)
            {
                break;
            }
            rows.push(parse_text_row(&packet.payload, column_count));
        }

        Ok(ResultSet { columns, rows })
    }
}

/// A fully-buffered text-protocol result set
#[derive(Debug, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    /// Value of the named column in the first row
    pub fn first(&self, column: &str) -> Option<&str> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.rows.first()?.get(idx)?.as_deref()
    }
}

/// Read one length-encoded string; None means the NULL marker (0xFB)
fn parse_lenenc_string(data: &[u8], pos: &mut usize) -> Option<Option<String>> {
    let header = *data.get(*pos)?;
    let (len, header_size) = match header {
        0xFB => {
            *pos += 1;
            return Some(None);
        }
        0..=0xFA => (header as usize, 1),
        0xFC => (
            u16::from_le_bytes([*data.get(*pos + 1)?, *data.get(*pos + 2)?]) as usize,
            3,
        ),
        0xFD => (
            u32::from_le_bytes([
                *data.get(*pos + 1)?,
                *data.get(*pos + 2)?,
                *data.get(*pos + 3)?,
                0,
            ]) as usize,
            4,
        ),
        _ => return None,
    };

    let start = *pos + header_size;
    let end = start + len;
    if data.len() < end {
        return None;
    }
    *pos = end;
    Some(Some(
        String::from_utf8_lossy(&data[start..end]).to_string(),
    ))
}

/// Column name from a column definition packet: the fifth length-encoded
/// string (catalog, schema, table, org_table, name)
fn parse_column_name(payload: &[u8]) -> Option<String> {
    let mut pos = 0;
    for _ in 0..4 {
        parse_lenenc_string(payload, &mut pos)?;
    }
    parse_lenenc_string(payload, &mut pos)?
}

fn parse_text_row(payload: &[u8], column_count: usize) -> Vec<Option<String>> {
    let mut pos = 0;
    let mut values = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        match parse_lenenc_string(payload, &mut pos) {
            Some(value) => values.push(value),
            None => break,
        }
    }
    values
}
