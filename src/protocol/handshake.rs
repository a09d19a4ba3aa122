use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, status, Packet};

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";
pub const CLEAR_PASSWORD_PLUGIN: &str = "mysql_clear_password";
pub const DIALOG_PLUGIN: &str = "dialog";

/// Length of the authentication scramble
pub const SCRAMBLE_LEN: usize = 20;

/// Generate a scramble of printable, non-NUL bytes
pub fn new_scramble() -> [u8; SCRAMBLE_LEN] {
    let mut rng = rand::thread_rng();
    let mut scramble = [0u8; SCRAMBLE_LEN];
    for b in scramble.iter_mut() {
        *b = rng.gen_range(33u8..127u8);
    }
    scramble
}

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
    /// Create the greeting the proxy sends to a new client
    pub fn new(connection_id: u32, server_version: &str, scramble: &[u8; SCRAMBLE_LEN]) -> Self {
        let mut auth_data1 = [0u8; 8];
        auth_data1.copy_from_slice(&scramble[..8]);

        Self {
            protocol_version: 10,
            server_version: server_version.to_string(),
            connection_id,
            auth_plugin_data_part1: auth_data1,
            capability_flags: DEFAULT_CAPABILITIES,
            character_set: 0x21, // utf8_general_ci
            status_flags: status::SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_data_part2: scramble[8..].to_vec(),
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        }
    }

    /// Get full auth plugin data (20 bytes)
    pub fn auth_plugin_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(SCRAMBLE_LEN);
        data.extend_from_slice(&self.auth_plugin_data_part1);
        data.extend_from_slice(&self.auth_plugin_data_part2);
        data
    }

    /// Encode to packet
    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(self.protocol_version);

        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);

        buf.put_u32_le(self.connection_id);

        buf.extend_from_slice(&self.auth_plugin_data_part1);

        // Filler
        buf.put_u8(0);

        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(((self.capability_flags >> 16) & 0xFFFF) as u16);

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_u8((self.auth_plugin_data_part1.len() + self.auth_plugin_data_part2.len() + 1) as u8);
        } else {
            buf.put_u8(0);
        }

        // Reserved (10 bytes)
        buf.extend_from_slice(&[0u8; 10]);

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

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let protocol_version = buf.get_u8();

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let server_version = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        if buf.len() < 31 {
            return None;
        }

        let connection_id = buf.get_u32_le();

        let mut auth_plugin_data_part1 = [0u8; 8];
        auth_plugin_data_part1.copy_from_slice(&buf[..8]);
        buf.advance(8);

        // Filler
        buf.advance(1);

        let capability_flags_lower = buf.get_u16_le() as u32;
        let character_set = buf.get_u8();
        let status_flags = buf.get_u16_le();
        let capability_flags_upper = buf.get_u16_le() as u32;
        let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

        let auth_plugin_data_len = buf.get_u8();

        // Reserved
        buf.advance(10);

        let mut auth_plugin_data_part2 = Vec::new();
        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = std::cmp::max(13, (auth_plugin_data_len as usize).saturating_sub(8)).min(buf.len());
            let data_len = buf.iter().take(len).position(|&b| b == 0).unwrap_or(len);
            auth_plugin_data_part2.extend_from_slice(&buf[..data_len]);
            buf.advance(len);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            read_null_terminated(&mut buf)
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
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

/// Size of an SSLRequest, the truncated handshake response sent before TLS
const SSL_REQUEST_LEN: usize = 32;

/// Check whether a handshake response is really an SSLRequest
pub fn is_ssl_request(payload: &[u8]) -> bool {
    if payload.len() != SSL_REQUEST_LEN {
        return false;
    }
    let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    caps & CLIENT_SSL != 0
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
    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 33 {
            return None;
        }

        let mut buf = payload;

        let capability_flags = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();

        // Reserved (23 bytes)
        buf.advance(23);

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            let len = read_lenenc_int(&mut buf)? as usize;
            take_bytes(&mut buf, len)?
        } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            if buf.is_empty() {
                return None;
            }
            let len = buf.get_u8() as usize;
            take_bytes(&mut buf, len)?
        } else {
            read_null_terminated(&mut buf).into_bytes()
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let db = read_null_terminated(&mut buf);
            if db.is_empty() {
                None
            } else {
                Some(db)
            }
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            read_null_terminated(&mut buf)
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
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

    /// Encode to packet
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);

        // Reserved (23 bytes)
        buf.extend_from_slice(&[0u8; 23]);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            put_lenenc_int(&mut buf, self.auth_response.len() as u64);
            buf.extend_from_slice(&self.auth_response);
        } else if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
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

/// COM_CHANGE_USER request
#[derive(Debug, Clone)]
pub struct ChangeUserRequest {
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub character_set: Option<u16>,
    pub auth_plugin_name: String,
}

impl ChangeUserRequest {
    /// Parse a COM_CHANGE_USER payload, including the command byte
    pub fn parse(payload: &[u8], client_capabilities: u32) -> Option<Self> {
        let mut buf = payload;
        if buf.is_empty() || buf.get_u8() != 0x11 {
            return None;
        }

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);
        if username.is_empty() {
            return None;
        }

        let auth_response = if client_capabilities & CLIENT_SECURE_CONNECTION != 0 {
            if buf.is_empty() {
                return None;
            }
            let len = buf.get_u8() as usize;
            take_bytes(&mut buf, len)?
        } else {
            let null_pos = buf.iter().position(|&b| b == 0)?;
            let data = buf[..null_pos].to_vec();
            buf.advance(null_pos + 1);
            data
        };

        let database = if buf.is_empty() {
            None
        } else {
            let db = read_null_terminated(&mut buf);
            (!db.is_empty()).then_some(db)
        };

        let character_set = if buf.len() >= 2 { Some(buf.get_u16_le()) } else { None };

        let auth_plugin_name = if client_capabilities & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            read_null_terminated(&mut buf)
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Some(Self {
            username,
            auth_response,
            database,
            character_set,
            auth_plugin_name,
        })
    }

    /// Encode to packet
    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(0x11);
        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);
        buf.put_u8(self.auth_response.len() as u8);
        buf.extend_from_slice(&self.auth_response);
        if let Some(ref db) = self.database {
            buf.extend_from_slice(db.as_bytes());
        }
        buf.put_u8(0);
        buf.put_u16_le(self.character_set.unwrap_or(0x21));
        buf.extend_from_slice(self.auth_plugin_name.as_bytes());
        buf.put_u8(0);
        Packet::new(0, buf.freeze())
    }
}

/// AuthSwitchRequest (0xFE), asks the client to continue with another plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub plugin_data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn new(plugin_name: &str, plugin_data: &[u8]) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            plugin_data: plugin_data.to_vec(),
        }
    }

    /// Switch request for mysql_native_password carrying the scramble
    pub fn native(scramble: &[u8]) -> Self {
        let mut data = scramble.to_vec();
        data.push(0);
        Self::new(NATIVE_PASSWORD_PLUGIN, &data)
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::with_capacity(self.plugin_name.len() + self.plugin_data.len() + 2);
        buf.put_u8(0xFE);
        buf.extend_from_slice(self.plugin_name.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(&self.plugin_data);
        Packet::new(sequence_id, buf.freeze())
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut buf = payload;
        if buf.is_empty() || buf.get_u8() != 0xFE {
            return None;
        }
        let plugin_name = read_null_terminated(&mut buf);
        let mut plugin_data = buf.to_vec();
        if plugin_data.last() == Some(&0) {
            plugin_data.pop();
        }
        Some(Self {
            plugin_name,
            plugin_data,
        })
    }
}

fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn xor(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// SHA1(password), the secret a native password token is derived from
pub fn password_sha1(password: &str) -> [u8; 20] {
    sha1(&[password.as_bytes()])
}

/// SHA1(SHA1(password)), the form stored in mysql.user
pub fn password_double_sha1(password: &str) -> [u8; 20] {
    sha1(&[&password_sha1(password)])
}

/// Compute mysql_native_password auth response from a clear-text password
pub fn compute_auth_response(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    native_token_from_sha1(&password_sha1(password), auth_data).to_vec()
}

/// Compute mysql_native_password auth response from SHA1(password)
pub fn native_token_from_sha1(hash1: &[u8; 20], auth_data: &[u8]) -> [u8; 20] {
    let hash2 = sha1(&[hash1]);
    let hash3 = sha1(&[auth_data, &hash2]);
    xor(hash1, &hash3)
}

/// Verify a native token against the stored SHA1(SHA1(password)).
///
/// Returns the recovered SHA1(password) on success.
pub fn check_native_token(token: &[u8], scramble: &[u8], stored: &[u8; 20]) -> Option<[u8; 20]> {
    if token.len() != 20 {
        return None;
    }
    let mut token_arr = [0u8; 20];
    token_arr.copy_from_slice(token);

    let step1 = sha1(&[scramble, stored]);
    let candidate = xor(&token_arr, &step1);
    if sha1(&[&candidate]) == *stored {
        Some(candidate)
    } else {
        None
    }
}

/// OK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: status::SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
            info: String::new(),
        }
    }

    pub fn with_status(mut self, status_flags: u16) -> Self {
        self.status_flags = status_flags;
        self
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0x00);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }
        buf.extend_from_slice(self.info.as_bytes());

        Packet::new(sequence_id, buf.freeze())
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut buf = payload;
        if buf.is_empty() || (buf[0] != 0x00 && buf[0] != 0xFE) {
            return None;
        }
        buf.advance(1);
        let affected_rows = read_lenenc_int(&mut buf)?;
        let last_insert_id = read_lenenc_int(&mut buf)?;
        let (status_flags, warnings) = if buf.len() >= 4 {
            (buf.get_u16_le(), buf.get_u16_le())
        } else {
            (0, 0)
        };
        Some(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info: String::from_utf8_lossy(buf).to_string(),
        })
    }
}

impl Default for OkPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// EOF packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn new(status_flags: u16) -> Self {
        Self {
            warnings: 0,
            status_flags,
        }
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(0xFE);
        buf.put_u16_le(self.warnings);
        buf.put_u16_le(self.status_flags);
        Packet::new(sequence_id, buf.freeze())
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() != 5 || payload[0] != 0xFE {
            return None;
        }
        let mut buf = &payload[1..];
        Some(Self {
            warnings: buf.get_u16_le(),
            status_flags: buf.get_u16_le(),
        })
    }
}

/// ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
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

    /// Parse from packet payload
    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        if payload.is_empty() || payload[0] != 0xFF {
            return None;
        }

        let mut buf = &payload[1..];
        if buf.len() < 2 {
            return None;
        }

        let error_code = buf.get_u16_le();

        let (sql_state, error_message) =
            if capabilities & CLIENT_PROTOCOL_41 != 0 && !buf.is_empty() && buf[0] == b'#' && buf.len() >= 6 {
                buf.advance(1);
                let sql_state = String::from_utf8_lossy(&buf[..5]).to_string();
                buf.advance(5);
                (sql_state, String::from_utf8_lossy(buf).to_string())
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

/// Encode a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
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

/// Encode a length-encoded string
pub fn put_lenenc_str(buf: &mut BytesMut, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Read a length-encoded integer, advancing the buffer
pub fn read_lenenc_int(buf: &mut &[u8]) -> Option<u64> {
    if buf.is_empty() {
        return None;
    }
    let first = buf.get_u8();
    let need = match first {
        0..=0xFA => return Some(first as u64),
        0xFC => 2,
        0xFD => 3,
        0xFE => 8,
        _ => return None,
    };
    if buf.len() < need {
        return None;
    }
    let mut value = 0u64;
    for i in 0..need {
        value |= (buf[i] as u64) << (8 * i);
    }
    buf.advance(need);
    Some(value)
}

/// Read a length-encoded string. NULL (0xFB) yields `Some(None)`.
pub fn read_lenenc_str(buf: &mut &[u8]) -> Option<Option<Bytes>> {
    if buf.first() == Some(&0xFB) {
        buf.advance(1);
        return Some(None);
    }
    let len = read_lenenc_int(buf)? as usize;
    let data = take_bytes(buf, len)?;
    Some(Some(Bytes::from(data)))
}

fn take_bytes(buf: &mut &[u8], len: usize) -> Option<Vec<u8>> {
    if buf.len() < len {
        return None;
    }
    let data = buf[..len].to_vec();
    buf.advance(len);
    Some(data)
}

fn read_null_terminated(buf: &mut &[u8]) -> String {
    let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let s = String::from_utf8_lossy(&buf[..null_pos]).to_string();
    buf.advance((null_pos + 1).min(buf.len()));
    s
}

/// Check if packet is OK packet
pub fn is_ok_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == 0x00
}

/// Check if packet is ERR packet
pub fn is_err_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == 0xFF
}

/// Check if packet is EOF packet
pub fn is_eof_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == 0xFE && payload.len() < 9
}
