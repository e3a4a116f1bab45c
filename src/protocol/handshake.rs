//! Handshake and status payloads, seen from the client side.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::packet::capabilities::*;
use crate::protocol::wire::{PayloadReader, PayloadWriter};

/// MySQL initial handshake (server greeting)
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    /// Full 20-byte auth scramble (part 1 + part 2, trailing NUL stripped)
    pub auth_plugin_data: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Parse the greeting payload the server sends first.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);

        let protocol_version = r.read_u8()?;
        if protocol_version != 10 {
            return Err(Error::Protocol(format!(
                "unsupported handshake protocol version {protocol_version}"
            )));
        }

        let server_version = r.read_null_terminated()?.to_string();
        let connection_id = r.read_u32_le()?;

        let mut auth_plugin_data = r.read_bytes(8)?.to_vec();
        r.skip(1)?; // filler

        let capability_flags_lower = u32::from(r.read_u16_le()?);
        let character_set = r.read_u8()?;
        let status_flags = r.read_u16_le()?;
        let capability_flags_upper = u32::from(r.read_u16_le()?);
        let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

        let auth_plugin_data_len = r.read_u8()? as usize;
        r.skip(10)?; // reserved

        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            // Documented as max(13, len - 8); the 13th byte is a NUL filler.
            let part2_len = std::cmp::max(13, auth_plugin_data_len.saturating_sub(8));
            let part2 = r.read_bytes(part2_len)?;
            let trimmed = part2.strip_suffix(&[0]).unwrap_or(part2);
            auth_plugin_data.extend_from_slice(trimmed);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
            // Some server builds omit the trailing NUL on the plugin name.
            match r.read_null_terminated() {
                Ok(name) => name.to_string(),
                Err(_) => String::from_utf8_lossy(r.read_rest()).to_string(),
            }
        } else {
            "mysql_native_password".to_string()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data,
            auth_plugin_name,
        })
    }
}

/// Handshake response (client -> server)
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
    pub fn to_payload(&self) -> Bytes {
        let mut w = PayloadWriter::with_capacity(128);

        w.write_u32_le(self.capability_flags);
        w.write_u32_le(self.max_packet_size);
        w.write_u8(self.character_set);
        w.write_bytes(&[0u8; 23]); // reserved

        w.write_null_terminated(&self.username);

        if self.capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            w.write_lenenc_bytes(&self.auth_response);
        } else if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            w.write_u8(self.auth_response.len() as u8);
            w.write_bytes(&self.auth_response);
        } else {
            w.write_bytes(&self.auth_response);
            w.write_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            w.write_null_terminated(self.database.as_deref().unwrap_or(""));
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            w.write_null_terminated(&self.auth_plugin_name);
        }

        w.freeze()
    }
}

/// Short response requesting a TLS upgrade, sent in place of the full
/// handshake response when CLIENT_SSL is negotiated. The server switches to
/// TLS after reading it; the real response follows over the encrypted stream.
pub fn ssl_request_payload(capability_flags: u32, max_packet_size: u32, character_set: u8) -> Bytes {
    let mut w = PayloadWriter::with_capacity(32);
    w.write_u32_le(capability_flags);
    w.write_u32_le(max_packet_size);
    w.write_u8(character_set);
    w.write_bytes(&[0u8; 23]);
    w.freeze()
}

/// OK payload (0x00 header)
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn parse(payload: &[u8], capability_flags: u32) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        let header = r.read_u8()?;
        if header != 0x00 && header != 0xFE {
            return Err(Error::Protocol(format!(
                "expected OK payload, got header {header:#04x}"
            )));
        }

        let affected_rows = r.read_lenenc_int()?;
        let last_insert_id = r.read_lenenc_int()?;

        let (status_flags, warnings) = if capability_flags & CLIENT_PROTOCOL_41 != 0 {
            (r.read_u16_le()?, r.read_u16_le()?)
        } else {
            (0, 0)
        };

        Ok(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
        })
    }
}

/// ERR payload (0xFF header)
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn parse(payload: &[u8], capability_flags: u32) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        let header = r.read_u8()?;
        if header != 0xFF {
            return Err(Error::Protocol(format!(
                "expected ERR payload, got header {header:#04x}"
            )));
        }

        let error_code = r.read_u16_le()?;

        let rest = r.read_rest();
        let (sql_state, error_message) =
            if capability_flags & CLIENT_PROTOCOL_41 != 0 && rest.first() == Some(&b'#') && rest.len() >= 6 {
                (
                    String::from_utf8_lossy(&rest[1..6]).to_string(),
                    String::from_utf8_lossy(&rest[6..]).to_string(),
                )
            } else {
                ("HY000".to_string(), String::from_utf8_lossy(rest).to_string())
            };

        Ok(Self {
            error_code,
            sql_state,
            error_message,
        })
    }

    pub fn into_error(self) -> Error {
        Error::Server {
            code: self.error_code,
            sql_state: self.sql_state,
            message: self.error_message,
        }
    }
}

/// Mid-handshake request to switch authentication plugins (0xFE header,
/// long form). The short 0xFE form is an EOF packet and must not match.
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub plugin_data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        let header = r.read_u8()?;
        if header != 0xFE {
            return Err(Error::Protocol(format!(
                "expected auth-switch payload, got header {header:#04x}"
            )));
        }

        let plugin_name = r.read_null_terminated()?.to_string();
        // Trailing NUL on the scramble is padding, not data.
        let data = r.read_rest();
        let plugin_data = data.strip_suffix(&[0]).unwrap_or(data).to_vec();

        Ok(Self {
            plugin_name,
            plugin_data,
        })
    }
}

/// Check if payload is an OK packet
pub fn is_ok_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == 0x00
}

/// Check if payload is an ERR packet
pub fn is_err_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == 0xFF
}

/// Check if payload is an EOF packet
pub fn is_eof_packet(payload: &[u8], capability_flags: u32) -> bool {
    if capability_flags & CLIENT_DEPRECATE_EOF != 0 {
        false
    } else {
        !payload.is_empty() && payload[0] == 0xFE && payload.len() < 9
    }
}

/// Check if payload is an auth-switch request (long 0xFE form)
pub fn is_auth_switch(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == 0xFE && payload.len() >= 9
}

/// Check if payload is auth-more-data (0x01 header)
pub fn is_auth_more_data(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == 0x01
}
