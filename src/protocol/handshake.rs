//! Connection-phase packets: the server greeting, the client response, the
//! auth-switch exchange, and the authentication scrambles.

use crate::constant::CapabilityFlags;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use crate::protocol::response::ErrPacket;

/// Initial handshake packet from server (Protocol::HandshakeV10)
///
/// First packet on the wire after the TCP connect. Carries the server's
/// capabilities, auth plugin name, and the scramble nonce.
///
/// Packet format:
/// ```text
/// 1   [0a] protocol version (always 10)
/// n   server version (null-terminated string)
/// 4   connection id
/// 8   auth-plugin-data-part-1 (first 8 bytes of the nonce)
/// 1   [00] filler
/// 2   capability flags (lower 2 bytes)
/// 1   character set
/// 2   status flags
/// 2   capability flags (upper 2 bytes)
/// 1   auth plugin data length
/// 10  reserved (all 0x00)
/// n   auth-plugin-data-part-2 (remaining nonce bytes)
/// n   auth plugin name (null-terminated)
/// ```
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub nonce: Vec<u8>,
    pub capabilities: CapabilityFlags,
    pub charset: u8,
    pub status: u16,
    pub auth_plugin: String,
}

impl InitialHandshake {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let protocol_version = r.u8()?;

        // A server that refuses the connection outright answers with an
        // ERR packet instead of a greeting.
        if protocol_version == 0xFF {
            return Err(ErrPacket::parse(payload)?.into());
        }

        let server_version = lossy_string(r.bytes_null()?);
        let connection_id = r.u32_le()?;
        let nonce_head = r.bytes(8)?;
        r.skip(1)?; // filler
        let cap_lower = r.u16_le()?;
        let charset = r.u8()?;
        let status = r.u16_le()?;
        let cap_upper = r.u16_le()?;

        let cap_bits = ((cap_upper as u32) << 16) | (cap_lower as u32);
        let capabilities =
            CapabilityFlags::from_bits(cap_bits).ok_or(Error::InvalidPacket)?;

        let nonce_len = r.u8()? as usize;
        r.skip(10)?; // reserved

        // Part 2 occupies MAX(13, auth_data_len - 8) bytes on the wire
        // (part 1 already carried 8), and its final byte is a NUL
        // terminator, not nonce material.
        let part2_len = nonce_len.max(21) - 8;
        let nonce_tail = r.bytes(part2_len - 1)?;
        r.skip(1)?;

        let mut nonce = Vec::with_capacity(nonce_head.len() + nonce_tail.len());
        nonce.extend_from_slice(nonce_head);
        nonce.extend_from_slice(nonce_tail);

        let auth_plugin = lossy_string(r.bytes_null()?);
        if !r.is_empty() {
            return Err(Error::InvalidPacket);
        }

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            nonce,
            capabilities,
            charset,
            status,
            auth_plugin,
        })
    }
}

/// Handshake response packet sent by client (HandshakeResponse41)
///
/// Packet format:
/// ```text
/// 4   capability flags
/// 4   max packet size
/// 1   character set
/// 23  reserved (all 0x00)
/// n   username (null-terminated string)
/// n   auth response (length-encoded if PLUGIN_AUTH_LENENC_CLIENT_DATA)
/// n   database name (null-terminated, if CONNECT_WITH_DB)
/// n   auth plugin name (null-terminated, if PLUGIN_AUTH)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub capabilities: CapabilityFlags,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
}

impl HandshakeResponse<'_> {
    pub fn write(&self, out: &mut Vec<u8>) {
        put_u32_le(out, self.capabilities.bits());
        put_u32_le(out, self.max_packet_size);
        put_u8(out, self.charset);
        out.extend_from_slice(&[0u8; 23]);
        put_str_null(out, self.username);

        if self
            .capabilities
            .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA)
        {
            put_lenenc_bytes(out, self.auth_response);
        } else {
            put_u8(out, self.auth_response.len() as u8);
            out.extend_from_slice(self.auth_response);
        }

        if let Some(db) = self.database
            && self
                .capabilities
                .contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB)
        {
            put_str_null(out, db);
        }

        if self.capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            put_str_null(out, self.auth_plugin);
        }
    }
}

/// Auth switch request from server
///
/// Sent when the server wants a different authentication method than the
/// one answered in the handshake response. Distinguished from an EOF by
/// its payload length (>= 9 bytes).
///
/// Packet format:
/// ```text
/// 1   [fe] status
/// n   plugin name (null-terminated)
/// n   plugin data (nonce for the new plugin, NUL-terminated)
/// ```
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub nonce: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        if r.u8()? != 0xFE {
            return Err(Error::InvalidPacket);
        }
        let plugin = lossy_string(r.bytes_null()?);
        let data = r.rest();
        let nonce = match data.split_last() {
            Some((0, head)) => head.to_vec(),
            _ => return Err(Error::InvalidPacket),
        };
        Ok(Self { plugin, nonce })
    }
}

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";
pub const CACHING_SHA2_PLUGIN: &str = "caching_sha2_password";

/// Compute the auth response for a plugin by name.
pub fn scramble_for_plugin(plugin: &str, password: &str, nonce: &[u8]) -> Result<Vec<u8>> {
    match plugin {
        NATIVE_PASSWORD_PLUGIN => Ok(scramble_native_password(password, nonce).to_vec()),
        CACHING_SHA2_PLUGIN => Ok(scramble_caching_sha2(password, nonce).to_vec()),
        other => Err(Error::Unsupported(format!(
            "authentication plugin: {}",
            other
        ))),
    }
}

/// mysql_native_password scramble.
///
/// `SHA1(password) XOR SHA1(nonce + SHA1(SHA1(password)))`; empty
/// passwords answer with an empty response.
pub fn scramble_native_password(password: &str, nonce: &[u8]) -> [u8; 20] {
    use sha1::{Digest, Sha1};

    if password.is_empty() {
        return [0u8; 20];
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut mixer = Sha1::new();
    mixer.update(nonce);
    mixer.update(stage2);
    let mask = mixer.finalize();

    let mut out = [0u8; 20];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = stage1[i] ^ mask[i];
    }
    out
}

/// caching_sha2_password scramble (MySQL 8.0+ default).
///
/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + nonce)`.
pub fn scramble_caching_sha2(password: &str, nonce: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    if password.is_empty() {
        return [0u8; 32];
    }

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);

    let mut mixer = Sha256::new();
    mixer.update(stage2);
    mixer.update(nonce);
    let mask = mixer.finalize();

    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = stage1[i] ^ mask[i];
    }
    out
}

/// Continuation byte after the caching_sha2 scramble: `0x03` means the
/// server's cache hit and an OK follows; `0x04` demands full
/// authentication (RSA or TLS), which this client does not speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingSha2Continuation {
    Success,
    FullAuthRequired,
}

pub fn parse_caching_sha2_continuation(payload: &[u8]) -> Result<CachingSha2Continuation> {
    let mut r = Reader::new(payload);
    if r.u8()? != 0x01 {
        return Err(Error::InvalidPacket);
    }
    match r.u8()? {
        0x03 => Ok(CachingSha2Continuation::Success),
        0x04 => Ok(CachingSha2Continuation::FullAuthRequired),
        _ => Err(Error::InvalidPacket),
    }
}

/// Is this connection-phase payload a caching_sha2 continuation frame?
pub fn is_auth_continuation(payload: &[u8]) -> bool {
    payload.len() == 2 && payload[0] == 0x01
}

#[cfg(test)]
#[path = "handshake_test.rs"]
mod handshake_test;
