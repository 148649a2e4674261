use super::*;
use crate::constant::CapabilityFlags;

/// A plausible HandshakeV10 greeting: 20-byte nonce split 8 + 12,
/// mysql_native_password, PROTOCOL_41 | SECURE_CONNECTION | PLUGIN_AUTH.
fn sample_greeting() -> Vec<u8> {
    let mut p = Vec::new();
    p.push(10); // protocol version
    p.extend_from_slice(b"8.0.39\0");
    p.extend_from_slice(&42u32.to_le_bytes()); // connection id
    p.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]); // nonce part 1
    p.push(0); // filler
    let caps = CapabilityFlags::CLIENT_PROTOCOL_41
        | CapabilityFlags::CLIENT_SECURE_CONNECTION
        | CapabilityFlags::CLIENT_PLUGIN_AUTH
        | CapabilityFlags::CLIENT_DEPRECATE_EOF;
    let bits = caps.bits();
    p.extend_from_slice(&(bits as u16).to_le_bytes()); // lower caps
    p.push(0xFF); // charset
    p.extend_from_slice(&2u16.to_le_bytes()); // status: AUTOCOMMIT
    p.extend_from_slice(&((bits >> 16) as u16).to_le_bytes()); // upper caps
    p.push(21); // nonce length
    p.extend_from_slice(&[0u8; 10]); // reserved
    p.extend_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]); // nonce part 2
    p.push(0);
    p.extend_from_slice(b"mysql_native_password\0");
    p
}

#[test]
fn parse_greeting() {
    let hs = InitialHandshake::parse(&sample_greeting()).unwrap();
    assert_eq!(hs.protocol_version, 10);
    assert_eq!(hs.server_version, "8.0.39");
    assert_eq!(hs.connection_id, 42);
    assert_eq!(hs.nonce, (1u8..=20).collect::<Vec<_>>());
    assert!(hs.capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF));
    assert_eq!(hs.auth_plugin, "mysql_native_password");
}

#[test]
fn greeting_err_packet_surfaces_as_server_error() {
    let mut p = vec![0xFF, 0x15, 0x04, b'#'];
    p.extend_from_slice(b"28000");
    p.extend_from_slice(b"Access denied");
    let err = InitialHandshake::parse(&p).unwrap_err();
    assert!(matches!(err, crate::Error::Server(_)));
}

#[test]
fn native_password_scramble_vector() {
    let nonce: Vec<u8> = (1u8..=20).collect();
    let out = scramble_native_password("password", &nonce);
    assert_eq!(
        out,
        [
            193, 125, 96, 9, 165, 203, 71, 229, 159, 116, 131, 252, 240, 85, 83, 187, 191, 125,
            208, 214
        ]
    );
}

#[test]
fn caching_sha2_scramble_vector() {
    let nonce: Vec<u8> = (1u8..=20).collect();
    let out = scramble_caching_sha2("password", &nonce);
    assert_eq!(
        out,
        [
            247, 171, 28, 98, 58, 110, 152, 220, 234, 179, 94, 146, 98, 144, 229, 116, 106, 49,
            65, 17, 97, 21, 244, 221, 140, 204, 169, 148, 57, 62, 204, 221
        ]
    );
}

#[test]
fn empty_password_scrambles_are_empty_masks() {
    assert_eq!(scramble_native_password("", b"x"), [0u8; 20]);
    assert_eq!(scramble_caching_sha2("", b"x"), [0u8; 32]);
}

#[test]
fn unknown_plugin_is_rejected() {
    let err = scramble_for_plugin("sha256_password", "pw", b"nonce").unwrap_err();
    assert!(matches!(err, crate::Error::Unsupported(_)));
}

#[test]
fn handshake_response_layout() {
    let caps = CapabilityFlags::CLIENT_PROTOCOL_41
        | CapabilityFlags::CLIENT_PLUGIN_AUTH
        | CapabilityFlags::CLIENT_CONNECT_WITH_DB;
    let response = HandshakeResponse {
        capabilities: caps,
        max_packet_size: 1 << 24,
        charset: 45,
        username: "root",
        auth_response: &[0xAA; 4],
        database: Some("test"),
        auth_plugin: "mysql_native_password",
    };
    let mut out = Vec::new();
    response.write(&mut out);

    assert_eq!(&out[0..4], &caps.bits().to_le_bytes());
    assert_eq!(&out[4..8], &(1u32 << 24).to_le_bytes());
    assert_eq!(out[8], 45);
    assert_eq!(&out[9..32], &[0u8; 23]);
    assert_eq!(&out[32..37], b"root\0");
    // No LENENC_CLIENT_DATA capability: 1-byte length prefix.
    assert_eq!(out[37], 4);
    assert_eq!(&out[38..42], &[0xAA; 4]);
    assert_eq!(&out[42..47], b"test\0");
    assert_eq!(&out[47..], b"mysql_native_password\0");
}

#[test]
fn parse_auth_switch() {
    let mut p = vec![0xFE];
    p.extend_from_slice(b"mysql_native_password\0");
    p.extend_from_slice(&[1, 2, 3, 4, 0]);
    let req = AuthSwitchRequest::parse(&p).unwrap();
    assert_eq!(req.plugin, "mysql_native_password");
    assert_eq!(req.nonce, [1, 2, 3, 4]);
}

#[test]
fn caching_sha2_continuation_bytes() {
    assert_eq!(
        parse_caching_sha2_continuation(&[0x01, 0x03]).unwrap(),
        CachingSha2Continuation::Success
    );
    assert_eq!(
        parse_caching_sha2_continuation(&[0x01, 0x04]).unwrap(),
        CachingSha2Continuation::FullAuthRequired
    );
    assert!(parse_caching_sha2_continuation(&[0x02, 0x03]).is_err());
}
