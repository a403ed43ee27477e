//! PROXY protocol v2 codec (spec.md §4.8), grounded on
//! `internal/proxy_v2/proxy_v2.go` in the original implementation.
//!
//! Only the subset this tunnel needs: TCP over IPv4 or IPv6, no extra TLVs.

use crate::error::ProxyV2Error;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// 12-byte magic, followed by the version/command byte `0x21` (v2, PROXY).
const SIGNATURE: &[u8; 12] = b"\r\n\r\n\x00\r\nQUIT\n";
const VERSION_COMMAND: u8 = 0x21;
const FAMILY_TCP4: u8 = 0x11;
const FAMILY_TCP6: u8 = 0x21;

/// Length of the PROXY v2 header buffer carried inside a control-channel
/// body. Every control body (ping, CONN, ack) is fixed at 254 bytes total
/// (spec.md §4.4/§4.5: "padded to 254 bytes") — one opcode byte followed by
/// this many bytes of header-or-padding. The 2-byte length prefix the
/// framing layer adds ahead of the whole body brings the logical frame to
/// the round 256 spec.md §4.4 step 3 calls out, before the two AEAD tags
/// are appended on the wire.
pub const BODY_LEN: usize = 253;

/// Encode a PROXY v2 header describing `(local, remote)` of the public
/// connection, zero-padded to `BODY_LEN`. Source/dest in the wire header
/// are `(local side of the public socket, remote side of the public
/// socket)` so the Local can log what the public peer actually was
/// (spec.md §4.8).
pub fn encode(local: SocketAddr, remote: SocketAddr) -> [u8; BODY_LEN] {
    let mut buf = [0u8; BODY_LEN];
    buf[..12].copy_from_slice(SIGNATURE);
    buf[12] = VERSION_COMMAND;

    match (local.ip(), remote.ip()) {
        (IpAddr::V4(local_ip), IpAddr::V4(remote_ip)) => {
            buf[13] = FAMILY_TCP4;
            buf[14..16].copy_from_slice(&12u16.to_be_bytes());
            buf[16..20].copy_from_slice(&local_ip.octets());
            buf[20..24].copy_from_slice(&remote_ip.octets());
            buf[24..26].copy_from_slice(&local.port().to_be_bytes());
            buf[26..28].copy_from_slice(&remote.port().to_be_bytes());
        }
        (local_ip, remote_ip) => {
            let local_v6 = to_v6(local_ip);
            let remote_v6 = to_v6(remote_ip);
            buf[13] = FAMILY_TCP6;
            buf[14..16].copy_from_slice(&36u16.to_be_bytes());
            buf[16..32].copy_from_slice(&local_v6.octets());
            buf[32..48].copy_from_slice(&remote_v6.octets());
            buf[48..50].copy_from_slice(&local.port().to_be_bytes());
            buf[50..52].copy_from_slice(&remote.port().to_be_bytes());
        }
    }

    buf
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Decode a PROXY v2 header, returning `(local, remote)` as encoded.
pub fn decode(header: &[u8]) -> Result<(SocketAddr, SocketAddr), ProxyV2Error> {
    if header.len() < 16 || &header[..12] != SIGNATURE || header[12] != VERSION_COMMAND {
        return Err(ProxyV2Error::InvalidHeader);
    }
    let family = header[13];
    let declared_len = u16::from_be_bytes([header[14], header[15]]) as usize;

    match family {
        FAMILY_TCP4 => {
            if header.len() < 28 {
                return Err(ProxyV2Error::InvalidHeader);
            }
            if declared_len < 12 {
                return Err(ProxyV2Error::InvalidAddress);
            }
            let local_ip = Ipv4Addr::new(header[16], header[17], header[18], header[19]);
            let remote_ip = Ipv4Addr::new(header[20], header[21], header[22], header[23]);
            let local_port = u16::from_be_bytes([header[24], header[25]]);
            let remote_port = u16::from_be_bytes([header[26], header[27]]);
            Ok((
                SocketAddr::new(IpAddr::V4(local_ip), local_port),
                SocketAddr::new(IpAddr::V4(remote_ip), remote_port),
            ))
        }
        FAMILY_TCP6 => {
            if header.len() < 52 {
                return Err(ProxyV2Error::InvalidHeader);
            }
            if declared_len < 36 {
                return Err(ProxyV2Error::InvalidAddress);
            }
            let local_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&header[16..32]).unwrap());
            let remote_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&header[32..48]).unwrap());
            let local_port = u16::from_be_bytes([header[48], header[49]]);
            let remote_port = u16::from_be_bytes([header[50], header[51]]);
            Ok((
                SocketAddr::new(IpAddr::V6(local_ip), local_port),
                SocketAddr::new(IpAddr::V6(remote_ip), remote_port),
            ))
        }
        _ => Err(ProxyV2Error::InvalidAddress),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_ipv4() {
        let local: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let remote: SocketAddr = "203.0.113.5:54321".parse().unwrap();
        let encoded = encode(local, remote);
        let (decoded_local, decoded_remote) = decode(&encoded).unwrap();
        assert_eq!(decoded_local, local);
        assert_eq!(decoded_remote, remote);
    }

    #[test]
    fn roundtrip_ipv6() {
        let local: SocketAddr = "[::1]:9000".parse().unwrap();
        let remote: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let encoded = encode(local, remote);
        assert_eq!(encoded[13], FAMILY_TCP6);
        assert_eq!(u16::from_be_bytes([encoded[14], encoded[15]]), 36);
        let (decoded_local, decoded_remote) = decode(&encoded).unwrap();
        assert_eq!(decoded_local, local);
        assert_eq!(decoded_remote, remote);
    }

    #[test]
    fn decode_rejects_bad_signature() {
        let buf = [0u8; 64];
        assert!(matches!(decode(&buf), Err(ProxyV2Error::InvalidHeader)));
    }

    #[test]
    fn decode_rejects_short_header() {
        let buf = [0u8; 4];
        assert!(matches!(decode(&buf), Err(ProxyV2Error::InvalidHeader)));
    }

    #[test]
    fn decode_rejects_wrong_version_command_byte() {
        let local: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let remote: SocketAddr = "203.0.113.5:54321".parse().unwrap();
        let mut encoded = encode(local, remote);
        encoded[12] = 0x20;
        assert!(matches!(decode(&encoded), Err(ProxyV2Error::InvalidHeader)));
    }
}
