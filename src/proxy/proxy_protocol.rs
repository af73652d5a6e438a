//! PROXY protocol header generation.
//!
//! When a target opts in, a v1 (text) or v2 (binary) header carrying the
//! original client address is written to the upstream connection before any
//! payload.

use std::net::{IpAddr, SocketAddr};

/// v2 signature bytes.
const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2, PROXY command.
const V2_VERSION_PROXY: u8 = 0x21;

/// AF_INET / AF_INET6 (high nibble) with STREAM (low nibble).
const V2_TCP4: u8 = 0x11;
const V2_TCP6: u8 = 0x21;

/// Render the v1 text header line.
///
/// Mixed address families fall back to the UNKNOWN form, which receivers
/// must skip.
pub fn encode_v1(src: SocketAddr, dst: SocketAddr) -> String {
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            format!("PROXY TCP4 {s} {d} {} {}\r\n", src.port(), dst.port())
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            format!("PROXY TCP6 {s} {d} {} {}\r\n", src.port(), dst.port())
        }
        _ => "PROXY UNKNOWN\r\n".to_string(),
    }
}

/// Render the v2 binary header.
pub fn encode_v2(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + 36);
    buf.extend_from_slice(&V2_SIGNATURE);
    buf.push(V2_VERSION_PROXY);

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            buf.push(V2_TCP4);
            buf.extend_from_slice(&12u16.to_be_bytes());
            buf.extend_from_slice(&s.octets());
            buf.extend_from_slice(&d.octets());
        }
        (s, d) => {
            // Any v6 endpoint promotes both sides to the v6 form.
            buf.push(V2_TCP6);
            buf.extend_from_slice(&36u16.to_be_bytes());
            buf.extend_from_slice(&to_v6(s).octets());
            buf.extend_from_slice(&to_v6(d).octets());
        }
    }
    buf.extend_from_slice(&src.port().to_be_bytes());
    buf.extend_from_slice(&dst.port().to_be_bytes());
    buf
}

fn to_v6(ip: IpAddr) -> std::net::Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}
