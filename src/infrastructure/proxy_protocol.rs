//! PROXY Protocol v1
//!
//! Text preamble announcing the original client to a backend:
//! `PROXY TCP4|TCP6 <src> <dst> <srcport> <dstport>\r\n`.

use std::net::SocketAddr;

/// Longest possible v1 header, CRLF included.
pub const MAX_HEADER_LEN: usize = 107;

/// Format a v1 header for a client connection.
///
/// `src` is the client's address and `dst` the relay address it connected
/// to. Either one missing yields `PROXY UNKNOWN`.
pub fn format_v1(src: Option<SocketAddr>, dst: Option<SocketAddr>) -> String {
    let (src, dst) = match (src, dst) {
        (Some(s), Some(d)) => (s, d),
        _ => return "PROXY UNKNOWN\r\n".to_string(),
    };
    let proto = if src.is_ipv4() { "TCP4" } else { "TCP6" };
    format!(
        "PROXY {} {} {} {} {}\r\n",
        proto,
        src.ip(),
        dst.ip(),
        src.port(),
        dst.port()
    )
}
