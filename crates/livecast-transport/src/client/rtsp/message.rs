//! RTSP/1.0 request encoding and response parsing.

use bytes::{Buf, BytesMut};

use crate::error::TransportError;
use crate::TransportResult;

const USER_AGENT: &str = concat!("livecast/", env!("CARGO_PKG_VERSION"));

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<(&'static str, String)>,
}

impl Request {
    pub fn new(method: &'static str, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn body(mut self, content_type: &'static str, body: String) -> Self {
        self.body = Some((content_type, body));
        self
    }

    /// Serialize with the given sequence number.
    pub fn encode(&self, cseq: u32) -> Vec<u8> {
        let mut out = format!("{} {} RTSP/1.0\r\nCSeq: {}\r\n", self.method, self.url, cseq);
        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str(&format!("User-Agent: {}\r\n", USER_AGENT));
        match self.body {
            Some((content_type, ref body)) => {
                out.push_str(&format!(
                    "Content-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
                    content_type,
                    body.len(),
                    body
                ));
            }
            None => out.push_str("\r\n"),
        }
        out.into_bytes()
    }
}

/// A parsed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    /// First header named `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq").and_then(|v| v.trim().parse().ok())
    }

    /// Session id without the `;timeout=` suffix.
    pub fn session_id(&self) -> Option<String> {
        self.header("Session")
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
    }
}

/// One message read from the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Response(Response),

    /// `$`-framed binary data (RTCP from the server), skipped.
    Interleaved { channel: u8, len: usize },
}

/// Take one complete message from the front of `buf`. Returns `None` when
/// more bytes are needed.
pub fn take_message(buf: &mut BytesMut) -> TransportResult<Option<Incoming>> {
    if buf.is_empty() {
        return Ok(None);
    }

    if buf[0] == b'$' {
        if buf.len() < 4 {
            return Ok(None);
        }
        let channel = buf[1];
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + len {
            return Ok(None);
        }
        buf.advance(4 + len);
        return Ok(Some(Incoming::Interleaved { channel, len }));
    }

    let Some(head_end) = find(&buf[..], b"\r\n\r\n") else {
        return Ok(None);
    };
    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| TransportError::Protocol("RTSP response is not UTF-8".to_string()))?;

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    if !version.starts_with("RTSP/") {
        return Err(TransportError::Protocol(format!(
            "unexpected RTSP status line: {}",
            status_line
        )));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransportError::Protocol(format!("bad status line: {}", status_line)))?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();
    let content_length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let total = head_end + 4 + content_length;
    if buf.len() < total {
        return Ok(None);
    }
    let body = String::from_utf8_lossy(&buf[head_end + 4..total]).into_owned();
    buf.advance(total);

    Ok(Some(Incoming::Response(Response {
        status,
        reason,
        headers,
        body,
    })))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// `server_port=a-b` from a Transport header.
pub fn server_ports(transport: &str) -> Option<(u16, u16)> {
    transport.split(';').find_map(|param| {
        let range = param.trim().strip_prefix("server_port=")?;
        match range.split_once('-') {
            Some((rtp, rtcp)) => Some((rtp.parse().ok()?, rtcp.parse().ok()?)),
            None => {
                let rtp: u16 = range.parse().ok()?;
                Some((rtp, rtp.wrapping_add(1)))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_announce() {
        let request = Request::new("ANNOUNCE", "rtsp://host:554/live")
            .header("Session", "abc")
            .body("application/sdp", "v=0\r\n".to_string());
        let text = String::from_utf8(request.encode(2)).unwrap();

        assert!(text.starts_with("ANNOUNCE rtsp://host:554/live RTSP/1.0\r\nCSeq: 2\r\n"));
        assert!(text.contains("Session: abc\r\n"));
        assert!(text.contains("Content-Length: 5\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn test_parse_response_in_pieces() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nSession: 12345678;timeout=60\r\nContent-Length: 4\r\n\r\nbody";
        let mut buf = BytesMut::from(&raw[..20]);
        assert_eq!(take_message(&mut buf).unwrap(), None);

        buf.extend_from_slice(&raw[20..]);
        let Some(Incoming::Response(response)) = take_message(&mut buf).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(response.status, 200);
        assert_eq!(response.cseq(), Some(3));
        assert_eq!(response.session_id().as_deref(), Some("12345678"));
        assert_eq!(response.body, "body");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_skip_interleaved_rtcp() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'$', 1, 0, 2, 0xAA, 0xBB]);
        buf.extend_from_slice(b"RTSP/1.0 401 Unauthorized\r\nCSeq: 1\r\n\r\n");

        assert_eq!(
            take_message(&mut buf).unwrap(),
            Some(Incoming::Interleaved { channel: 1, len: 2 })
        );
        let Some(Incoming::Response(response)) = take_message(&mut buf).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(response.status, 401);
        assert_eq!(response.reason, "Unauthorized");
    }

    #[test]
    fn test_garbage_is_an_error() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\n\r\n"[..]);
        assert!(take_message(&mut buf).is_err());
    }

    #[test]
    fn test_server_ports() {
        assert_eq!(
            server_ports("RTP/AVP;unicast;client_port=5000-5001;server_port=6970-6971"),
            Some((6970, 6971))
        );
        assert_eq!(server_ports("RTP/AVP;unicast;server_port=7000"), Some((7000, 7001)));
        assert_eq!(server_ports("RTP/AVP/TCP;interleaved=0-1"), None);
    }
}
