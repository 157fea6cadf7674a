//! Streaming HTTP/1.1 request-line and header parsing.
//!
//! The parser is a single forward pass over the decrypted client stream. It
//! scans every field into a fixed-capacity region owned by the connection
//! (see [`ConnectionBuffers`]), so a keep-alive connection parses an
//! arbitrary number of requests without growing the heap. A field that does
//! not fit its region is a parse failure for the whole request, never a
//! reallocation.

use crate::config::BufferSizes;
use crate::scanner::{read_byte, scan_until};
use std::io;
use thiserror::Error;
use tokio::io::AsyncRead;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const HEADER_SEP: u8 = b':';

/// Hard cap on header lines per request, hostile-input protection for the
/// header sequence itself.
const MAX_HEADERS: usize = 128;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("connection closed before a request line arrived")]
    ClientClosed,

    #[error("missing or oversized request method")]
    Method,

    #[error("missing or oversized request path")]
    Path,

    #[error("missing or oversized protocol version")]
    Protocol,

    #[error("malformed header line")]
    Header,

    #[error("more than {MAX_HEADERS} header lines")]
    TooManyHeaders,

    #[error("invalid Content-Length value: {0:?}")]
    ContentLength(String),

    #[error("request field is not valid UTF-8")]
    Encoding,

    #[error("I/O failure while reading request: {0}")]
    Io(#[from] io::Error),
}

/// Fixed-capacity scan regions, one per request field, allocated once per
/// connection and re-sliced for every request parsed on it.
pub struct ConnectionBuffers {
    pub(crate) method: Box<[u8]>,
    pub(crate) path: Box<[u8]>,
    pub(crate) protocol: Box<[u8]>,
    pub(crate) name: Box<[u8]>,
    pub(crate) value: Box<[u8]>,
    pub(crate) relay: Box<[u8]>,
}

impl ConnectionBuffers {
    pub fn new(sizes: &BufferSizes) -> Self {
        fn region(capacity: usize) -> Box<[u8]> {
            // every region must hold at least the one peeked byte
            vec![0u8; capacity.max(1)].into_boxed_slice()
        }
        Self {
            method: region(sizes.method),
            path: region(sizes.path),
            protocol: region(sizes.protocol),
            name: region(sizes.header_name),
            value: region(sizes.header_value),
            relay: region(sizes.relay_chunk),
        }
    }
}

/// A fully parsed request head, owned by the connection pipeline for the
/// duration of one forward/relay cycle.
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub protocol: String,
    /// Outgoing header sequence: duplicates allowed, insertion order kept.
    pub headers: Vec<(String, String)>,
    pub content_length: u64,
    pub expect_continue: bool,
    /// Client-supplied `X-Forwarded-For`, pulled out of the header sequence.
    pub forwarded_for: Option<String>,
}

impl ParsedRequest {
    /// Case-insensitive lookup of the first header with the given name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the client side of this request permits another cycle on the
    /// same connection.
    pub fn wants_keep_alive(&self) -> bool {
        if self.protocol.eq_ignore_ascii_case("HTTP/1.0") {
            self.header("connection")
                .map(|v| v.eq_ignore_ascii_case("keep-alive"))
                .unwrap_or(false)
        } else {
            !self
                .header("connection")
                .map(|v| v.eq_ignore_ascii_case("close"))
                .unwrap_or(false)
        }
    }
}

/// The fixed set of header names the parser treats specially while it walks
/// the header block. Everything else passes through untouched.
enum HeaderKind {
    ContentLength,
    Host,
    Expect,
    ForwardedFor,
    PassThrough,
}

impl HeaderKind {
    fn recognize(name: &str) -> Self {
        if name.eq_ignore_ascii_case("content-length") {
            HeaderKind::ContentLength
        } else if name.eq_ignore_ascii_case("host") {
            HeaderKind::Host
        } else if name.eq_ignore_ascii_case("expect") {
            HeaderKind::Expect
        } else if name.eq_ignore_ascii_case("x-forwarded-for") {
            HeaderKind::ForwardedFor
        } else {
            HeaderKind::PassThrough
        }
    }
}

/// Parses one request head off the stream.
///
/// `forward_host` replaces the value of the `Host` header when set. Any
/// failure leaves the stream in an unusable position; the caller's only
/// recovery is to close the connection.
pub async fn parse_request<R>(
    reader: &mut R,
    bufs: &mut ConnectionBuffers,
    forward_host: Option<&str>,
) -> Result<ParsedRequest, ParseError>
where
    R: AsyncRead + Unpin,
{
    // READ_METHOD. The first byte doubles as the liveness probe: a clean EOF
    // here is the client hanging up between keep-alive requests, not a
    // malformed request.
    let Some(first) = read_byte(reader).await? else {
        return Err(ParseError::ClientClosed);
    };
    if first == b' ' {
        return Err(ParseError::Method);
    }
    bufs.method[0] = first;
    let method_len = match scan_until(reader, b' ', &mut bufs.method[1..]).await? {
        Some(rest) => 1 + rest.len(),
        None => return Err(ParseError::Method),
    };
    let method = field_str(&bufs.method[..method_len])?.to_string();

    // READ_PATH
    let path = match scan_until(reader, b' ', &mut bufs.path).await? {
        Some(p) if !p.is_empty() => field_str(p)?.to_string(),
        _ => return Err(ParseError::Path),
    };

    // READ_PROTOCOL, terminated by CRLF
    let protocol = match scan_until(reader, CR, &mut bufs.protocol).await? {
        Some(p) if !p.is_empty() => field_str(p)?.to_string(),
        _ => return Err(ParseError::Protocol),
    };
    if read_byte(reader).await? != Some(LF) {
        return Err(ParseError::Protocol);
    }

    let mut req = ParsedRequest {
        method,
        path,
        protocol,
        headers: Vec::new(),
        content_length: 0,
        expect_continue: false,
        forwarded_for: None,
    };

    // READ_HEADERS
    loop {
        let Some(lead) = read_byte(reader).await? else {
            return Err(ParseError::Header);
        };
        if lead == CR {
            // blank line terminates the head
            return match read_byte(reader).await? {
                Some(LF) => Ok(req),
                _ => Err(ParseError::Header),
            };
        }
        if req.headers.len() >= MAX_HEADERS {
            return Err(ParseError::TooManyHeaders);
        }

        // `lead` is the first character of the name; scan the remainder.
        bufs.name[0] = lead;
        let name_len = match scan_until(reader, HEADER_SEP, &mut bufs.name[1..]).await? {
            Some(rest) => 1 + rest.len(),
            None => return Err(ParseError::Header),
        };
        let name = field_str(&bufs.name[..name_len])?.trim();
        if name.is_empty() {
            return Err(ParseError::Header);
        }

        let value = match scan_until(reader, CR, &mut bufs.value).await? {
            Some(v) => field_str(v)?.trim_start(),
            None => return Err(ParseError::Header),
        };
        if value.is_empty() {
            return Err(ParseError::Header);
        }
        if read_byte(reader).await? != Some(LF) {
            return Err(ParseError::Header);
        }

        match HeaderKind::recognize(name) {
            HeaderKind::ContentLength => {
                req.content_length = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ParseError::ContentLength(value.to_string()))?;
                req.headers.push((name.to_string(), value.to_string()));
            }
            HeaderKind::Host => {
                let host = forward_host.unwrap_or(value);
                req.headers.push((name.to_string(), host.to_string()));
            }
            HeaderKind::Expect => {
                if value.eq_ignore_ascii_case("100-continue") {
                    req.expect_continue = true;
                }
                req.headers.push((name.to_string(), value.to_string()));
            }
            HeaderKind::ForwardedFor => {
                // captured for the trust resolver, never forwarded as-is
                req.forwarded_for = Some(value.to_string());
            }
            HeaderKind::PassThrough => {
                req.headers.push((name.to_string(), value.to_string()));
            }
        }
    }
}

fn field_str(bytes: &[u8]) -> Result<&str, ParseError> {
    std::str::from_utf8(bytes).map_err(|_| ParseError::Encoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(bytes: &[u8]) -> Result<ParsedRequest, ParseError> {
        parse_with_host(bytes, None).await
    }

    async fn parse_with_host(
        bytes: &[u8],
        forward_host: Option<&str>,
    ) -> Result<ParsedRequest, ParseError> {
        let mut input = bytes;
        let mut bufs = ConnectionBuffers::new(&BufferSizes::default());
        parse_request(&mut input, &mut bufs, forward_host).await
    }

    #[tokio::test]
    async fn request_line_fields_recovered_exactly() {
        let req = parse(b"POST /api/v1/items HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/api/v1/items");
        assert_eq!(req.protocol, "HTTP/1.1");
        assert!(req.headers.is_empty());
    }

    #[tokio::test]
    async fn full_example_request() {
        let req = parse(
            b"GET /hello HTTP/1.1\r\nHost: a.test\r\nX-Forwarded-For: 1.2.3.4\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/hello");
        assert_eq!(req.protocol, "HTTP/1.1");
        assert_eq!(
            req.headers,
            vec![("Host".to_string(), "a.test".to_string())]
        );
        assert_eq!(req.forwarded_for.as_deref(), Some("1.2.3.4"));
        assert_eq!(req.content_length, 0);
        assert!(!req.expect_continue);
    }

    #[tokio::test]
    async fn header_order_and_duplicates_preserved() {
        let req = parse(
            b"GET / HTTP/1.1\r\nAccept: text/html\r\nCookie: a=1\r\nCookie: b=2\r\n\r\n",
        )
        .await
        .unwrap();
        let names: Vec<&str> = req.headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Accept", "Cookie", "Cookie"]);
        assert_eq!(req.headers[1].1, "a=1");
        assert_eq!(req.headers[2].1, "b=2");
    }

    #[tokio::test]
    async fn content_length_parses_to_integer() {
        let req = parse(b"PUT /u HTTP/1.1\r\nContent-Length: 42\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.content_length, 42);
        assert_eq!(req.header("content-length"), Some("42"));
    }

    #[tokio::test]
    async fn non_numeric_content_length_is_fatal() {
        let err = parse(b"PUT /u HTTP/1.1\r\nContent-Length: abc\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::ContentLength(_)));
    }

    #[tokio::test]
    async fn expect_continue_flag_is_case_insensitive() {
        let req = parse(b"POST /u HTTP/1.1\r\nExpect: 100-Continue\r\n\r\n")
            .await
            .unwrap();
        assert!(req.expect_continue);
        // the header is still forwarded
        assert_eq!(req.header("expect"), Some("100-Continue"));
    }

    #[tokio::test]
    async fn other_expect_values_do_not_set_the_flag() {
        let req = parse(b"POST /u HTTP/1.1\r\nExpect: something-else\r\n\r\n")
            .await
            .unwrap();
        assert!(!req.expect_continue);
    }

    #[tokio::test]
    async fn forwarded_for_is_captured_and_excluded() {
        let req = parse(b"GET / HTTP/1.1\r\nX-Forwarded-For: 10.0.0.5\r\nAccept: */*\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.forwarded_for.as_deref(), Some("10.0.0.5"));
        assert!(req.header("x-forwarded-for").is_none());
        assert_eq!(req.headers.len(), 1);
    }

    #[tokio::test]
    async fn host_is_replaced_when_configured() {
        let req = parse_with_host(
            b"GET / HTTP/1.1\r\nHost: public.example\r\n\r\n",
            Some("internal.local:8080"),
        )
        .await
        .unwrap();
        assert_eq!(req.header("host"), Some("internal.local:8080"));
    }

    #[tokio::test]
    async fn host_passes_through_without_replacement() {
        let req = parse(b"GET / HTTP/1.1\r\nHost: public.example\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.header("host"), Some("public.example"));
    }

    #[tokio::test]
    async fn truncated_request_line_is_a_failure() {
        let err = parse(b"GET\r\n").await.unwrap_err();
        assert!(matches!(err, ParseError::Method));
    }

    #[tokio::test]
    async fn missing_path_is_a_failure() {
        let err = parse(b"GET  HTTP/1.1\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, ParseError::Path));
    }

    #[tokio::test]
    async fn immediate_eof_reports_client_closed() {
        let err = parse(b"").await.unwrap_err();
        assert!(matches!(err, ParseError::ClientClosed));
    }

    #[tokio::test]
    async fn oversized_path_fails_instead_of_growing() {
        let sizes = BufferSizes {
            path: 8,
            ..BufferSizes::default()
        };
        let mut bufs = ConnectionBuffers::new(&sizes);
        let mut input: &[u8] = b"GET /a/very/long/path HTTP/1.1\r\n\r\n";
        let err = parse_request(&mut input, &mut bufs, None).await.unwrap_err();
        assert!(matches!(err, ParseError::Path));
    }

    #[tokio::test]
    async fn empty_header_value_is_a_failure() {
        let err = parse(b"GET / HTTP/1.1\r\nX-Empty: \r\n\r\n").await.unwrap_err();
        assert!(matches!(err, ParseError::Header));
    }

    #[tokio::test]
    async fn header_name_is_trimmed_and_value_left_trimmed() {
        let req = parse(b"GET / HTTP/1.1\r\n Accept :   text/html  \r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.headers[0].0, "Accept");
        assert_eq!(req.headers[0].1, "text/html  ");
    }

    #[tokio::test]
    async fn non_utf8_field_is_a_failure() {
        let err = parse(b"G\xffT / HTTP/1.1\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, ParseError::Encoding));
    }

    #[tokio::test]
    async fn buffers_are_reusable_across_requests() {
        let mut bufs = ConnectionBuffers::new(&BufferSizes::default());
        let mut input: &[u8] =
            b"GET /one HTTP/1.1\r\nHost: a\r\n\r\nGET /two HTTP/1.1\r\nHost: b\r\n\r\n";
        let first = parse_request(&mut input, &mut bufs, None).await.unwrap();
        let second = parse_request(&mut input, &mut bufs, None).await.unwrap();
        assert_eq!(first.path, "/one");
        assert_eq!(second.path, "/two");
        assert_eq!(second.header("host"), Some("b"));
    }

    #[tokio::test]
    async fn keep_alive_defaults() {
        let http11 = parse(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert!(http11.wants_keep_alive());

        let closing = parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        assert!(!closing.wants_keep_alive());

        let http10 = parse(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        assert!(!http10.wants_keep_alive());
    }
}
