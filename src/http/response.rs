//! HTTP/1.1 response reading: head parse via `httparse`, then body framing
//! by Content-Length, chunked transfer coding, or connection close.

use mio::net::TcpStream;

use crate::error::{Error, Result};
use crate::runtime::Handle;
use crate::runtime::net::read_some;

use super::{HttpOptions, Method};

/// Case-preserving header multimap. Duplicate names keep every value in
/// arrival order; lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in arrival order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// "1.0" or "1.1" when the server reported it.
    pub version: Option<String>,
    pub headers: Headers,
    pub body: Vec<u8>,
}

struct Head {
    status: u16,
    version: Option<String>,
    headers: Headers,
    len: usize,
}

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 8192;

fn try_parse_head(buf: &[u8]) -> Result<Option<Head>> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parser = httparse::Response::new(&mut storage);
    match parser.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let status = parser
                .code
                .ok_or_else(|| Error::Http("response missing status code".into()))?;
            let version = parser.version.map(|minor| format!("1.{}", minor));
            let mut headers = Headers::default();
            for h in parser.headers.iter() {
                headers.push(h.name, String::from_utf8_lossy(h.value).to_string());
            }
            Ok(Some(Head {
                status,
                version,
                headers,
                len,
            }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(Error::Http(format!("malformed response head: {}", e))),
    }
}

/// Route one body fragment: to the streaming sink when one is set,
/// otherwise into the buffered body; then tick the progress hook.
fn deliver_fragment(
    options: &mut HttpOptions,
    body: &mut Vec<u8>,
    fragment: &[u8],
    received: &mut u64,
    total: Option<u64>,
) {
    if fragment.is_empty() {
        return;
    }
    *received += fragment.len() as u64;
    match options.write_callback.as_mut() {
        Some(sink) => sink(fragment),
        None => body.extend_from_slice(fragment),
    }
    if let Some(progress) = options.progress_callback.as_mut() {
        progress(*received, total);
    }
}

/// Read a full response off the socket. The request always carries
/// `Connection: close`, so close-delimited bodies terminate at EOF.
///
/// Streaming hooks in `options` fire as the response arrives: headers
/// once the head parses, body fragments as they are read (chunked bodies
/// are decoded first and delivered whole), progress per body read. With a
/// write callback installed the returned `body` stays empty.
pub(crate) async fn read_response(
    handle: &Handle,
    stream: &TcpStream,
    options: &mut HttpOptions,
) -> Result<HttpResponse> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    let head = loop {
        if let Some(head) = try_parse_head(&buf)? {
            break head;
        }
        match read_some(handle, stream, &mut chunk).await? {
            0 => return Err(Error::Http("connection closed before response head".into())),
            n => buf.extend_from_slice(&chunk[..n]),
        }
    };

    if let Some(on_header) = options.header_callback.as_mut() {
        for (name, value) in head.headers.iter() {
            on_header(name, value);
        }
    }

    let body_start = head.len;
    let head_only = options.method == Method::Head;
    let no_body = head_only || head.status == 204 || head.status == 304 || head.status / 100 == 1;

    let mut body = Vec::new();
    let mut received = 0u64;

    if no_body {
        // Nothing to read.
    } else if head
        .headers
        .get("transfer-encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
    {
        // Chunked frames cannot be decoded incrementally here; raw frames
        // are buffered until the peer closes and the decoded body goes out
        // as one fragment. Progress counts raw body bytes off the wire.
        let mut raw = (buf.len() - body_start) as u64;
        if raw > 0
            && let Some(progress) = options.progress_callback.as_mut()
        {
            progress(raw, None);
        }
        loop {
            match read_some(handle, stream, &mut chunk).await? {
                0 => break,
                n => {
                    buf.extend_from_slice(&chunk[..n]);
                    raw += n as u64;
                    if let Some(progress) = options.progress_callback.as_mut() {
                        progress(raw, None);
                    }
                }
            }
        }
        let decoded = decode_chunked(&buf[body_start..])?;
        match options.write_callback.as_mut() {
            Some(sink) => sink(&decoded),
            None => body = decoded,
        }
    } else if let Some(len) = head.headers.get("content-length") {
        let len: usize = len
            .trim()
            .parse()
            .map_err(|_| Error::Http("invalid Content-Length".into()))?;
        let total = Some(len as u64);

        // Body bytes that arrived alongside the head.
        let available = buf.len().min(body_start + len) - body_start;
        deliver_fragment(
            options,
            &mut body,
            &buf[body_start..body_start + available],
            &mut received,
            total,
        );

        let mut remaining = len - available;
        while remaining > 0 {
            match read_some(handle, stream, &mut chunk).await? {
                0 => return Err(Error::Http("connection closed mid-body".into())),
                n => {
                    let take = n.min(remaining);
                    deliver_fragment(options, &mut body, &chunk[..take], &mut received, total);
                    remaining -= take;
                }
            }
        }
    } else {
        // Close-delimited body.
        deliver_fragment(options, &mut body, &buf[body_start..], &mut received, None);
        loop {
            match read_some(handle, stream, &mut chunk).await? {
                0 => break,
                n => deliver_fragment(options, &mut body, &chunk[..n], &mut received, None),
            }
        }
    }

    Ok(HttpResponse {
        status: head.status,
        version: head.version,
        headers: head.headers,
        body,
    })
}

/// Decode a complete chunked body. Trailers are ignored.
pub(crate) fn decode_chunked(mut data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let line_end = find_crlf(data).ok_or_else(|| Error::Http("truncated chunk size".into()))?;
        let size_line = &data[..line_end];
        // Chunk extensions after ';' are ignored.
        let size_text = size_line
            .split(|&b| b == b';')
            .next()
            .unwrap_or(size_line);
        let size_text =
            std::str::from_utf8(size_text).map_err(|_| Error::Http("bad chunk size".into()))?;
        let size = usize::from_str_radix(size_text.trim(), 16)
            .map_err(|_| Error::Http(format!("bad chunk size: {:?}", size_text.trim())))?;
        data = &data[line_end + 2..];

        if size == 0 {
            return Ok(out);
        }
        if data.len() < size + 2 {
            return Err(Error::Http("truncated chunk".into()));
        }
        out.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive_and_multivalued() {
        let mut h = Headers::default();
        h.push("Set-Cookie", "a=1");
        h.push("Content-Type", "text/plain");
        h.push("set-cookie", "b=2");
        assert_eq!(h.get("SET-COOKIE"), Some("a=1"));
        assert_eq!(h.get_all("set-cookie"), vec!["a=1", "b=2"]);
        assert_eq!(h.len(), 3);
        // Original casing is preserved.
        assert_eq!(h.iter().next(), Some(("Set-Cookie", "a=1")));
    }

    #[test]
    fn chunked_decoding() {
        let body = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        assert_eq!(decode_chunked(body).unwrap(), b"Wikipedia");
    }

    #[test]
    fn chunked_with_extension_and_hex_size() {
        let body = b"a;ext=1\r\n0123456789\r\n0\r\n\r\n";
        assert_eq!(decode_chunked(body).unwrap(), b"0123456789");
    }

    #[test]
    fn truncated_chunk_is_an_error() {
        assert!(decode_chunked(b"5\r\nab").is_err());
        assert!(decode_chunked(b"zz\r\n").is_err());
    }

    #[test]
    fn head_parse_extracts_status_version_headers() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nX-A: b\r\n\r\n";
        let head = try_parse_head(raw).unwrap().unwrap();
        assert_eq!(head.status, 404);
        assert_eq!(head.version.as_deref(), Some("1.1"));
        assert_eq!(head.headers.get("x-a"), Some("b"));
        assert_eq!(head.len, raw.len());
    }

    #[test]
    fn partial_head_returns_none() {
        assert!(try_parse_head(b"HTTP/1.1 200 OK\r\nCont").unwrap().is_none());
    }
}
