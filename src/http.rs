//! A thin, hand-rolled HTTP/1.1 façade over the keystore engine. Only the
//! five routes the wire contract names are implemented; everything else
//! about HTTP (keep-alive, chunked transfer, content negotiation) is
//! deliberately absent — this adapter exists to define the external byte
//! contract, not to be a general-purpose server.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use serde::Serialize;

use crate::engine::KeyStore;
use crate::error::{Error, Result};
use crate::hash::FileHash;

pub fn serve(listener: TcpListener, store: Arc<KeyStore>) -> io::Result<()> {
    for stream in listener.incoming() {
        let stream = stream?;
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            if let Err(e) = handle_connection(stream, &store) {
                tracing::warn!(error = %e, "http connection failed");
            }
        });
    }
    Ok(())
}

struct Request {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    /// Body bytes the header-line BufReader had already pulled off the
    /// socket into its own buffer before the blank line was seen.
    leftover_body: Vec<u8>,
}

fn handle_connection(mut stream: TcpStream, store: &KeyStore) -> Result<()> {
    let request = {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut request = read_request_head(&mut reader)?;
        request.leftover_body = reader.buffer().to_vec();
        request
    };

    match (request.method.as_str(), split_path(&request.path).as_slice()) {
        ("PUT", ["files", name]) => handle_put(&mut stream, store, name, &request),
        ("GET", ["files"]) => handle_list(&mut stream, store),
        ("GET", ["files", "hash", hex]) => handle_get_by_hash(&mut stream, store, hex, &request),
        ("DELETE", ["files", "hash", hex]) => handle_delete(&mut stream, store, hex),
        ("GET", ["files", name]) => handle_get_by_name(&mut stream, store, name, &request),
        _ => write_status_only(&mut stream, 404, "Not Found"),
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.trim_start_matches('/').split('/').collect()
}

fn read_request_head(reader: &mut impl BufRead) -> Result<Request> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let mut parts = line.trim_end().split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::ProtocolViolation {
            reason: "missing HTTP method".into(),
        })?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| Error::ProtocolViolation {
            reason: "missing HTTP path".into(),
        })?
        .to_string();

    let mut headers = HashMap::new();
    loop {
        let mut header_line = String::new();
        reader.read_line(&mut header_line)?;
        let header_line = header_line.trim_end();
        if header_line.is_empty() {
            break;
        }
        if let Some((k, v)) = header_line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }
    Ok(Request {
        method,
        path,
        headers,
        leftover_body: Vec::new(),
    })
}

fn write_status_only(stream: &mut TcpStream, code: u16, reason: &str) -> Result<()> {
    write!(stream, "HTTP/1.1 {code} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")?;
    Ok(())
}

fn write_json(stream: &mut TcpStream, code: u16, reason: &str, body: &[u8]) -> Result<()> {
    write!(
        stream,
        "HTTP/1.1 {code} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    stream.write_all(body)?;
    Ok(())
}

fn handle_put(stream: &mut TcpStream, store: &KeyStore, name: &str, request: &Request) -> Result<()> {
    let content_length: u64 = match request.headers.get("content-length").and_then(|v| v.parse().ok()) {
        Some(n) => n,
        None => return write_status_only(stream, 411, "Length Required"),
    };

    let leftover = io::Cursor::new(request.leftover_body.clone());
    let body = leftover.chain(stream.try_clone()?).take(content_length);
    match store.store_from_reader(name, body, content_length) {
        Ok(record) => {
            let payload = serde_json::to_vec(&UploadResponse {
                hash: record.metadata.file_hash.to_hex(),
                size: record.metadata.total_size,
            })?;
            write_json(stream, 201, "Created", &payload)
        }
        Err(e) => write_status_only(stream, 400, &e.to_string()),
    }
}

#[derive(Serialize)]
struct UploadResponse {
    hash: String,
    size: u64,
}

fn handle_get_by_name(stream: &mut TcpStream, store: &KeyStore, name: &str, request: &Request) -> Result<()> {
    match store.get_by_name(name) {
        Ok(record) => stream_with_optional_range(stream, store, &record.metadata.file_hash, record.metadata.total_size, record.metadata.block_size, request),
        Err(e) if e.is_not_found() => write_status_only(stream, 404, "Not Found"),
        Err(e) => write_status_only(stream, 500, &e.to_string()),
    }
}

fn handle_get_by_hash(stream: &mut TcpStream, store: &KeyStore, hex: &str, request: &Request) -> Result<()> {
    let hash = match FileHash::from_hex(hex) {
        Ok(h) => h,
        Err(_) => return write_status_only(stream, 400, "Bad Request"),
    };
    match store.get_by_hash(&hash) {
        Ok(record) => stream_with_optional_range(stream, store, &hash, record.metadata.total_size, record.metadata.block_size, request),
        Err(e) if e.is_not_found() => write_status_only(stream, 404, "Not Found"),
        Err(e) => write_status_only(stream, 500, &e.to_string()),
    }
}

fn stream_with_optional_range(
    stream: &mut TcpStream,
    store: &KeyStore,
    hash: &FileHash,
    total_size: u64,
    block_size: u32,
    request: &Request,
) -> Result<()> {
    let range = request
        .headers
        .get("range")
        .and_then(|v| parse_byte_range(v, total_size));

    match range {
        Some((start, end)) if block_size > 0 => {
            let response_len = end - start + 1;
            write!(
                stream,
                "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {start}-{end}/{total_size}\r\nContent-Length: {response_len}\r\nConnection: close\r\n\r\n"
            )?;
            let bs = block_size as u64;
            let first_chunk = (start / bs) as u32;
            let last_chunk_exclusive = (end / bs + 1) as u32;
            let mut writer = TrimmingWriter {
                inner: stream,
                skip: start % bs,
                remaining: response_len,
            };
            store.stream_chunk_range(hash, first_chunk, last_chunk_exclusive, &mut writer)?;
            Ok(())
        }
        _ => {
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {total_size}\r\nConnection: close\r\n\r\n"
            )?;
            store.stream_file(hash, stream)?;
            Ok(())
        }
    }
}

fn handle_delete(stream: &mut TcpStream, store: &KeyStore, hex: &str) -> Result<()> {
    let hash = match FileHash::from_hex(hex) {
        Ok(h) => h,
        Err(_) => return write_status_only(stream, 400, "Bad Request"),
    };
    match store.delete(&hash) {
        Ok(()) => write_status_only(stream, 200, "OK"),
        Err(e) => write_status_only(stream, 500, &e.to_string()),
    }
}

#[derive(Serialize)]
struct ListEntry {
    name: String,
    hash: String,
    size: u64,
}

fn handle_list(stream: &mut TcpStream, store: &KeyStore) -> Result<()> {
    let entries: Vec<ListEntry> = store
        .list_known()
        .into_iter()
        .map(|m| ListEntry {
            name: m.file_name,
            hash: m.file_hash.to_hex(),
            size: m.total_size,
        })
        .collect();
    let payload = serde_json::to_vec(&entries)?;
    write_json(stream, 200, "OK", &payload)
}

/// Drops the leading `skip` bytes of the underlying chunk stream and caps
/// total output at `remaining` bytes, so a byte range can be served through
/// the same chunk-granularity `StreamChunkRange` the wire protocol uses.
struct TrimmingWriter<'a, W: Write> {
    inner: &'a mut W,
    skip: u64,
    remaining: u64,
}

impl<'a, W: Write> Write for TrimmingWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let original_len = buf.len();
        let mut buf = buf;
        if self.skip > 0 {
            let to_skip = self.skip.min(buf.len() as u64) as usize;
            buf = &buf[to_skip..];
            self.skip -= to_skip as u64;
        }
        if self.remaining > 0 && !buf.is_empty() {
            let take = self.remaining.min(buf.len() as u64) as usize;
            self.inner.write_all(&buf[..take])?;
            self.remaining -= take as u64;
        }
        Ok(original_len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Parses a single-range `Range` header, including the `bytes=-N` suffix form.
fn parse_byte_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let value = value.strip_prefix("bytes=")?;
    if value.contains(',') || total == 0 {
        return None;
    }
    let (start_s, end_s) = value.split_once('-')?;

    if start_s.is_empty() {
        let suffix: u64 = end_s.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        let start = total.saturating_sub(suffix);
        return Some((start, total - 1));
    }

    let start: u64 = start_s.parse().ok()?;
    if start >= total {
        return None;
    }
    let end = if end_s.is_empty() {
        total - 1
    } else {
        end_s.parse::<u64>().ok()?.min(total - 1)
    };
    if start > end {
        return None;
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_range() {
        assert_eq!(parse_byte_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_byte_range("bytes=500-", 1000), Some((500, 999)));
    }

    #[test]
    fn parses_suffix_range() {
        assert_eq!(parse_byte_range("bytes=-100", 1000), Some((900, 999)));
    }

    #[test]
    fn rejects_multi_range_and_out_of_bounds() {
        assert_eq!(parse_byte_range("bytes=0-10,20-30", 1000), None);
        assert_eq!(parse_byte_range("bytes=2000-3000", 1000), None);
    }
}
