//! Length-prefixed TCP protocol: one command per connection, a frame is a
//! 4-byte big-endian length prefix followed by that many payload bytes.

use serde::Serialize;
use std::io::{self, Cursor, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::KeyStore;
use crate::error::{Error, Result};
use crate::hash::FileHash;

const OP_UPLOAD: u8 = 0x01;
const OP_DOWNLOAD: u8 = 0x02;
const OP_LIST: u8 = 0x03;
const OP_DELETE: u8 = 0x04;

const STATUS_OK: u8 = 0x00;
const STATUS_NOT_FOUND: u8 = 0x01;
const STATUS_ERROR: u8 = 0x02;

/// Runs the TCP service, spawning one OS thread per connection. `deadline`
/// of `Duration::ZERO` disables the per-connection read/write timeout.
pub fn serve(listener: TcpListener, store: Arc<KeyStore>, deadline: Duration) -> io::Result<()> {
    for stream in listener.incoming() {
        let stream = stream?;
        let store = Arc::clone(&store);
        let deadline = deadline;
        std::thread::spawn(move || {
            if let Err(e) = handle_connection(stream, &store, deadline) {
                tracing::warn!(error = %e, "connection handler failed");
            }
        });
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, store: &KeyStore, deadline: Duration) -> Result<()> {
    let timeout = if deadline.is_zero() { None } else { Some(deadline) };
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;

    let mut opcode = [0u8; 1];
    stream.read_exact(&mut opcode)?;
    let frame = read_frame(&mut stream)?;

    match opcode[0] {
        OP_UPLOAD => handle_upload(&mut stream, store, &frame),
        OP_DOWNLOAD => handle_download(&mut stream, store, &frame),
        OP_LIST => handle_list(&mut stream, store),
        OP_DELETE => handle_delete(&mut stream, store, &frame),
        other => {
            write_error(&mut stream, &format!("unknown opcode 0x{other:02x}"))?;
            Err(Error::ProtocolViolation {
                reason: format!("unknown opcode 0x{other:02x}"),
            })
        }
    }
}

fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

fn write_frame(stream: &mut TcpStream, body: &[u8]) -> io::Result<()> {
    stream.write_all(&(body.len() as u32).to_be_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

fn write_error(stream: &mut TcpStream, message: &str) -> io::Result<()> {
    stream.write_all(&[STATUS_ERROR])?;
    write_frame(stream, message.as_bytes())
}

fn handle_upload(stream: &mut TcpStream, store: &KeyStore, frame: &[u8]) -> Result<()> {
    if frame.len() < 2 {
        write_error(stream, "upload frame too short")?;
        return Err(Error::ProtocolViolation {
            reason: "upload frame shorter than name_len field".into(),
        });
    }
    let name_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    let mut cursor = 2;
    if frame.len() < cursor + name_len + 8 {
        write_error(stream, "upload frame missing name or size")?;
        return Err(Error::ProtocolViolation {
            reason: "upload frame truncated before file_size".into(),
        });
    }
    let name = String::from_utf8_lossy(&frame[cursor..cursor + name_len]).into_owned();
    cursor += name_len;
    let file_size = u64::from_be_bytes(frame[cursor..cursor + 8].try_into().unwrap());
    cursor += 8;

    // Bytes left over inside the frame are the start of the file body; the
    // rest must still be read off the raw connection.
    let leftover = frame[cursor..].to_vec();
    let combined = Cursor::new(leftover).chain(stream.try_clone()?);
    let limited = combined.take(file_size);

    match store.store_from_reader(&name, limited, file_size) {
        Ok(record) => {
            stream.write_all(&[STATUS_OK])?;
            stream.write_all(record.metadata.file_hash.as_bytes())?;
            Ok(())
        }
        Err(e) => {
            write_error(stream, &e.to_string())?;
            Err(e)
        }
    }
}

fn handle_download(stream: &mut TcpStream, store: &KeyStore, frame: &[u8]) -> Result<()> {
    if frame.is_empty() {
        write_error(stream, "download frame missing lookup type")?;
        return Err(Error::ProtocolViolation {
            reason: "empty download frame".into(),
        });
    }
    let lookup_type = frame[0];
    let key = &frame[1..];

    let record = match lookup_type {
        0 => {
            if key.len() != 32 {
                write_error(stream, "hash key must be 32 bytes")?;
                return Err(Error::ProtocolViolation {
                    reason: "malformed hash key".into(),
                });
            }
            let hash = FileHash(key.try_into().unwrap());
            store.get_by_hash(&hash)
        }
        1 => {
            let name = String::from_utf8_lossy(key).into_owned();
            store.get_by_name(&name)
        }
        other => {
            write_error(stream, &format!("unknown lookup type {other}"))?;
            return Err(Error::ProtocolViolation {
                reason: format!("unknown lookup type {other}"),
            });
        }
    };

    match record {
        Ok(record) => {
            stream.write_all(&[STATUS_OK])?;
            stream.write_all(&record.metadata.total_size.to_be_bytes())?;
            store.stream_file(&record.metadata.file_hash, stream)?;
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            stream.write_all(&[STATUS_NOT_FOUND])?;
            Ok(())
        }
        Err(e) => {
            write_error(stream, &e.to_string())?;
            Err(e)
        }
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
    let json = serde_json::to_vec(&entries)?;
    stream.write_all(&[STATUS_OK])?;
    write_frame(stream, &json)?;
    Ok(())
}

fn handle_delete(stream: &mut TcpStream, store: &KeyStore, frame: &[u8]) -> Result<()> {
    if frame.len() != 32 {
        write_error(stream, "delete frame must carry a 32-byte file hash")?;
        return Err(Error::ProtocolViolation {
            reason: "malformed delete frame".into(),
        });
    }
    let hash = FileHash(frame.try_into().unwrap());
    match store.delete(&hash) {
        Ok(()) => {
            stream.write_all(&[STATUS_OK])?;
            Ok(())
        }
        Err(e) => {
            write_error(stream, &e.to_string())?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::KeyStoreConfig;
    use std::io::Read;
    use std::net::TcpListener;
    use tempfile::TempDir;

    fn spawn_server() -> (std::net::SocketAddr, Arc<KeyStore>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(KeyStore::open(KeyStoreConfig::new(tmp.path())).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let store_clone = Arc::clone(&store);
        std::thread::spawn(move || {
            let _ = serve(listener, store_clone, Duration::from_secs(5));
        });
        (addr, store, tmp)
    }

    #[test]
    fn upload_round_trips_hash() {
        let (addr, _store, _tmp) = spawn_server();
        let mut stream = TcpStream::connect(addr).unwrap();

        let body = b"hello world";
        let name = b"x";
        let mut frame = Vec::new();
        frame.extend_from_slice(&(name.len() as u16).to_be_bytes());
        frame.extend_from_slice(name);
        frame.extend_from_slice(&(body.len() as u64).to_be_bytes());

        stream.write_all(&[OP_UPLOAD]).unwrap();
        stream.write_all(&(frame.len() as u32).to_be_bytes()).unwrap();
        stream.write_all(&frame).unwrap();
        stream.write_all(body).unwrap();

        let mut status = [0u8; 1];
        stream.read_exact(&mut status).unwrap();
        assert_eq!(status[0], STATUS_OK);

        let mut hash = [0u8; 32];
        stream.read_exact(&mut hash).unwrap();
        assert_eq!(FileHash(hash), crate::hash::hash_bytes(body));
    }

    #[test]
    fn download_missing_hash_reports_not_found() {
        let (addr, _store, _tmp) = spawn_server();
        let mut stream = TcpStream::connect(addr).unwrap();

        let mut frame = vec![0u8];
        frame.extend_from_slice(&[0u8; 32]);

        stream.write_all(&[OP_DOWNLOAD]).unwrap();
        stream.write_all(&(frame.len() as u32).to_be_bytes()).unwrap();
        stream.write_all(&frame).unwrap();

        let mut status = [0u8; 1];
        stream.read_exact(&mut status).unwrap();
        assert_eq!(status[0], STATUS_NOT_FOUND);
    }
}
