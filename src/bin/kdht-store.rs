use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;

use clap::Parser;
use kdht_store::cli::{init_logging, resolve_store_root, Action, Cli, Mode};
use kdht_store::engine::{KeyStore, KeyStoreConfig};
use kdht_store::hash::FileHash;
use kdht_store::progress::TracingProgress;
use kdht_store::{Error, Result};

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let code = match run(&cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<()> {
    match cli.mode {
        Mode::Run => run_local(cli),
        Mode::Remote => run_remote(cli),
    }
}

fn open_store(cli: &Cli) -> Result<KeyStore> {
    let root = resolve_store_root(cli)?;
    let mut config = KeyStoreConfig::new(root);
    if let Some(ttl) = cli.ttl_seconds {
        config.default_ttl = ttl;
    }
    KeyStore::open_with_progress(config, std::sync::Arc::new(TracingProgress))
}

fn require_target<'a>(cli: &'a Cli) -> Result<&'a str> {
    cli.target.as_deref().ok_or_else(|| Error::BadArgument {
        reason: "this action requires a target (path, name, or hash)".into(),
    })
}

fn resolve_record(store: &KeyStore, target: &str) -> Result<kdht_store::metadata::FileRecord> {
    if let Ok(hash) = FileHash::from_hex(target) {
        if let Ok(record) = store.get_by_hash(&hash) {
            return Ok(record);
        }
    }
    store.get_by_name(target)
}

fn run_local(cli: &Cli) -> Result<()> {
    let store = open_store(cli)?;

    match cli.action {
        Action::Upload | Action::Store => {
            let path = require_target(cli)?;
            let record = store.store_from_path(path)?;
            println!("{} {}", record.metadata.file_hash.to_hex(), record.metadata.file_name);
        }
        Action::View | Action::Download => {
            let target = require_target(cli)?;
            let record = resolve_record(&store, target)?;
            let hash = record.metadata.file_hash;
            if cli.reassemble || cli.output.is_some() {
                let out = cli
                    .output
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(&record.metadata.file_name));
                store.reassemble_to_path(&hash, &out)?;
                println!("wrote {}", out.display());
            } else {
                let stdout = io::stdout();
                let mut lock = stdout.lock();
                store.stream_file(&hash, &mut lock)?;
            }
        }
        Action::Delete => {
            let target = require_target(cli)?;
            let record = resolve_record(&store, target)?;
            store.delete(&record.metadata.file_hash)?;
            println!("deleted {}", record.metadata.file_hash.to_hex());
        }
        Action::Verify => {
            let errors = match &cli.target {
                Some(target) => {
                    let hash = FileHash::from_hex(target)?;
                    store.verify_file(&hash)
                }
                None => store.verify_all(),
            };
            for err in &errors {
                println!("{}: chunk {} — {:?}", err.file_name, err.chunk_index, err.kind);
            }
            if !errors.is_empty() {
                return Err(Error::Corruption {
                    reason: format!("{} verification error(s)", errors.len()),
                });
            }
        }
        Action::Expire => {
            let count = store.cleanup_expired();
            println!("expired {count} file(s)");
        }
        Action::Clean => {
            let count = store.reconcile_orphans()?;
            println!("reconciled {count} orphaned record(s)");
        }
        Action::DeepClean => {
            let reconciled = store.reconcile_orphans()?;
            let swept = store.sweep_orphan_chunk_files()?;
            println!("reconciled {reconciled} record(s), removed {swept} orphan chunk file(s)");
        }
        Action::Stats => {
            let known = store.list_known();
            let total_bytes: u64 = known.iter().map(|m| m.total_size).sum();
            println!("{} file(s), {total_bytes} byte(s)", known.len());
        }
    }
    Ok(())
}

const WIRE_UPLOAD: u8 = 0x01;
const WIRE_DOWNLOAD: u8 = 0x02;
const WIRE_LIST: u8 = 0x03;
const WIRE_DELETE: u8 = 0x04;
const WIRE_OK: u8 = 0x00;
const WIRE_NOT_FOUND: u8 = 0x01;

fn run_remote(cli: &Cli) -> Result<()> {
    match cli.action {
        Action::Upload | Action::Store => {
            let path = require_target(cli)?;
            let data = std::fs::read(path)?;
            let name = std::path::Path::new(path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unnamed");
            let mut stream = TcpStream::connect(&cli.addr)?;

            let mut frame = Vec::new();
            frame.extend_from_slice(&(name.len() as u16).to_be_bytes());
            frame.extend_from_slice(name.as_bytes());
            frame.extend_from_slice(&(data.len() as u64).to_be_bytes());

            stream.write_all(&[WIRE_UPLOAD])?;
            stream.write_all(&(frame.len() as u32).to_be_bytes())?;
            stream.write_all(&frame)?;
            stream.write_all(&data)?;

            let mut status = [0u8; 1];
            stream.read_exact(&mut status)?;
            if status[0] != WIRE_OK {
                return Err(Error::ProtocolViolation {
                    reason: "remote upload failed".into(),
                });
            }
            let mut hash = [0u8; 32];
            stream.read_exact(&mut hash)?;
            println!("{}", FileHash(hash).to_hex());
        }
        Action::View | Action::Download => {
            let target = require_target(cli)?;
            let mut stream = TcpStream::connect(&cli.addr)?;
            let mut frame = Vec::new();
            if let Ok(hash) = FileHash::from_hex(target) {
                frame.push(0u8);
                frame.extend_from_slice(hash.as_bytes());
            } else {
                frame.push(1u8);
                frame.extend_from_slice(target.as_bytes());
            }
            stream.write_all(&[WIRE_DOWNLOAD])?;
            stream.write_all(&(frame.len() as u32).to_be_bytes())?;
            stream.write_all(&frame)?;

            let mut status = [0u8; 1];
            stream.read_exact(&mut status)?;
            if status[0] == WIRE_NOT_FOUND {
                return Err(Error::not_found(target));
            }
            let mut size_buf = [0u8; 8];
            stream.read_exact(&mut size_buf)?;
            let size = u64::from_be_bytes(size_buf);
            let mut body = vec![0u8; size as usize];
            stream.read_exact(&mut body)?;

            if let Some(out) = &cli.output {
                std::fs::write(out, &body)?;
                println!("wrote {}", out.display());
            } else {
                io::stdout().write_all(&body)?;
            }
        }
        Action::Delete => {
            let target = require_target(cli)?;
            let hash = FileHash::from_hex(target)?;
            let mut stream = TcpStream::connect(&cli.addr)?;
            stream.write_all(&[WIRE_DELETE])?;
            stream.write_all(&32u32.to_be_bytes())?;
            stream.write_all(hash.as_bytes())?;

            let mut status = [0u8; 1];
            stream.read_exact(&mut status)?;
            println!("delete status: 0x{:02x}", status[0]);
        }
        Action::Stats => {
            let mut stream = TcpStream::connect(&cli.addr)?;
            stream.write_all(&[WIRE_LIST])?;
            stream.write_all(&0u32.to_be_bytes())?;

            let mut status = [0u8; 1];
            stream.read_exact(&mut status)?;
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf)?;
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body)?;
            io::stdout().write_all(&body)?;
            println!();
        }
        Action::Verify | Action::Expire | Action::Clean | Action::DeepClean => {
            return Err(Error::Unsupported {
                reason: "this action has no remote wire-protocol equivalent".into(),
            });
        }
    }
    Ok(())
}
