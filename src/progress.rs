//! Presentation-layer observer hooks. The engine calls these with structured
//! events; it never touches a terminal or a logger directly.

use crate::hash::FileHash;

pub trait ProgressObserver: Send + Sync {
    fn phase_begin(&self, phase: &str) {
        let _ = phase;
    }

    fn bytes_written(&self, file_hash: &FileHash, bytes: u64) {
        let _ = (file_hash, bytes);
    }

    fn phase_end(&self, phase: &str) {
        let _ = phase;
    }
}

/// An observer that does nothing; the default when the caller doesn't care.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressObserver for NullProgress {}

/// An observer that emits `tracing` events, for operators running the CLI
/// with `--verbose`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressObserver for TracingProgress {
    fn phase_begin(&self, phase: &str) {
        tracing::info!(phase, "phase begin");
    }

    fn bytes_written(&self, file_hash: &FileHash, bytes: u64) {
        tracing::debug!(file_hash = %file_hash, bytes, "bytes written");
    }

    fn phase_end(&self, phase: &str) {
        tracing::info!(phase, "phase end");
    }
}
