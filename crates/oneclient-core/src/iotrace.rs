//! Optional structured per-call I/O trace.
//!
//! When enabled, every dispatcher operation appends one CSV row to an
//! `iotrace-<timestamp>.csv` file in the configured log directory. The
//! writer flushes in batches; trace failures are logged and never surface
//! to the operation being traced.

use crate::error::Result;
use crate::locking::lock;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const FLUSH_EVERY: u32 = 64;
const HEADER: &str = "timestamp_us,operation,uuid,handle_id,retries,arg_offset,arg_size,result_size,prefetch_type,duration_us\n";

#[derive(Debug, Clone)]
pub struct IoTraceEntry {
    pub operation: &'static str,
    pub uuid: String,
    pub handle_id: u64,
    pub retries: u32,
    pub offset: u64,
    pub size: u64,
    pub result_size: u64,
    pub prefetch_type: &'static str,
    pub duration_us: u64,
}

impl IoTraceEntry {
    pub fn new(operation: &'static str, uuid: &str) -> Self {
        Self {
            operation,
            uuid: uuid.to_string(),
            handle_id: 0,
            retries: 0,
            offset: 0,
            size: 0,
            result_size: 0,
            prefetch_type: "none",
            duration_us: 0,
        }
    }
}

struct WriterState {
    writer: BufWriter<File>,
    rows_since_flush: u32,
}

pub struct IoTraceLogger {
    path: PathBuf,
    state: Mutex<WriterState>,
}

impl IoTraceLogger {
    /// Creates the trace file inside `log_dir`.
    pub fn create(log_dir: &Path) -> Result<Self> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = log_dir.join(format!("iotrace-{stamp}.csv"));
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(HEADER.as_bytes())?;
        tracing::info!("I/O trace enabled, writing to {}", path.display());
        Ok(Self {
            path,
            state: Mutex::new(WriterState {
                writer,
                rows_since_flush: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one row; failures are swallowed after a log line.
    pub fn log(&self, entry: &IoTraceEntry) {
        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let row = format!(
            "{},{},{},{},{},{},{},{},{},{}\n",
            timestamp_us,
            entry.operation,
            entry.uuid,
            entry.handle_id,
            entry.retries,
            entry.offset,
            entry.size,
            entry.result_size,
            entry.prefetch_type,
            entry.duration_us,
        );
        let mut state = lock(&self.state);
        if let Err(e) = state.writer.write_all(row.as_bytes()) {
            tracing::warn!("Failed to append I/O trace row: {}", e);
            return;
        }
        state.rows_since_flush += 1;
        if state.rows_since_flush >= FLUSH_EVERY {
            state.rows_since_flush = 0;
            if let Err(e) = state.writer.flush() {
                tracing::warn!("Failed to flush I/O trace: {}", e);
            }
        }
    }

    pub fn flush(&self) {
        let mut state = lock(&self.state);
        state.rows_since_flush = 0;
        if let Err(e) = state.writer.flush() {
            tracing::warn!("Failed to flush I/O trace: {}", e);
        }
    }
}
