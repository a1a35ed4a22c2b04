//! Segment transfer log.
//!
//! One line per completed segment:
//! `client_ip chunk_name origin_ip duration throughput avg_throughput bitrate`

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub client_ip: IpAddr,
    pub chunk_name: String,
    pub origin_ip: IpAddr,
    pub duration: Duration,
    /// Kbps measured for this segment alone.
    pub throughput: f64,
    /// Kbps after folding this segment into the estimate.
    pub avg_throughput: f64,
    pub bitrate: u64,
}

impl fmt::Display for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {:.3} {:.2} {:.2} {}",
            self.client_ip,
            self.chunk_name,
            self.origin_ip,
            self.duration.as_secs_f64(),
            self.throughput,
            self.avg_throughput,
            self.bitrate
        )
    }
}

pub struct TransferLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl TransferLog {
    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open transfer log: {:?}", path))?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, record: &TransferRecord) -> std::io::Result<()> {
        info!("📦 {}", record);
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", record)?;
        writer.flush()
    }
}
