//! Span export to a newline-delimited JSON file with size-based rotation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use flate2::write::GzEncoder;
use flate2::Compression;

use super::spans::{FinishedSpan, SpanExporter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            keep: 1,
            compress: false,
        }
    }
}

/// Appending file writer.  Once the file reaches `max_bytes` it is shifted to
/// `<path>.1` (older backups to `.2` .. `.keep`), optionally gzipped, and a
/// fresh file is started.
pub struct RotatingFile {
    path: PathBuf,
    file: File,
    rotation: RotationConfig,
}

impl RotatingFile {
    pub fn open(path: impl AsRef<Path>, rotation: RotationConfig) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            rotation,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.path.metadata().map(|m| m.len()).unwrap_or(0)
    }

    pub fn append_line(&mut self, line: &str) -> io::Result<()> {
        if let Some(limit) = self.rotation.max_bytes {
            if self.size() >= limit {
                self.rotate()?;
            }
        }
        writeln!(self.file, "{}", line)
    }

    fn numbered(&self, idx: usize, gz: bool) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{}", idx));
        if gz {
            name.push(".gz");
        }
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        if self.rotation.keep > 0 {
            let gz = self.rotation.compress;
            for idx in (1..self.rotation.keep).rev() {
                let from = self.numbered(idx, gz);
                if from.exists() {
                    fs::rename(&from, self.numbered(idx + 1, gz))?;
                }
            }
            let first = self.numbered(1, false);
            fs::rename(&self.path, &first)?;
            if gz {
                if let Err(e) = gzip_in_place(&first) {
                    tracing::warn!(path = %first.display(), error = %e, "failed to compress rotated span file");
                }
            }
        }
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }
}

fn gzip_in_place(path: &Path) -> io::Result<()> {
    let data = fs::read(path)?;
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&data)?;
    let mut gz_name = path.as_os_str().to_os_string();
    gz_name.push(".gz");
    fs::write(PathBuf::from(gz_name), gz.finish()?)?;
    fs::remove_file(path)
}

/// Service identity stamped on every exported record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
}

/// Writes one JSON object per finished span.  Write failures are counted and
/// logged, never propagated into the request path.
pub struct JsonlSpanExporter {
    writer: Mutex<RotatingFile>,
    resource: Resource,
    lines_total: AtomicU64,
    write_errors_total: AtomicU64,
}

impl JsonlSpanExporter {
    pub fn new(writer: RotatingFile, resource: Resource) -> Self {
        Self {
            writer: Mutex::new(writer),
            resource,
            lines_total: AtomicU64::new(0),
            write_errors_total: AtomicU64::new(0),
        }
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }
}

impl SpanExporter for JsonlSpanExporter {
    fn export(&self, span: FinishedSpan) {
        let record = serde_json::json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "service.name": self.resource.service_name,
            "service.version": self.resource.service_version,
            "deployment.environment": self.resource.environment,
            "span": span,
        });
        let line = record.to_string();
        let result = match self.writer.lock() {
            Ok(mut writer) => writer.append_line(&line),
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "span writer poisoned")),
        };
        match result {
            Ok(()) => {
                self.lines_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to write span record");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
