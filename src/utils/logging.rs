//! # Logging
//!
//! Subscriber setup for the `tracing` macros used throughout the crate.
//!
//! Console and file output are independent layers over one registry; either
//! can use JSON. The file writer can be reopened in place (after log rotation)
//! with [`reopen_log_file`], which the dispatcher calls on SIGUSR1.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{Result, TunnelError};

static LOG_FILE: OnceCell<SharedLogFile> = OnceCell::new();

/// Append-mode log file that can be swapped for a fresh handle
#[derive(Clone)]
pub struct SharedLogFile {
    file: Arc<Mutex<File>>,
    path: Arc<str>,
}

impl SharedLogFile {
    pub fn open(path: &str) -> io::Result<Self> {
        Ok(Self {
            file: Arc::new(Mutex::new(open_append(path)?)),
            path: Arc::from(path),
        })
    }

    /// Reopen the path and direct subsequent writes to the new handle
    pub fn reopen(&self) -> io::Result<()> {
        let fresh = open_append(&self.path)?;
        *self.file.lock().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

fn open_append(path: &str) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl io::Write for SharedLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

impl<'a> MakeWriter<'a> for SharedLogFile {
    type Writer = SharedLogFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG`, when set, overrides the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.log_to_console {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(true);
        layers.push(if config.json_format {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
    }

    if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            TunnelError::ConfigError("log_to_file is set without log_file_path".into())
        })?;
        let file = SharedLogFile::open(path)
            .map_err(|e| TunnelError::ConfigError(format!("Failed to open log file {path}: {e}")))?;
        let writer = LOG_FILE.get_or_init(|| file).clone();
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);
        layers.push(if config.json_format {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()));

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| TunnelError::ConfigError(format!("Logging already initialised: {e}")))?;

    info!(
        app = %config.app_name,
        level = %config.log_level,
        file = config.log_file_path.as_deref().unwrap_or("-"),
        "Logging initialised"
    );
    Ok(())
}

/// Reopen the log file after rotation; false when logging to file is off
pub fn reopen_log_file() -> Result<bool> {
    let Some(file) = LOG_FILE.get() else {
        return Ok(false);
    };
    file.reopen()
        .map_err(|e| TunnelError::socket("open", e))?;
    info!(path = file.path(), "Log file reopened");
    Ok(true)
}

/// Hex and ASCII rendering of at most `max` bytes, 16 per line
pub fn hex_dump(bytes: &[u8], max: usize) -> String {
    let shown = &bytes[..bytes.len().min(max)];
    let mut out = String::with_capacity(shown.len() * 4 + 16);
    for (line, chunk) in shown.chunks(16).enumerate() {
        let _ = write!(out, "{:04x}: ", line * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
        }
        out.push(' ');
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    if bytes.len() > shown.len() {
        let _ = writeln!(out, "... {} more bytes", bytes.len() - shown.len());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hex_dump_layout() {
        let dump = hex_dump(b"<?xml version", 64);
        assert!(dump.starts_with("0000: 3c 3f 78 6d 6c 20"));
        assert!(dump.trim_end().ends_with("<?xml version"));
    }

    #[test]
    fn test_hex_dump_truncates() {
        let dump = hex_dump(&[0u8; 40], 16);
        assert_eq!(dump.lines().count(), 2);
        assert!(dump.contains("24 more bytes"));
    }

    #[test]
    fn test_shared_log_file_reopen() {
        let dir = std::env::temp_dir().join(format!("usc-tunnel-log-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("tunnel.log");
        let path_str = path.to_string_lossy().to_string();

        let mut file = SharedLogFile::open(&path_str).expect("open");
        file.write_all(b"first\n").expect("write");
        std::fs::rename(&path, dir.join("tunnel.log.1")).expect("rotate");
        file.reopen().expect("reopen");
        file.write_all(b"second\n").expect("write");

        assert_eq!(std::fs::read_to_string(&path).expect("read"), "second\n");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
