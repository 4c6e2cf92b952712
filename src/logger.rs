use fmt::MakeWriter;
use lazy_static::lazy_static;
use regex::Regex;
use std::{
    collections::VecDeque,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

const MAX_LOG_LINES: usize = 20000;

lazy_static! {
    static ref MEMORY_WRITER: MemoryWriter = MemoryWriter::new();
}

struct MemoryWriterData {
    logs: VecDeque<String>,
}

#[derive(Clone)]
pub struct MemoryWriter {
    data: Arc<Mutex<MemoryWriterData>>,
}

impl MemoryWriter {
    fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(MemoryWriterData {
                logs: VecDeque::new(),
            })),
        }
    }

    fn push_line(&self, now: &std::time::SystemTime, line: &str) {
        let keywords = ["password", "token", "secret", "key", "device_id"];
        let sanitized = sanitize_keywords(line, &keywords);
        let formatted = format!("[{}] {}\n", humantime::format_rfc3339(*now), sanitized);

        let mut locked = self.data.lock().unwrap();
        if locked.logs.len() >= MAX_LOG_LINES {
            locked.logs.pop_back();
        }
        locked.logs.push_front(formatted);
    }

    pub fn recent_logs(&self) -> Vec<String> {
        let locked = self.data.lock().unwrap();
        locked.logs.iter().cloned().collect()
    }
}

pub struct MemoryWriterGuard<'a> {
    writer: &'a MemoryWriter,
    buffer: Vec<u8>,
}

impl Write for MemoryWriterGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let line = String::from_utf8_lossy(&self.buffer).to_string();
        let line = line.trim_end();
        if !line.is_empty() {
            self.writer.push_line(&std::time::SystemTime::now(), line);
        }
        self.buffer.clear();
        Ok(())
    }
}

impl Drop for MemoryWriterGuard<'_> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl<'a> MakeWriter<'a> for MemoryWriter {
    type Writer = MemoryWriterGuard<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        MemoryWriterGuard {
            writer: self,
            buffer: Vec::new(),
        }
    }
}

// Masks the value following any of the given keywords, for log lines of
// the form "keyword: value" or "keyword=value".
pub fn sanitize_keywords(line: &str, keywords: &[&str]) -> String {
    let mut sanitized = line.to_string();
    for keyword in keywords {
        let pattern = format!(r"(?i)({}[\s:=]+)\S+", regex::escape(keyword));
        if let Ok(re) = Regex::new(&pattern) {
            sanitized = re.replace_all(&sanitized, "${1}****").to_string();
        }
    }
    sanitized
}

// Installs the global tracing subscriber: env-filtered stderr output, an
// in-memory ring buffer for UI retrieval and, when a directory is given,
// a daily-rolling log file.
pub fn initialize_logger(app_name: &str, log_dir: Option<PathBuf>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,{}=debug", env!("CARGO_PKG_NAME"))));

    let memory_layer = fmt::layer()
        .with_writer(MEMORY_WRITER.clone())
        .with_ansi(false);

    let stderr_layer = fmt::layer().with_writer(io::stderr);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(memory_layer)
        .with(stderr_layer);

    if let Some(dir) = log_dir {
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, format!("{}.log", app_name));
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        // The guard must live for the process lifetime.
        std::mem::forget(guard);
        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
        let _ = registry.with(file_layer).try_init();
    } else {
        let _ = registry.try_init();
    }
}

pub fn get_memory_logs() -> Vec<String> {
    MEMORY_WRITER.recent_logs()
}
