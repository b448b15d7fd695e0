//! Log-output selection.
//!
//! The agent logs through `tracing`; this module wires the subscriber to
//! the sinks chosen on the command line. Sink selection is process-wide
//! state fixed at startup: each `-o` flag enables one of stdout, syslog,
//! or a log file, and with no flag at all stdout alone is enabled.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tracing_subscriber::fmt;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// One `-o` flag value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSink {
    /// Log to standard output.
    Stdout,
    /// Log to the system log.
    Syslog,
    /// Log to the given file, truncating it on startup.
    File(PathBuf),
}

impl FromStr for OutputSink {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "syslog" => Ok(Self::Syslog),
            _ => match s.strip_prefix("file:") {
                Some(path) if !path.is_empty() => Ok(Self::File(PathBuf::from(path))),
                _ => Err(format!(
                    "unrecognized output sink: {s} (expected stdout, syslog, or file:<path>)"
                )),
            },
        }
    }
}

/// Process-wide output selection, initialized once and never changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OutputConfig {
    /// Log to standard output.
    pub stdout: bool,
    /// Log to the system log.
    pub syslog: bool,
    /// Log to this file.
    pub file: Option<PathBuf>,
}

impl OutputConfig {
    /// Collapse repeated `-o` flags into one configuration.
    pub fn from_sinks(sinks: &[OutputSink]) -> Self {
        if sinks.is_empty() {
            return Self {
                stdout: true,
                ..Self::default()
            };
        }
        let mut config = Self::default();
        for sink in sinks {
            match sink {
                OutputSink::Stdout => config.stdout = true,
                OutputSink::Syslog => config.syslog = true,
                OutputSink::File(path) => config.file = Some(path.clone()),
            }
        }
        config
    }
}

/// Install the global tracing subscriber for the selected sinks.
///
/// The filter defaults to `tether_agent=info` and honors `RUST_LOG`.
pub fn init(config: &OutputConfig) -> io::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tether_agent=info"));

    let stdout_layer = config.stdout.then(|| fmt::layer().with_target(false));

    let file_layer = match &config.file {
        Some(path) => {
            let file = File::create(path)?;
            Some(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    let syslog_layer = config.syslog.then(|| {
        open_syslog();
        fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .without_time()
            .with_writer(SyslogMakeWriter)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .with(syslog_layer)
        .init();

    Ok(())
}

fn open_syslog() {
    // openlog(3) retains the ident pointer for the life of the process.
    static IDENT: &[u8] = b"tether-agent\0";
    // SAFETY: IDENT is static and NUL-terminated.
    unsafe {
        libc::openlog(
            IDENT.as_ptr() as *const libc::c_char,
            libc::LOG_PID,
            libc::LOG_DAEMON,
        )
    };
}

/// Forwards each formatted record to syslog(3).
struct SyslogWriter;

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let msg = buf.strip_suffix(b"\n").unwrap_or(buf);
        // An embedded NUL would truncate the record inside syslog.
        let sanitized: Vec<u8> = msg
            .iter()
            .map(|&b| if b == 0 { b'.' } else { b })
            .collect();
        if let Ok(msg) = CString::new(sanitized) {
            // SAFETY: both strings are valid and NUL-terminated.
            unsafe {
                libc::syslog(
                    libc::LOG_INFO,
                    b"%s\0".as_ptr() as *const libc::c_char,
                    msg.as_ptr(),
                )
            };
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct SyslogMakeWriter;

impl<'a> MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogWriter
    }
}
