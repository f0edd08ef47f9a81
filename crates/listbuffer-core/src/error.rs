//! Error types for listbuffer-core

use std::fmt::Write;
use std::path::PathBuf;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render as plain text for terminal output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for listbuffer-core
#[derive(Error, Debug)]
pub enum Error {
    /// Chunk index (SQLite ledger) errors
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    /// Chunk file errors
    #[error("Chunk storage error: {0}")]
    Chunk(#[from] ChunkError),

    /// Queue broker errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Runtime errors (signal handlers, task failures)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Index(err) => Some(err.remediation()),
            Self::Chunk(err) => Some(err.remediation()),
            Self::Broker(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify data_dir and index_file point to writable locations."),
            ),
            Self::Runtime(_) => None,
        }
    }

    /// True when the error means the broker connection is gone.
    #[must_use]
    pub fn is_broker_connection_lost(&self) -> bool {
        matches!(self, Self::Broker(err) if err.is_connection_lost())
    }
}

/// Chunk index errors
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Failed to open index {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Chunk {0:016x} not found in index")]
    ChunkNotFound(i64),
}

impl IndexError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Open { path, .. } => Remediation::new(format!(
                "Cannot open the chunk index at {}. Check the index_file setting.",
                path.display()
            ))
            .command("Check path", format!("ls -l \"{}\"", path.display()))
            .alternative("Ensure the parent directory exists and is writable."),
            Self::Database(_) => Remediation::new(
                "Index operation failed. Check disk space and index file permissions.",
            )
            .command("Integrity check", "sqlite3 index.db 'PRAGMA integrity_check'"),
            Self::ChunkNotFound(_) => Remediation::new(
                "The index lost track of a chunk. The engine repairs this on the next read.",
            )
            .command("Inspect buffer", "redis-list-buffer status <config>"),
        }
    }
}

/// Chunk file errors
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Failed to create data directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O on chunk file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Item {position} of batch contains a line terminator")]
    InvalidItem { position: usize },
}

impl ChunkError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::CreateDir { path, .. } => Remediation::new(format!(
                "Cannot create data directory {}. Check the data_dir setting.",
                path.display()
            ))
            .command("Check parent", format!("ls -ld \"{}\"", path.display())),
            Self::Io { path, .. } => Remediation::new(format!(
                "Chunk file I/O failed for {}. Check free disk space and permissions.",
                path.display()
            ))
            .command("Disk usage", "df -h")
            .alternative("Items popped for a failed spill are returned to the in-queue."),
            Self::InvalidItem { .. } => Remediation::new(
                "Queue items must not contain newlines. Fix the producer that emits them.",
            ),
        }
    }
}

/// Queue broker errors
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to connect to broker at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connecting to broker at {0} timed out")]
    ConnectTimeout(String),

    #[error("Broker round trip timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Broker connection closed")]
    Disconnected,

    #[error("Broker protocol error: {0}")]
    Protocol(String),

    #[error("Broker replied with error: {0}")]
    Server(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Broker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Connection is likely dead or out of sync; reconnect before the next call.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::Connect { .. }
            | Self::ConnectTimeout(_)
            | Self::Timeout { .. }
            | Self::Disconnected
            | Self::Protocol(_)
            | Self::Io(_) => true,
            Self::Server(_) | Self::Unavailable(_) => false,
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Connect { addr, .. } | Self::ConnectTimeout(addr) => {
                Remediation::new(format!("Cannot reach Redis at {addr}. Start it or fix redis.host."))
                    .command("Ping", "redis-cli ping")
                    .alternative("Set redis.network to unix when connecting over a socket.")
            }
            Self::Timeout { .. } | Self::Disconnected | Self::Io(_) => {
                Remediation::new("Redis stopped responding. The buffer reconnects on the next tick.")
                    .command("Ping", "redis-cli ping")
            }
            Self::Protocol(_) => Remediation::new(
                "Unexpected reply from the broker. Verify redis.host points at a Redis server.",
            ),
            Self::Server(msg) if msg.starts_with("NOAUTH") || msg.starts_with("WRONGPASS") => {
                Remediation::new("Redis rejected the credentials. Check redis.pass.")
            }
            Self::Server(_) => Remediation::new("Redis rejected a command. Check the server log.")
                .alternative("Verify redis.in and redis.out refer to list keys."),
            Self::Unavailable(_) => Remediation::new("The broker is unavailable. Retry later."),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\"")),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\"")),
            Self::ParseError(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .alternative("tick, target_in, target_out, redis_chunk and data_chunk are required."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
