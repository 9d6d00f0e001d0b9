// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command and acknowledgment vocabulary
//!
//! Client → router commands use the lower-case keywords (`uploadf`, `downlf`,
//! ...), router → storage node requests the upper-case ones (`STORE`,
//! `DOWNLOAD`, ...). Every reply is one acknowledgment token line.

use std::fmt;
use thiserror::Error;

/// Operation an acknowledgment refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Upload,
    Download,
    Remove,
    List,
    Tar,
    Store,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Upload => "UPLOAD",
            Operation::Download => "DOWNLOAD",
            Operation::Remove => "REMOVE",
            Operation::List => "LIST",
            Operation::Tar => "TAR",
            Operation::Store => "STORE",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "UPLOAD" => Operation::Upload,
            "DOWNLOAD" => Operation::Download,
            "REMOVE" => Operation::Remove,
            "LIST" => Operation::List,
            "TAR" => Operation::Tar,
            "STORE" => Operation::Store,
            _ => return None,
        })
    }
}

/// Failure reason carried by `<OP>_FAILED:<REASON>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reason {
    InvalidFormat,
    InvalidFileType,
    NoExtension,
    InvalidPath,
    FileNotFound,
    FileOpenError,
    /// Temporary staging space could not be created
    TempFile,
    IoError,
    PayloadTooLarge,
    BackendUnavailable,
    ArchiveFailed,
    Timeout,
    /// Bare `<OP>_FAILED` with no reason attached
    Unspecified,
    /// Reason text from a peer that this build does not know
    Other(String),
}

impl Reason {
    pub fn as_str(&self) -> &str {
        match self {
            Reason::InvalidFormat => "INVALID_FORMAT",
            Reason::InvalidFileType => "INVALID_FILE_TYPE",
            Reason::NoExtension => "NO_EXTENSION",
            Reason::InvalidPath => "INVALID_PATH",
            Reason::FileNotFound => "FILE_NOT_FOUND",
            Reason::FileOpenError => "FILE_OPEN_ERROR",
            Reason::TempFile => "TEMP_FILE",
            Reason::IoError => "IO_ERROR",
            Reason::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Reason::BackendUnavailable => "BACKEND_UNAVAILABLE",
            Reason::ArchiveFailed => "ARCHIVE_FAILED",
            Reason::Timeout => "TIMEOUT",
            Reason::Unspecified => "",
            Reason::Other(s) => s,
        }
    }

    fn from_token(token: &str) -> Self {
        match token {
            "INVALID_FORMAT" => Reason::InvalidFormat,
            "INVALID_FILE_TYPE" => Reason::InvalidFileType,
            "NO_EXTENSION" => Reason::NoExtension,
            "INVALID_PATH" => Reason::InvalidPath,
            "FILE_NOT_FOUND" => Reason::FileNotFound,
            "FILE_OPEN_ERROR" => Reason::FileOpenError,
            "TEMP_FILE" => Reason::TempFile,
            "IO_ERROR" => Reason::IoError,
            "PAYLOAD_TOO_LARGE" => Reason::PayloadTooLarge,
            "BACKEND_UNAVAILABLE" => Reason::BackendUnavailable,
            "ARCHIVE_FAILED" => Reason::ArchiveFailed,
            "TIMEOUT" => Reason::Timeout,
            "" => Reason::Unspecified,
            other => Reason::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acknowledgment token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Success(Operation),
    /// `TAR_SUCCESS:<archive name>`, followed by the archive payload
    Archive(String),
    Failed(Operation, Reason),
    Goodbye,
    InvalidCommand,
}

impl Ack {
    pub fn failed(op: Operation, reason: Reason) -> Self {
        Ack::Failed(op, reason)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Ack::Success(_) | Ack::Archive(_) | Ack::Goodbye)
    }

    /// Re-label the acknowledgment for the next hop, e.g. a storage node's
    /// `STORE_SUCCESS` becomes the client's `UPLOAD_SUCCESS`.
    pub fn relabel(self, op: Operation) -> Self {
        match self {
            Ack::Success(_) => Ack::Success(op),
            Ack::Failed(_, reason) => Ack::Failed(op, reason),
            Ack::InvalidCommand => Ack::Failed(op, Reason::InvalidFormat),
            other => other,
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        match line {
            "GOODBYE" => return Some(Ack::Goodbye),
            "INVALID_COMMAND" => return Some(Ack::InvalidCommand),
            _ => {}
        }
        if let Some(name) = line.strip_prefix("TAR_SUCCESS:") {
            return Some(Ack::Archive(name.to_string()));
        }
        if let Some(op) = line.strip_suffix("_SUCCESS") {
            return Operation::from_token(op).map(Ack::Success);
        }
        let (head, reason) = match line.split_once(':') {
            Some((head, reason)) => (head, reason),
            None => (line, ""),
        };
        let op = head.strip_suffix("_FAILED")?;
        Operation::from_token(op).map(|op| Ack::Failed(op, Reason::from_token(reason)))
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ack::Success(op) => write!(f, "{}_SUCCESS", op.as_str()),
            Ack::Archive(name) => write!(f, "TAR_SUCCESS:{}", name),
            Ack::Failed(op, Reason::Unspecified) => write!(f, "{}_FAILED", op.as_str()),
            Ack::Failed(op, reason) => write!(f, "{}_FAILED:{}", op.as_str(), reason),
            Ack::Goodbye => f.write_str("GOODBYE"),
            Ack::InvalidCommand => f.write_str("INVALID_COMMAND"),
        }
    }
}

/// Client command received by the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `uploadf <name> <dest>`, payload follows
    Store { name: String, dest: String },
    /// `downlf <path>`
    Retrieve { path: String },
    /// `removef <path>`
    Remove { path: String },
    /// `dispfnames [path]`
    List { path: String },
    /// `downltar <ext>`
    ArchiveExport { extension: String },
    /// `exit`
    Terminate,
}

/// Why a command line could not be turned into a [`Command`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("malformed {} command", .0.as_str())]
    Malformed(Operation),
}

impl CommandError {
    pub fn ack(&self) -> Ack {
        match self {
            CommandError::Unknown(_) => Ack::InvalidCommand,
            CommandError::Malformed(op) => Ack::Failed(*op, Reason::InvalidFormat),
        }
    }
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut words = line.split_whitespace();
        let keyword = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();

        match (keyword, args.as_slice()) {
            ("uploadf", [name, dest]) => Ok(Command::Store {
                name: name.to_string(),
                dest: dest.to_string(),
            }),
            ("uploadf", _) => Err(CommandError::Malformed(Operation::Upload)),
            ("downlf", [path]) => Ok(Command::Retrieve { path: path.to_string() }),
            ("downlf", _) => Err(CommandError::Malformed(Operation::Download)),
            ("removef", [path]) => Ok(Command::Remove { path: path.to_string() }),
            ("removef", _) => Err(CommandError::Malformed(Operation::Remove)),
            ("dispfnames", []) => Ok(Command::List { path: ".".to_string() }),
            ("dispfnames", [path]) => Ok(Command::List { path: path.to_string() }),
            ("dispfnames", _) => Err(CommandError::Malformed(Operation::List)),
            ("downltar", [ext]) => Ok(Command::ArchiveExport { extension: ext.to_string() }),
            ("downltar", _) => Err(CommandError::Malformed(Operation::Tar)),
            ("exit", []) => Ok(Command::Terminate),
            _ => Err(CommandError::Unknown(line.trim().to_string())),
        }
    }

    /// Whether a payload follows the command line on the wire.
    pub fn has_payload(line: &str) -> bool {
        line.split_whitespace().next() == Some("uploadf")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Store { name, dest } => write!(f, "uploadf {} {}", name, dest),
            Command::Retrieve { path } => write!(f, "downlf {}", path),
            Command::Remove { path } => write!(f, "removef {}", path),
            Command::List { path } => write!(f, "dispfnames {}", path),
            Command::ArchiveExport { extension } => write!(f, "downltar {}", extension),
            Command::Terminate => f.write_str("exit"),
        }
    }
}

/// Request sent by the router to a storage node (one per connection)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRequest {
    /// `STORE <name> <dest>`, payload follows
    Store { name: String, dest: String },
    /// `DOWNLOAD <path>`
    Download { path: String },
    /// `REMOVE <path>`
    Remove { path: String },
    /// `LIST <path>`
    List { path: String },
    /// `TAR:<archive name>`
    Archive { name: String },
}

impl NodeRequest {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("TAR:") {
            return match name.trim() {
                "" => Err(CommandError::Malformed(Operation::Tar)),
                name => Ok(NodeRequest::Archive { name: name.to_string() }),
            };
        }

        let mut words = line.split_whitespace();
        let keyword = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();

        match (keyword, args.as_slice()) {
            ("STORE", [name, dest]) => Ok(NodeRequest::Store {
                name: name.to_string(),
                dest: dest.to_string(),
            }),
            ("STORE", _) => Err(CommandError::Malformed(Operation::Store)),
            ("DOWNLOAD", [path]) => Ok(NodeRequest::Download { path: path.to_string() }),
            ("DOWNLOAD", _) => Err(CommandError::Malformed(Operation::Download)),
            ("REMOVE", [path]) => Ok(NodeRequest::Remove { path: path.to_string() }),
            ("REMOVE", _) => Err(CommandError::Malformed(Operation::Remove)),
            ("LIST", [path]) => Ok(NodeRequest::List { path: path.to_string() }),
            ("LIST", _) => Err(CommandError::Malformed(Operation::List)),
            _ => Err(CommandError::Unknown(line.to_string())),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            NodeRequest::Store { .. } => Operation::Store,
            NodeRequest::Download { .. } => Operation::Download,
            NodeRequest::Remove { .. } => Operation::Remove,
            NodeRequest::List { .. } => Operation::List,
            NodeRequest::Archive { .. } => Operation::Tar,
        }
    }
}

impl fmt::Display for NodeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRequest::Store { name, dest } => write!(f, "STORE {} {}", name, dest),
            NodeRequest::Download { path } => write!(f, "DOWNLOAD {}", path),
            NodeRequest::Remove { path } => write!(f, "REMOVE {}", path),
            NodeRequest::List { path } => write!(f, "LIST {}", path),
            NodeRequest::Archive { name } => write!(f, "TAR:{}", name),
        }
    }
}
