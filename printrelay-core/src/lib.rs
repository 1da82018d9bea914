use std::{
    io,
    path::PathBuf,
    time::SystemTime,
};

use thiserror::Error;

pub mod executable;
pub mod service;
pub mod supersede;

pub use executable::{ExecutableLocator, PrintInvocation, ResolutionSource, ResolvedExecutable};
pub use service::{ControlOutcome, ServiceControl, ServiceState, ServiceStateMachine};
pub use supersede::{
    InstanceRecord, ProcessTable, SupersessionReport, SystemProcessTable,
    supersede_older_instances,
};

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
pub const PRINTER_FIELD: &str = "printer";
pub const DOCUMENT_FIELD: &str = "document";
pub const PRINT_ROUTE: &str = "/print-pdf";
pub const LIVENESS_BANNER: &str = "PrintRelay agent is running";

/// Environment variable holding the operator override for the reader executable.
pub const READER_PATH_ENV: &str = "ADOBE_READER_PATH";
pub const DEFAULT_READER_PATH: &str =
    r"C:\Program Files (x86)\Adobe\Acrobat Reader DC\Reader\AcroRd32.exe";
pub const READER_SEARCH_NAME: &str = "Acrobat.exe";
/// Print to the named device without showing a dialog.
pub const SILENT_PRINT_FLAG: &str = "/t";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedDocument {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Bumped every time the same path is staged again.
    pub generation: u64,
}

impl StagedDocument {
    /// Name of the staged file as it appears in the staging directory.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedProcess {
    pub pid: Option<u32>,
    pub command_line: String,
    pub started_at: SystemTime,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("print executable not found (tried: {})", attempts.join(", "))]
    ExecutableNotFound { attempts: Vec<String> },
    #[error("failed to start {program}: {source}")]
    LaunchFailed {
        program: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid service transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ServiceState,
        to: ServiceState,
    },
}

#[derive(Debug, Error)]
pub enum SupersedeError {
    #[error("failed to resolve current executable: {0}")]
    CurrentExecutable(#[source] io::Error),
    #[error("process enumeration failed: {0}")]
    Enumeration(String),
    #[error("failed to terminate process {pid}: {reason}")]
    Terminate { pid: u32, reason: String },
}
