use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::{DEFAULT_READER_PATH, DispatchError, READER_SEARCH_NAME, SILENT_PRINT_FLAG};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Override,
    Default,
    SearchPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExecutable {
    pub path: PathBuf,
    pub source: ResolutionSource,
}

/// Finds the print-capable executable.
///
/// Lookup order: operator override, fixed default install path, then the
/// search path. The search path defaults to `PATH` at resolve time.
#[derive(Debug, Clone)]
pub struct ExecutableLocator {
    override_path: Option<PathBuf>,
    default_path: PathBuf,
    search_name: String,
    search_path: Option<OsString>,
}

impl ExecutableLocator {
    #[must_use]
    pub fn new(override_path: Option<PathBuf>) -> Self {
        Self {
            override_path: override_path.filter(|path| !path.as_os_str().is_empty()),
            default_path: PathBuf::from(DEFAULT_READER_PATH),
            search_name: READER_SEARCH_NAME.to_owned(),
            search_path: None,
        }
    }

    #[must_use]
    pub fn with_default_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_path = path.into();
        self
    }

    #[must_use]
    pub fn with_search_name(mut self, name: impl Into<String>) -> Self {
        self.search_name = name.into();
        self
    }

    #[must_use]
    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    pub fn resolve(&self) -> Result<ResolvedExecutable, DispatchError> {
        let mut attempts = Vec::with_capacity(3);

        if let Some(path) = self.override_path.as_deref() {
            if path.is_file() {
                info!("using print executable from override: {}", path.display());
                return Ok(ResolvedExecutable {
                    path: path.to_path_buf(),
                    source: ResolutionSource::Override,
                });
            }
            debug!("override print executable missing: {}", path.display());
            attempts.push(path.display().to_string());
        }

        if self.default_path.is_file() {
            info!(
                "using default print executable: {}",
                self.default_path.display()
            );
            return Ok(ResolvedExecutable {
                path: self.default_path.clone(),
                source: ResolutionSource::Default,
            });
        }
        attempts.push(self.default_path.display().to_string());

        let search_path = self
            .search_path
            .clone()
            .or_else(|| std::env::var_os("PATH"));
        if let Some(found) = search_path
            .as_deref()
            .and_then(|paths| find_in_search_path(paths, &self.search_name))
        {
            info!("using print executable from search path: {}", found.display());
            return Ok(ResolvedExecutable {
                path: found,
                source: ResolutionSource::SearchPath,
            });
        }
        attempts.push(format!("PATH:{}", self.search_name));

        Err(DispatchError::ExecutableNotFound { attempts })
    }
}

fn find_in_search_path(paths: &OsStr, name: &str) -> Option<PathBuf> {
    std::env::split_paths(paths)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// A fully built print command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintInvocation {
    program: PathBuf,
    document: PathBuf,
    device_name: String,
}

impl PrintInvocation {
    pub fn new(
        program: impl Into<PathBuf>,
        document: impl Into<PathBuf>,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            document: document.into(),
            device_name: device_name.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn document(&self) -> &Path {
        &self.document
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Arguments after the program, each path or name individually quoted.
    pub fn args(&self) -> Vec<String> {
        vec![
            SILENT_PRINT_FLAG.to_owned(),
            quote_arg(&self.document.to_string_lossy()),
            quote_arg(&self.device_name),
        ]
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(quote_arg(&self.program.to_string_lossy()))
            .chain(self.args())
            .collect()
    }

    pub fn command_line(&self) -> String {
        self.argv().join(" ")
    }
}

/// Wraps a value in double quotes so embedded spaces survive command-line splitting.
pub fn quote_arg(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\\\""))
}
