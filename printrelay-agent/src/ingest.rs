use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::extract::Multipart;
use bytes::Bytes;
use printrelay_core::{DOCUMENT_FIELD, PRINTER_FIELD, StagedDocument};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, info, warn};

const MAX_FILE_NAME_CHARS: usize = 200;
const FALLBACK_FILE_NAME: &str = "document.pdf";

/// One upload, held in memory until it is staged.
#[derive(Debug, Clone)]
pub struct PrintRequest {
    pub device_name: String,
    pub document: Bytes,
    pub original_file_name: String,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to parse multipart form: {0}")]
    ParseFailure(String),
    #[error("form data is missing the '{0}' parameter")]
    MissingField(&'static str),
    #[error("form data is missing the '{0}' file")]
    MissingFile(&'static str),
    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl IngestError {
    pub fn is_client_error(&self) -> bool {
        !matches!(self, IngestError::Io { .. })
    }

    fn io(context: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| IngestError::Io {
            context,
            path,
            source,
        }
    }
}

/// Reads the whole form. Nothing touches the disk until both fields are present.
pub async fn read_print_request(mut multipart: Multipart) -> Result<PrintRequest, IngestError> {
    let mut printer: Option<String> = None;
    let mut document: Option<(String, Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| IngestError::ParseFailure(err.body_text()))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some(PRINTER_FIELD) => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| IngestError::ParseFailure(err.body_text()))?;
                printer = Some(value);
            }
            Some(DOCUMENT_FIELD) => {
                // A part without a file name is a plain value, not an upload.
                let Some(file_name) = field
                    .file_name()
                    .map(str::to_owned)
                    .filter(|name| !name.trim().is_empty())
                else {
                    continue;
                };
                let data = field
                    .bytes()
                    .await
                    .map_err(|err| IngestError::ParseFailure(err.body_text()))?;
                document = Some((file_name, data));
            }
            _ => {
                debug!("ignoring unexpected form field {:?}", name);
            }
        }
    }

    let device_name = printer
        .filter(|value| !value.trim().is_empty())
        .ok_or(IngestError::MissingField(PRINTER_FIELD))?;
    let (original_file_name, document) =
        document.ok_or(IngestError::MissingFile(DOCUMENT_FIELD))?;

    Ok(PrintRequest {
        device_name,
        document,
        original_file_name,
    })
}

/// Tracks which job last staged each path, so a deferred delete never removes
/// a newer upload that reused the same file name.
#[derive(Debug, Default, Clone)]
pub struct StagingLedger {
    generations: Arc<Mutex<HashMap<PathBuf, u64>>>,
}

impl StagingLedger {
    async fn claim(&self, path: &Path) -> u64 {
        let mut generations = self.generations.lock().await;
        let generation = generations.entry(path.to_path_buf()).or_insert(0);
        *generation += 1;
        *generation
    }
}

/// Writes the document byte-for-byte and closes it before returning.
pub async fn stage_document(
    staging_dir: &Path,
    request: &PrintRequest,
    ledger: &StagingLedger,
) -> Result<StagedDocument, IngestError> {
    tokio::fs::create_dir_all(staging_dir)
        .await
        .map_err(IngestError::io("failed to create staging directory", staging_dir))?;

    let path = staging_dir.join(sanitize_file_name(&request.original_file_name));
    // Claimed before the file is created: a pending delete for an older job
    // either finishes first or sees the newer generation and backs off.
    let generation = ledger.claim(&path).await;
    info!("saving uploaded document to {}", path.display());

    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(IngestError::io("failed to create staged file", &path))?;
    file.write_all(&request.document)
        .await
        .map_err(IngestError::io("failed to write staged file", &path))?;
    file.flush()
        .await
        .map_err(IngestError::io("failed to flush staged file", &path))?;
    file.sync_all()
        .await
        .map_err(IngestError::io("failed to sync staged file", &path))?;
    drop(file);

    Ok(StagedDocument {
        path,
        size_bytes: request.document.len() as u64,
        generation,
    })
}

/// Deletes a dispatched document, immediately or after `retention`.
///
/// The file is left alone if the same path has been staged again since.
pub async fn discard_staged(staged: StagedDocument, retention: Duration, ledger: &StagingLedger) {
    if retention.is_zero() {
        remove_staged(&staged, ledger).await;
        return;
    }
    let ledger = ledger.clone();
    tokio::spawn(async move {
        tokio::time::sleep(retention).await;
        remove_staged(&staged, &ledger).await;
    });
}

async fn remove_staged(staged: &StagedDocument, ledger: &StagingLedger) {
    let path = &staged.path;
    // Held across the delete so a new claim for this path waits for it.
    let mut generations = ledger.generations.lock().await;
    if generations.get(path) != Some(&staged.generation) {
        debug!("{} was staged again, keeping it", path.display());
        return;
    }
    generations.remove(path);

    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("removed staged document {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove staged document {}: {}", path.display(), err),
    }
}

/// Keeps only the final path component and replaces characters that are
/// reserved in file names.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let cleaned: String = base
        .chars()
        .map(|ch| match ch {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .take(MAX_FILE_NAME_CHARS)
        .collect();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return FALLBACK_FILE_NAME.to_owned();
    }
    cleaned
}
