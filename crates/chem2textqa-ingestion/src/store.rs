//! Line-delimited JSON storage for scraped documents.
//!
//! One `ScientificDocument` per line. Writes only ever append, so a file
//! written by an interrupted run still holds every batch that finished.

use std::path::Path;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use chem2textqa_common::{CorruptRecord, Result, ScrapeError};

use crate::models::ScientificDocument;

/// What `read_documents` does with a line that does not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnCorrupt {
    /// Collect the error and keep reading.
    Skip,
    /// Return the first error.
    Abort,
}

#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub documents: Vec<ScientificDocument>,
    pub corrupt: Vec<CorruptRecord>,
}

/// Append `docs` to `path`, creating the file and its parent directories.
/// The batch goes out in a single write. Returns the number of documents
/// written; an empty batch touches nothing.
pub async fn append_documents(path: &Path, docs: &[ScientificDocument]) -> Result<usize> {
    if docs.is_empty() {
        return Ok(0);
    }

    let mut buf = Vec::with_capacity(docs.len() * 512);
    for doc in docs {
        serde_json::to_writer(&mut buf, doc)?;
        buf.push(b'\n');
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(&buf).await?;
    file.flush().await?;

    debug!(path = %path.display(), n = docs.len(), "Appended documents");
    Ok(docs.len())
}

/// Number of non-blank lines in `path`, without parsing them. A missing
/// file holds zero documents.
pub async fn count_documents(path: &Path) -> Result<usize> {
    let file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut lines = BufReader::new(file).split(b'\n');
    let mut n = 0;
    while let Some(line) = lines.next_segment().await? {
        if !is_blank(&line) {
            n += 1;
        }
    }
    Ok(n)
}

/// Parse every non-blank line of `path`. Line numbers in `CorruptRecord`
/// are 1-based and count blank lines.
pub async fn read_documents(path: &Path, policy: OnCorrupt) -> Result<ReadOutcome> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).split(b'\n');
    let mut outcome = ReadOutcome::default();
    let mut line_no = 0;

    // Raw bytes: a line that is not UTF-8 is a corrupt record, not an I/O error.
    while let Some(line) = lines.next_segment().await? {
        line_no += 1;
        if is_blank(&line) {
            continue;
        }
        match serde_json::from_slice::<ScientificDocument>(&line) {
            Ok(doc) => outcome.documents.push(doc),
            Err(e) => {
                let corrupt = CorruptRecord { line: line_no, reason: e.to_string() };
                if policy == OnCorrupt::Abort {
                    return Err(ScrapeError::CorruptRecord(corrupt));
                }
                warn!(path = %path.display(), line = line_no, "Skipping corrupt record");
                outcome.corrupt.push(corrupt);
            }
        }
    }
    Ok(outcome)
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}
