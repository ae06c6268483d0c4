//! Outbound file handles and reconstructed inbound files.

use super::frame::FileMetadata;
use crate::utils::atomic_write::atomic_write;
use crate::utils::sanitize::sanitize_file_name;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A file queued for sending: its declared attributes plus a byte source.
pub struct OutgoingFile {
    pub metadata: FileMetadata,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl OutgoingFile {
    pub fn new(metadata: FileMetadata, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            metadata,
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(name: impl Into<String>, mime: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let metadata = FileMetadata {
            name: name.into(),
            size: data.len() as u64,
            mime: mime.into(),
            last_modified: now_millis(),
        };
        Self::new(metadata, Cursor::new(data))
    }

    /// Open a file on disk, taking name, size and mtime from the filesystem.
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let meta = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or_else(now_millis);

        Ok(Self::new(
            FileMetadata {
                mime: guess_mime(&name).to_string(),
                name,
                size: meta.len(),
                last_modified,
            },
            file,
        ))
    }

    /// Fill `buf` from the source. Short only at end of file; `Ok(0)` is EOF.
    pub async fn read_slice(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

/// A fully reconstructed inbound file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
}

impl ReceivedFile {
    /// Persist under `dir` with a sanitised name, never replacing an existing
    /// file. Returns the final path.
    pub fn save_into(&self, dir: &Path) -> Result<PathBuf> {
        let path = unique_path(dir, &sanitize_file_name(&self.metadata.name));
        atomic_write(&path, &self.data)
            .with_context(|| format!("failed to save {}", path.display()))?;
        Ok(path)
    }
}

fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, format!(".{e}")),
        _ => (name, String::new()),
    };
    (1..)
        .map(|i| dir.join(format!("{stem} ({i}){ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn guess_mime(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("log") => "text/plain",
        Some("md") => "text/markdown",
        Some("html") | Some("htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        _ => "",
    }
}
