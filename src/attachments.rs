use crate::models::Attachment;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::Path;

impl Attachment {
    /// Reads a file into an inline attachment, guessing its MIME type from
    /// the extension.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read attachment {}", path.display()))?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mime_type = mime_guess::from_path(path).first_or_octet_stream().to_string();
        log::debug!("Attaching {} ({}, {} bytes)", name, mime_type, bytes.len());

        Ok(Self {
            name,
            mime_type,
            size: bytes.len() as u64,
            data: STANDARD.encode(&bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_encodes_and_types_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let attachment = Attachment::from_file(&path).await.unwrap();
        assert_eq!(attachment.name, "notes.txt");
        assert_eq!(attachment.mime_type, "text/plain");
        assert_eq!(attachment.size, 5);
        assert_eq!(attachment.data, "aGVsbG8=");
    }

    #[tokio::test]
    async fn unknown_extension_is_octet_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.zzzunknown");
        tokio::fs::write(&path, [0u8, 1, 2]).await.unwrap();

        let attachment = Attachment::from_file(&path).await.unwrap();
        assert_eq!(attachment.mime_type, "application/octet-stream");
        assert_eq!(attachment.data, "AAEC");
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Attachment::from_file(dir.path().join("nope.png")).await.is_err());
    }
}
