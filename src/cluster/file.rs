use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::cli::config::TransferConfig;
use crate::error::TransferError;

/// Receives a shared data archive in chunks and unpacks it once complete.
pub struct FileReceiver {
    config: TransferConfig,
    file: Option<File>,
    received: u64,
}

impl FileReceiver {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            file: None,
            received: 0,
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.file.is_some()
    }

    /// Start a new transfer. Any previous archive is truncated.
    pub async fn begin(&mut self) -> Result<(), TransferError> {
        if let Some(parent) = self.config.archive_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        self.file = Some(File::create(&self.config.archive_path).await?);
        self.received = 0;
        info!("Receiving data archive into {}", self.config.archive_path.display());
        Ok(())
    }

    pub async fn push(&mut self, chunk: &[u8]) -> Result<(), TransferError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        file.write_all(chunk).await?;
        self.received += chunk.len() as u64;
        debug!("Archive chunk of {} bytes ({} total)", chunk.len(), self.received);
        Ok(())
    }

    /// Close the archive and extract it. Leaves file mode whatever the outcome.
    /// Returns the number of archive entries.
    pub async fn finish(&mut self) -> Result<usize, TransferError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        let archive = self.config.archive_path.clone();
        let target = self.config.extract_dir.clone();
        let entries = tokio::task::spawn_blocking(move || extract(archive, target)).await??;
        info!(
            "Extracted {} entries ({} bytes received) into {}",
            entries,
            self.received,
            self.config.extract_dir.display()
        );
        Ok(entries)
    }
}

fn extract(archive: PathBuf, target: PathBuf) -> Result<usize, TransferError> {
    let file = std::fs::File::open(&archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    std::fs::create_dir_all(&target)?;
    zip.extract(&target)?;
    Ok(zip.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn archive_bytes(files: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            for (name, content) in files {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    fn receiver(dir: &tempfile::TempDir) -> FileReceiver {
        FileReceiver::new(TransferConfig {
            archive_path: dir.path().join("global_data.zip"),
            extract_dir: dir.path().join("out"),
        })
    }

    #[tokio::test]
    async fn test_chunks_are_assembled_and_extracted() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = receiver(&dir);
        let bytes = archive_bytes(&[("global_data/users.csv", "id,name\n1,a\n"), ("readme.txt", "hi")]);

        rx.begin().await.unwrap();
        assert!(rx.is_receiving());
        for chunk in bytes.chunks(7) {
            rx.push(chunk).await.unwrap();
        }
        assert_eq!(rx.finish().await.unwrap(), 2);
        assert!(!rx.is_receiving());

        let out = dir.path().join("out");
        assert_eq!(
            std::fs::read_to_string(out.join("global_data/users.csv")).unwrap(),
            "id,name\n1,a\n"
        );
        assert_eq!(std::fs::read_to_string(out.join("readme.txt")).unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_begin_truncates_previous_archive() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = receiver(&dir);

        rx.begin().await.unwrap();
        rx.push(b"leftover garbage").await.unwrap();

        rx.begin().await.unwrap();
        rx.push(&archive_bytes(&[("a.txt", "fresh")])).await.unwrap();
        assert_eq!(rx.finish().await.unwrap(), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/a.txt")).unwrap(),
            "fresh"
        );
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = receiver(&dir);

        rx.begin().await.unwrap();
        rx.push(b"definitely not a zip file").await.unwrap();
        let err = rx.finish().await.unwrap_err();
        assert!(matches!(err, TransferError::Archive(_)), "{err}");
        assert!(!rx.is_receiving());
    }
}
