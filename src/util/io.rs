use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use indicatif::ProgressBar;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Destination for verified pieces. Pieces arrive strictly in index order.
#[async_trait]
pub trait PieceSink: Send {
    async fn append_piece(&mut self, index: u32, bytes: &[u8]) -> io::Result<()>;

    async fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Appends pieces to a file on disk.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    /// Creates (or truncates) the output file.
    pub async fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;
        Ok(FileSink { path, writer: BufWriter::new(file) })
    }

    /// Opens the output file for appending, creating it if needed.
    pub async fn append<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(FileSink { path, writer: BufWriter::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PieceSink for FileSink {
    async fn append_piece(&mut self, _index: u32, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }
}

/// Collects pieces in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub bytes: Vec<u8>,
    pub indices: Vec<u32>,
}

#[async_trait]
impl PieceSink for MemorySink {
    async fn append_piece(&mut self, index: u32, bytes: &[u8]) -> io::Result<()> {
        self.indices.push(index);
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }
}

/// Advances a progress bar by each piece's byte count before handing it on.
pub struct ProgressSink<S> {
    inner: S,
    bar: ProgressBar,
}

impl<S: PieceSink> ProgressSink<S> {
    pub fn new(inner: S, bar: ProgressBar) -> Self {
        ProgressSink { inner, bar }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: PieceSink> PieceSink for ProgressSink<S> {
    async fn append_piece(&mut self, index: u32, bytes: &[u8]) -> io::Result<()> {
        self.inner.append_piece(index, bytes).await?;
        self.bar.inc(bytes.len() as u64);
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.inner.finish().await?;
        self.bar.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_sink_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut sink = FileSink::create(&path).await.unwrap();
        sink.append_piece(0, b"hello ").await.unwrap();
        sink.append_piece(1, b"world").await.unwrap();
        sink.finish().await.unwrap();

        let mut sink = FileSink::append(&path).await.unwrap();
        sink.append_piece(2, b"!").await.unwrap();
        sink.finish().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world!");
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let mut sink = MemorySink::default();
        sink.append_piece(0, &[1, 2]).await.unwrap();
        sink.append_piece(1, &[3]).await.unwrap();
        assert_eq!(sink.bytes, vec![1, 2, 3]);
        assert_eq!(sink.indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_progress_sink_counts_bytes() {
        let bar = ProgressBar::hidden();
        bar.set_length(5);
        let mut sink = ProgressSink::new(MemorySink::default(), bar.clone());
        sink.append_piece(0, &[0; 3]).await.unwrap();
        assert_eq!(bar.position(), 3);
        sink.append_piece(1, &[0; 2]).await.unwrap();
        sink.finish().await.unwrap();
        assert!(bar.is_finished());
        assert_eq!(sink.into_inner().bytes.len(), 5);
    }
}
