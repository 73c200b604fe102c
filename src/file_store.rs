use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::io;
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// The read side of one transfer's file.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceFile: Send + 'static {
    /// Reads up to `max_len` bytes starting at `offset`. A result shorter
    /// than `max_len` (including empty) means the end of the file.
    async fn read_block(&mut self, offset: u64, max_len: usize) -> io::Result<Vec<u8>>;
}

/// The write side of one transfer's file.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SinkFile: Send + 'static {
    /// appends one block and flushes it before returning
    async fn write_block(&mut self, data: &[u8]) -> io::Result<()>;
}

/// The filesystem capability handed to transfer sessions. This is the only
/// way the protocol code touches byte-level storage, introduced to facilitate
/// mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FileStore: Send + Sync + 'static {
    async fn open_source(&self, path: &Path) -> io::Result<Box<dyn SourceFile>>;

    /// opens for writing, creating the file or truncating previous content
    async fn open_sink(&self, path: &Path) -> io::Result<Box<dyn SinkFile>>;
}

/// `FileStore` over the local filesystem.
pub struct LocalFileStore;

struct LocalSourceFile {
    file: File,
}

#[async_trait]
impl SourceFile for LocalSourceFile {
    async fn read_block(&mut self, offset: u64, max_len: usize) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset)).await?;

        let mut data = vec![0u8; max_len];
        let mut filled = 0;
        while filled < max_len {
            let num_read = self.file.read(&mut data[filled..]).await?;
            if num_read == 0 {
                break;
            }
            filled += num_read;
        }
        data.truncate(filled);
        Ok(data)
    }
}

struct LocalSinkFile {
    file: File,
}

#[async_trait]
impl SinkFile for LocalSinkFile {
    async fn write_block(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        self.file.flush().await
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn open_source(&self, path: &Path) -> io::Result<Box<dyn SourceFile>> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "not a regular file"));
        }
        let file = File::open(path).await?;
        Ok(Box::new(LocalSourceFile { file }))
    }

    async fn open_sink(&self, path: &Path) -> io::Result<Box<dyn SinkFile>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(Box::new(LocalSinkFile { file }))
    }
}
