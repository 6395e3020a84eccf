//! Directory handle shared by drivers whose backend has no directory fd

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};

use super::{FileInfo, VfsFile};
use crate::error::Result;

fn is_a_directory() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "is a directory")
}

/// Handle for an opened directory backed by a pre-fetched listing
pub struct DirectoryHandle {
    info: FileInfo,
    entries: VecDeque<FileInfo>,
}

impl DirectoryHandle {
    pub fn new(info: FileInfo, entries: Vec<FileInfo>) -> Self {
        Self {
            info,
            entries: entries.into(),
        }
    }
}

impl AsyncRead for DirectoryHandle {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(is_a_directory()))
    }
}

impl AsyncWrite for DirectoryHandle {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(is_a_directory()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for DirectoryHandle {
    fn start_seek(self: Pin<&mut Self>, _position: io::SeekFrom) -> io::Result<()> {
        Err(is_a_directory())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(0))
    }
}

#[async_trait]
impl VfsFile for DirectoryHandle {
    async fn read_dir(&mut self, count: usize) -> Result<Vec<FileInfo>> {
        let take = if count == 0 {
            self.entries.len()
        } else {
            count.min(self.entries.len())
        };
        Ok(self.entries.drain(..take).collect())
    }

    async fn stat(&mut self) -> Result<FileInfo> {
        Ok(self.info.clone())
    }

    async fn close(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tokio::io::AsyncReadExt;

    fn sample() -> DirectoryHandle {
        let now = SystemTime::now();
        DirectoryHandle::new(
            FileInfo::directory("docs", now),
            vec![
                FileInfo::file("a.txt", 1, now),
                FileInfo::file("b.txt", 2, now),
                FileInfo::directory("c", now),
            ],
        )
    }

    #[tokio::test]
    async fn test_read_dir_in_batches() {
        let mut dir = sample();
        let first = dir.read_dir(2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].name, "a.txt");

        let rest = dir.read_dir(0).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(rest[0].is_dir);

        assert!(dir.read_dir(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_bytes_fails() {
        let mut dir = sample();
        let mut buf = Vec::new();
        assert!(dir.read_to_end(&mut buf).await.is_err());
        assert!(dir.stat().await.unwrap().is_dir);
    }
}
