//! Local filesystem driver
//!
//! Serves a directory on local disk. Every virtual path is joined onto the
//! configured root, lexically normalized and then required to stay inside
//! the root; anything else is rejected with `AccessDenied` before any
//! syscall is made.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{
    base_name, DirectoryHandle, FileInfo, OpenFlags, ReadStream, StorageDriver, VfsFile,
    DEFAULT_DIR_MODE,
};
use crate::context::RequestContext;
use crate::error::{FileHubError, Result};
use crate::model::DriverConfig;

/// Driver for a directory on the local filesystem
#[derive(Debug, Default)]
pub struct LocalDriver {
    /// Canonical root, set by `init`
    root: Option<PathBuf>,
}

impl LocalDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn root(&self) -> Result<&Path> {
        self.root.as_deref().ok_or(FileHubError::NotInitialized)
    }

    /// Map a virtual path to a physical path inside the root
    fn safe_path(&self, virtual_path: &str) -> Result<PathBuf> {
        let root = self.root()?;
        let relative = virtual_path.trim_start_matches('/');
        let resolved = normalize(&root.join(relative));

        if !resolved.starts_with(root) {
            warn!("Rejected path traversal attempt: {:?}", virtual_path);
            return Err(FileHubError::AccessDenied(format!(
                "path traversal attempt: {}",
                virtual_path
            )));
        }

        Ok(resolved)
    }

    /// Like `safe_path`, but refuses the root itself
    fn safe_child_path(&self, virtual_path: &str) -> Result<PathBuf> {
        let path = self.safe_path(virtual_path)?;
        if path.as_path() == self.root()? {
            return Err(FileHubError::InvalidPath(
                "operation not allowed on the storage root".to_string(),
            ));
        }
        Ok(path)
    }
}

/// Lexically collapse `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

fn map_io(err: io::Error, path: &str) -> FileHubError {
    match err.kind() {
        io::ErrorKind::NotFound => FileHubError::NotFound(path.to_string()),
        io::ErrorKind::AlreadyExists => FileHubError::AlreadyExists(path.to_string()),
        _ => FileHubError::Io(err),
    }
}

fn mtime(meta: &std::fs::Metadata) -> SystemTime {
    meta.modified().unwrap_or(UNIX_EPOCH)
}

fn to_info(name: &str, meta: &std::fs::Metadata) -> FileInfo {
    if meta.is_dir() {
        FileInfo::directory(name, mtime(meta))
    } else {
        FileInfo::file(name, meta.len(), mtime(meta))
    }
}

fn display_name(virtual_path: &str) -> &str {
    match base_name(virtual_path) {
        "" => "/",
        name => name,
    }
}

async fn read_entries(dir: &Path) -> io::Result<Vec<FileInfo>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        // Skip entries whose metadata cannot be read
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(e) => {
                debug!("Skipping {:?}: {}", entry.path(), e);
                continue;
            }
        };
        files.push(to_info(&entry.file_name().to_string_lossy(), &meta));
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

#[async_trait]
impl StorageDriver for LocalDriver {
    fn name(&self) -> String {
        "local".to_string()
    }

    async fn init(&mut self, ctx: &RequestContext, config: &DriverConfig) -> Result<()> {
        let root = config.require_str("local", "root_path")?;
        let absolute = if Path::new(root).is_absolute() {
            PathBuf::from(root)
        } else {
            std::env::current_dir()?.join(root)
        };
        let absolute = normalize(&absolute);

        let canonical = ctx
            .run(async {
                match tokio::fs::metadata(&absolute).await {
                    Ok(meta) if !meta.is_dir() => {
                        return Err(FileHubError::Config(format!(
                            "root_path '{}' is not a directory",
                            absolute.display()
                        )));
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        debug!("Creating local root {:?}", absolute);
                        tokio::fs::create_dir_all(&absolute).await.map_err(|e| {
                            FileHubError::Config(format!(
                                "failed to create root path '{}': {}",
                                absolute.display(),
                                e
                            ))
                        })?;
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(tokio::fs::canonicalize(&absolute).await?)
            })
            .await?;

        debug!("Local driver rooted at {:?}", canonical);
        self.root = Some(canonical);
        Ok(())
    }

    async fn list(&self, ctx: &RequestContext, path: &str) -> Result<Vec<FileInfo>> {
        let real = self.safe_path(path)?;
        trace!("list: path={:?} real={:?}", path, real);

        ctx.run(async { read_entries(&real).await.map_err(|e| map_io(e, path)) })
            .await
    }

    async fn open(&self, ctx: &RequestContext, path: &str) -> Result<ReadStream> {
        let real = self.safe_path(path)?;
        trace!("open: path={:?} real={:?}", path, real);

        let file = ctx
            .run(async {
                let file = tokio::fs::File::open(&real)
                    .await
                    .map_err(|e| map_io(e, path))?;
                if file.metadata().await?.is_dir() {
                    return Err(FileHubError::IsADirectory(path.to_string()));
                }
                Ok(file)
            })
            .await?;

        Ok(Box::pin(ctx.bind_reader(file)))
    }

    async fn open_file(
        &self,
        ctx: &RequestContext,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<Box<dyn VfsFile>> {
        let real = self.safe_path(path)?;
        trace!("open_file: path={:?} flags={:?} mode={:o}", path, flags, mode);

        ctx.run(async {
            if !flags.is_write() {
                let meta = tokio::fs::metadata(&real)
                    .await
                    .map_err(|e| map_io(e, path))?;
                if meta.is_dir() {
                    let entries = read_entries(&real).await?;
                    let handle = DirectoryHandle::new(to_info(display_name(path), &meta), entries);
                    return Ok(Box::new(handle) as Box<dyn VfsFile>);
                }
            }

            let mut options = tokio::fs::OpenOptions::new();
            options
                .read(flags.read || !flags.is_write())
                .write(flags.write || flags.create || flags.truncate || flags.create_new)
                .append(flags.append)
                .create(flags.create)
                .truncate(flags.truncate)
                .create_new(flags.create_new);
            #[cfg(unix)]
            options.mode(mode);

            let file = options.open(&real).await.map_err(|e| map_io(e, path))?;
            Ok(Box::new(LocalFile {
                file,
                name: display_name(path).to_string(),
                writable: flags.is_write(),
            }) as Box<dyn VfsFile>)
        })
        .await
    }

    async fn create(
        &self,
        ctx: &RequestContext,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: Option<u64>,
    ) -> Result<u64> {
        let target = self.safe_child_path(path)?;
        debug!("create: path={:?} size={:?}", path, size);

        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| FileHubError::InvalidPath(path.to_string()))?;
        let staging = parent.join(format!(
            ".{}.{}.partial",
            base_name(path),
            Uuid::new_v4().simple()
        ));

        ctx.run(async {
            tokio::fs::create_dir_all(&parent).await?;

            // Removed on every exit path until the rename commits it
            let guard = scopeguard::guard(staging.clone(), |staging| {
                let _ = std::fs::remove_file(staging);
            });

            let mut out = tokio::fs::File::create(&staging).await?;
            let written = tokio::io::copy(reader, &mut out).await?;
            out.flush().await?;
            out.sync_all().await?;
            drop(out);

            tokio::fs::rename(&staging, &target).await?;
            scopeguard::ScopeGuard::into_inner(guard);
            Ok(written)
        })
        .await
    }

    async fn mkdir(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        let real = self.safe_path(path)?;
        debug!("mkdir: path={:?}", path);

        ctx.run(async {
            let mut builder = tokio::fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(DEFAULT_DIR_MODE);
            builder.create(&real).await.map_err(|e| map_io(e, path))
        })
        .await
    }

    async fn stat(&self, ctx: &RequestContext, path: &str) -> Result<FileInfo> {
        let real = self.safe_path(path)?;
        trace!("stat: path={:?}", path);

        ctx.run(async {
            let meta = tokio::fs::metadata(&real)
                .await
                .map_err(|e| map_io(e, path))?;
            Ok(to_info(display_name(path), &meta))
        })
        .await
    }

    async fn delete(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        let real = self.safe_child_path(path)?;
        debug!("delete: path={:?}", path);

        ctx.run(async {
            let meta = tokio::fs::symlink_metadata(&real)
                .await
                .map_err(|e| map_io(e, path))?;
            if meta.is_dir() {
                tokio::fs::remove_dir_all(&real).await?;
            } else {
                tokio::fs::remove_file(&real).await?;
            }
            Ok(())
        })
        .await
    }

    async fn rename(&self, ctx: &RequestContext, from: &str, to: &str) -> Result<()> {
        let real_from = self.safe_child_path(from)?;
        let real_to = self.safe_child_path(to)?;
        debug!("rename: {:?} -> {:?}", from, to);

        ctx.run(async {
            tokio::fs::rename(&real_from, &real_to)
                .await
                .map_err(|e| map_io(e, from))
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Open regular file on local disk
struct LocalFile {
    file: tokio::fs::File,
    name: String,
    writable: bool,
}

impl AsyncRead for LocalFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

impl AsyncWrite for LocalFile {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

impl AsyncSeek for LocalFile {
    fn start_seek(mut self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.file).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.file).poll_complete(cx)
    }
}

#[async_trait]
impl VfsFile for LocalFile {
    async fn read_dir(&mut self, _count: usize) -> Result<Vec<FileInfo>> {
        Err(FileHubError::NotADirectory(self.name.clone()))
    }

    async fn stat(&mut self) -> Result<FileInfo> {
        let meta = self.file.metadata().await?;
        Ok(to_info(&self.name, &meta))
    }

    async fn close(&mut self) -> Result<()> {
        if self.writable {
            self.file.flush().await?;
            self.file.sync_all().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    async fn driver_in(dir: &Path) -> LocalDriver {
        let mut driver = LocalDriver::new();
        let config = DriverConfig::new().with("root_path", dir.to_string_lossy().as_ref());
        driver
            .init(&RequestContext::background(), &config)
            .await
            .unwrap();
        driver
    }

    async fn put(driver: &LocalDriver, path: &str, content: &[u8]) -> u64 {
        let mut reader = content;
        driver
            .create(
                &RequestContext::background(),
                path,
                &mut reader,
                Some(content.len() as u64),
            )
            .await
            .unwrap()
    }

    async fn read_all(driver: &LocalDriver, path: &str) -> Vec<u8> {
        let mut stream = driver
            .open(&RequestContext::background(), path)
            .await
            .unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/r/a/../b")), PathBuf::from("/r/b"));
        assert_eq!(normalize(Path::new("/r/./a/")), PathBuf::from("/r/a"));
        assert_eq!(normalize(Path::new("/r/../../x")), PathBuf::from("/x"));
    }

    #[tokio::test]
    async fn test_init_requires_root_path() {
        let mut driver = LocalDriver::new();
        let err = driver
            .init(&RequestContext::background(), &DriverConfig::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FileHubError::Config(_)));
    }

    #[tokio::test]
    async fn test_init_creates_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("nested/root");
        driver_in(&root).await;
        assert!(root.is_dir());
    }

    #[tokio::test]
    async fn test_init_rejects_file_root() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain.txt");
        std::fs::write(&file, b"x").unwrap();

        let mut driver = LocalDriver::new();
        let config = DriverConfig::new().with("root_path", file.to_string_lossy().as_ref());
        let err = driver
            .init(&RequestContext::background(), &config)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[tokio::test]
    async fn test_uninitialized_driver() {
        let driver = LocalDriver::new();
        let err = driver
            .list(&RequestContext::background(), "/")
            .await
            .unwrap_err();
        assert!(matches!(err, FileHubError::NotInitialized));
    }

    #[tokio::test]
    async fn test_traversal_denied_for_every_operation() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("r");
        let driver = driver_in(&root).await;
        let ctx = RequestContext::background();

        // A sibling sharing the root's name as a string prefix
        std::fs::create_dir_all(tmp.path().join("r2")).unwrap();

        let escapes = [
            "..",
            "../x",
            "a/../../x",
            "/../../etc/passwd",
            "a/b/../../../x",
            "../r2/secret",
        ];

        for path in escapes {
            let denied = |r: Result<()>| match r {
                Err(e) => assert!(e.is_access_denied(), "{}: {}", path, e),
                Ok(()) => panic!("{} was not denied", path),
            };
            denied(driver.list(&ctx, path).await.map(|_| ()));
            denied(driver.open(&ctx, path).await.map(|_| ()));
            denied(driver.stat(&ctx, path).await.map(|_| ()));
            denied(
                driver
                    .open_file(&ctx, path, OpenFlags::read_only(), 0o644)
                    .await
                    .map(|_| ()),
            );
            let mut reader = &b"x"[..];
            denied(driver.create(&ctx, path, &mut reader, None).await.map(|_| ()));
            denied(driver.mkdir(&ctx, path).await);
            denied(driver.delete(&ctx, path).await);
            denied(driver.rename(&ctx, path, "/ok.txt").await);
            denied(driver.rename(&ctx, "/ok.txt", path).await);
        }
    }

    #[tokio::test]
    async fn test_dotdot_inside_root_is_allowed() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver_in(tmp.path()).await;
        put(&driver, "/a/b.txt", b"bee").await;
        assert_eq!(read_all(&driver, "/a/../a/./b.txt").await, b"bee");
    }

    #[tokio::test]
    async fn test_create_then_open_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver_in(tmp.path()).await;
        let ctx = RequestContext::background();

        let content = b"Hello, storage!";
        let written = put(&driver, "/docs/deep/hello.txt", content).await;
        assert_eq!(written, content.len() as u64);

        assert_eq!(read_all(&driver, "/docs/deep/hello.txt").await, content);

        let info = driver.stat(&ctx, "/docs/deep/hello.txt").await.unwrap();
        assert_eq!(info.size, content.len() as u64);
        assert_eq!(info.name, "hello.txt");
        assert!(!info.is_dir);
    }

    #[tokio::test]
    async fn test_create_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver_in(tmp.path()).await;
        put(&driver, "/f.txt", b"first version").await;
        put(&driver, "/f.txt", b"v2").await;
        assert_eq!(read_all(&driver, "/f.txt").await, b"v2");
    }

    #[tokio::test]
    async fn test_list_root() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver_in(tmp.path()).await;
        put(&driver, "hello.txt", b"hi").await;
        driver
            .mkdir(&RequestContext::background(), "/sub")
            .await
            .unwrap();

        let files = driver
            .list(&RequestContext::background(), "/")
            .await
            .unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "hello.txt");
        assert_eq!(files[0].size, 2);
        assert!(!files[0].is_dir);
        assert_eq!(files[1].name, "sub");
        assert!(files[1].is_dir);
    }

    #[tokio::test]
    async fn test_missing_path_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver_in(tmp.path()).await;
        let err = driver
            .stat(&RequestContext::background(), "/nope")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_recursive() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver_in(tmp.path()).await;
        let ctx = RequestContext::background();
        put(&driver, "/dir/a.txt", b"a").await;
        put(&driver, "/dir/sub/b.txt", b"b").await;

        driver.delete(&ctx, "/dir").await.unwrap();
        assert!(driver.stat(&ctx, "/dir").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_root_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver_in(tmp.path()).await;
        let err = driver
            .delete(&RequestContext::background(), "/")
            .await
            .unwrap_err();
        assert!(matches!(err, FileHubError::InvalidPath(_)));
        assert!(tmp.path().is_dir());
    }

    #[tokio::test]
    async fn test_rename() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver_in(tmp.path()).await;
        let ctx = RequestContext::background();
        put(&driver, "/old.txt", b"data").await;

        driver.rename(&ctx, "/old.txt", "/new.txt").await.unwrap();
        assert!(driver.stat(&ctx, "/old.txt").await.unwrap_err().is_not_found());
        assert_eq!(read_all(&driver, "/new.txt").await, b"data");
    }

    #[tokio::test]
    async fn test_open_file_write_seek_read() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver_in(tmp.path()).await;
        let ctx = RequestContext::background();

        let mut file = driver
            .open_file(
                &ctx,
                "/rw.bin",
                OpenFlags::read_write().create(true).truncate(true),
                0o600,
            )
            .await
            .unwrap();
        file.write_all(b"0123456789").await.unwrap();
        file.seek(io::SeekFrom::Start(4)).await.unwrap();
        let mut buf = [0u8; 3];
        file.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"456");
        assert_eq!(file.stat().await.unwrap().size, 10);
        file.close().await.unwrap();

        assert_eq!(read_all(&driver, "/rw.bin").await, b"0123456789");
    }

    #[tokio::test]
    async fn test_open_file_directory_lists() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver_in(tmp.path()).await;
        put(&driver, "/d/one", b"1").await;
        put(&driver, "/d/two", b"22").await;

        let mut dir = driver
            .open_file(&RequestContext::background(), "/d", OpenFlags::read_only(), 0)
            .await
            .unwrap();
        assert!(dir.stat().await.unwrap().is_dir);
        let entries = dir.read_dir(0).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_default_style_mkdir_is_native() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver_in(tmp.path()).await;
        driver
            .mkdir(&RequestContext::background(), "/x/y/z")
            .await
            .unwrap();
        assert!(tmp.path().join("x/y/z").is_dir());
        assert!(!tmp.path().join("x/y/z").join(super::super::DIR_PLACEHOLDER).exists());
    }

    #[tokio::test]
    async fn test_cancelled_create_commits_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver_in(tmp.path()).await;
        let ctx = RequestContext::background();

        // Writer side sends a few bytes and then stalls
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(b"partial").await.unwrap();

        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = driver
            .create(&ctx, "/upload.bin", &mut rx, Some(1024))
            .await
            .unwrap_err();
        assert!(matches!(err, FileHubError::Cancelled));
        drop(tx);

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "found {:?}", leftovers);
    }
}
