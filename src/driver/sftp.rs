//! Network share driver over SSH/SFTP
//!
//! `init` goes through three stages, each reported separately on failure:
//! dial (TCP), handshake (SSH key exchange and password authentication)
//! and mount (SFTP subsystem, share root must be a directory). Whatever a
//! failed stage leaves behind is torn down before the error is returned.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use russh::client::{self, Handle};
use russh::keys::{HashAlg, PublicKey};
use russh::Disconnect;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::fs::File as RemoteFile;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags as RemoteFlags, StatusCode};
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{base_name, DirectoryHandle, FileInfo, OpenFlags, ReadStream, StorageDriver, VfsFile};
use crate::context::RequestContext;
use crate::error::{ConnectStage, FileHubError, Result};
use crate::model::DriverConfig;

/// Port used when the source config has none
pub const DEFAULT_PORT: u16 = 22;

const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection settings read from the source's config bag
#[derive(Debug, Clone)]
struct SftpSettings {
    host: String,
    port: u16,
    user: String,
    password: String,
    share: String,
    host_key_fingerprint: Option<String>,
}

impl SftpSettings {
    fn from_config(config: &DriverConfig) -> Result<Self> {
        Ok(Self {
            host: config.require_str("sftp", "host")?.to_string(),
            port: config.get_port("port")?.unwrap_or(DEFAULT_PORT),
            user: config.require_str("sftp", "user")?.to_string(),
            password: config.require_str("sftp", "password")?.to_string(),
            share: config
                .require_str("sftp", "share_name")?
                .trim_end_matches('/')
                .to_string(),
            host_key_fingerprint: config.get_str("host_key_fingerprint").map(str::to_string),
        })
    }
}

/// Verifies the server key against an optional pinned fingerprint
struct HostKeyCheck {
    host: String,
    expected: Option<String>,
}

fn fingerprint_matches(expected: &str, actual: &str) -> bool {
    let strip = |s: &str| s.trim().trim_start_matches("SHA256:").to_string();
    strip(expected) == strip(actual)
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match &self.expected {
            Some(expected) => {
                let matches = fingerprint_matches(expected, &fingerprint);
                if !matches {
                    warn!(
                        "Host key mismatch for {}: expected {}, got {}",
                        self.host, expected, fingerprint
                    );
                }
                Ok(matches)
            }
            None => {
                warn!(
                    "Accepting unverified host key for {}: {}",
                    self.host, fingerprint
                );
                Ok(true)
            }
        }
    }
}

/// Live session: SSH transport plus the SFTP channel on top of it
struct Mounted {
    handle: Handle<HostKeyCheck>,
    sftp: SftpSession,
    share: String,
}

impl Mounted {
    fn remote(&self, virtual_path: &str) -> Result<String> {
        Ok(join_remote(&self.share, &segments(virtual_path)?))
    }
}

/// Strip leading separators and use `/` throughout; empty becomes "."
fn native_path(virtual_path: &str) -> String {
    let native = virtual_path
        .trim_start_matches(['/', '\\'])
        .replace('\\', "/");
    if native.is_empty() {
        ".".to_string()
    } else {
        native
    }
}

/// Path segments below the share root; `..` may not climb above it
fn segments(virtual_path: &str) -> Result<Vec<String>> {
    let native = native_path(virtual_path);
    let mut parts: Vec<String> = Vec::new();
    for segment in native.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    warn!("Rejected path traversal attempt: {:?}", virtual_path);
                    return Err(FileHubError::AccessDenied(format!(
                        "path traversal attempt: {}",
                        virtual_path
                    )));
                }
            }
            part => parts.push(part.to_string()),
        }
    }
    Ok(parts)
}

fn join_remote(share: &str, parts: &[String]) -> String {
    if parts.is_empty() {
        if share.is_empty() {
            ".".to_string()
        } else {
            share.to_string()
        }
    } else if share.is_empty() {
        parts.join("/")
    } else {
        format!("{}/{}", share, parts.join("/"))
    }
}

fn map_sftp(err: SftpError, path: &str) -> FileHubError {
    if let SftpError::Status(status) = &err {
        match status.status_code {
            StatusCode::NoSuchFile => return FileHubError::NotFound(path.to_string()),
            StatusCode::PermissionDenied => {
                return FileHubError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("{}: {}", path, err),
                ))
            }
            StatusCode::OpUnsupported => return FileHubError::NotSupported(path.to_string()),
            _ => {}
        }
    }
    FileHubError::Backend(format!("{}: {}", path, err))
}

fn to_info(name: &str, attrs: &FileAttributes) -> FileInfo {
    let modified = attrs
        .mtime
        .map(|secs| UNIX_EPOCH + Duration::from_secs(u64::from(secs)))
        .unwrap_or(UNIX_EPOCH);
    if attrs.is_dir() {
        FileInfo::directory(name, modified)
    } else {
        FileInfo::file(name, attrs.size.unwrap_or(0), modified)
    }
}

fn display_name(virtual_path: &str) -> &str {
    match base_name(virtual_path) {
        "" => "/",
        name => name,
    }
}

fn is_pseudo_entry(name: &str) -> bool {
    name == "." || name == ".."
}

async fn disconnect(handle: &Handle<HostKeyCheck>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "closing", "en")
        .await
    {
        debug!("SSH disconnect failed: {}", e);
    }
}

/// Dial, authenticate and mount. Each failure cleans up the earlier stages.
async fn connect(settings: &SftpSettings) -> Result<Mounted> {
    let addr = format!("{}:{}", settings.host, settings.port);
    info!("Connecting to sftp://{}@{}", settings.user, addr);

    let stream = TcpStream::connect((settings.host.as_str(), settings.port))
        .await
        .map_err(|e| FileHubError::connection(ConnectStage::Dial, format!("{}: {}", addr, e)))?;

    let config = Arc::new(client::Config {
        inactivity_timeout: Some(INACTIVITY_TIMEOUT),
        ..<_>::default()
    });
    let handler = HostKeyCheck {
        host: addr.clone(),
        expected: settings.host_key_fingerprint.clone(),
    };
    let mut handle = client::connect_stream(config, stream, handler)
        .await
        .map_err(|e| FileHubError::connection(ConnectStage::Handshake, e))?;

    let auth = match handle
        .authenticate_password(&settings.user, &settings.password)
        .await
    {
        Ok(auth) => auth,
        Err(e) => {
            disconnect(&handle).await;
            return Err(FileHubError::connection(ConnectStage::Handshake, e));
        }
    };
    if !auth.success() {
        disconnect(&handle).await;
        return Err(FileHubError::connection(
            ConnectStage::Handshake,
            format!("authentication rejected for user '{}'", settings.user),
        ));
    }

    match mount(&handle, &settings.share).await {
        Ok(sftp) => {
            info!("Mounted share '{}' on {}", settings.share, addr);
            Ok(Mounted {
                handle,
                sftp,
                share: settings.share.clone(),
            })
        }
        Err(e) => {
            disconnect(&handle).await;
            Err(e)
        }
    }
}

async fn mount(handle: &Handle<HostKeyCheck>, share: &str) -> Result<SftpSession> {
    let stage = |e: &dyn std::fmt::Display| FileHubError::connection(ConnectStage::Mount, e);

    let channel = handle.channel_open_session().await.map_err(|e| stage(&e))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| stage(&e))?;
    let sftp = SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| stage(&e))?;

    let root = if share.is_empty() { "." } else { share };
    let is_dir = match sftp.metadata(root).await {
        Ok(attrs) => attrs.is_dir(),
        Err(e) => {
            let _ = sftp.close().await;
            return Err(stage(&format!("share '{}': {}", root, e)));
        }
    };
    if !is_dir {
        let _ = sftp.close().await;
        return Err(stage(&format!("share '{}' is not a directory", root)));
    }
    Ok(sftp)
}

/// Create every missing directory along `parts`
async fn create_dirs(sftp: &SftpSession, share: &str, parts: &[String]) -> Result<()> {
    for depth in 1..=parts.len() {
        let dir = join_remote(share, &parts[..depth]);
        match sftp.metadata(dir.as_str()).await {
            Ok(attrs) if attrs.is_dir() => continue,
            Ok(_) => return Err(FileHubError::NotADirectory(dir)),
            Err(_) => {
                trace!("create_dir {}", dir);
                sftp.create_dir(dir.as_str())
                    .await
                    .map_err(|e| map_sftp(e, &dir))?;
            }
        }
    }
    Ok(())
}

/// Remote calls needed to swap a staged upload into place
#[async_trait]
trait StagedSwap: Send + Sync {
    async fn move_entry(&self, from: &str, to: &str) -> Result<()>;
    async fn remove_entry(&self, path: &str) -> Result<()>;
}

#[async_trait]
impl StagedSwap for SftpSession {
    async fn move_entry(&self, from: &str, to: &str) -> Result<()> {
        self.rename(from, to).await.map_err(|e| map_sftp(e, from))
    }

    async fn remove_entry(&self, path: &str) -> Result<()> {
        self.remove_file(path).await.map_err(|e| map_sftp(e, path))
    }
}

/// Move `staging` onto `target`
///
/// SFTP v3 rename refuses to replace an existing file, so an old target is
/// first moved aside and only removed once the new file is in place. If the
/// final rename fails the old file is moved back.
async fn commit_staged(remote: &dyn StagedSwap, staging: &str, target: &str) -> Result<()> {
    let backup = format!("{}.{}.bak", target, Uuid::new_v4().simple());
    let replaced = match remote.move_entry(target, &backup).await {
        Ok(()) => true,
        Err(e) if e.is_not_found() => false,
        Err(e) => return Err(e),
    };

    if let Err(e) = remote.move_entry(staging, target).await {
        if replaced {
            if let Err(restore) = remote.move_entry(&backup, target).await {
                warn!("Could not restore {} from {}: {}", target, backup, restore);
            }
        }
        return Err(e);
    }

    if replaced {
        if let Err(e) = remote.remove_entry(&backup).await {
            warn!("Failed to remove replaced file {}: {}", backup, e);
        }
    }
    Ok(())
}

/// Delete a file or a whole tree, children before parents
async fn remove_tree(sftp: &SftpSession, root: &str) -> Result<()> {
    let attrs = sftp.metadata(root).await.map_err(|e| map_sftp(e, root))?;
    if !attrs.is_dir() {
        return sftp.remove_file(root).await.map_err(|e| map_sftp(e, root));
    }

    let mut dirs = vec![root.to_string()];
    let mut next = 0;
    while next < dirs.len() {
        let dir = dirs[next].clone();
        next += 1;
        let entries = sftp.read_dir(dir.as_str()).await.map_err(|e| map_sftp(e, &dir))?;
        for entry in entries {
            let name = entry.file_name();
            if is_pseudo_entry(&name) {
                continue;
            }
            let child = format!("{}/{}", dir, name);
            if entry.metadata().is_dir() {
                dirs.push(child);
            } else {
                sftp.remove_file(child.as_str())
                    .await
                    .map_err(|e| map_sftp(e, &child))?;
            }
        }
    }

    for dir in dirs.iter().rev() {
        sftp.remove_dir(dir.as_str())
            .await
            .map_err(|e| map_sftp(e, dir))?;
    }
    Ok(())
}

async fn read_entries(sftp: &SftpSession, remote: &str) -> Result<Vec<FileInfo>> {
    let entries = sftp.read_dir(remote).await.map_err(|e| map_sftp(e, remote))?;
    let mut files: Vec<FileInfo> = entries
        .filter(|entry| !is_pseudo_entry(&entry.file_name()))
        .map(|entry| to_info(&entry.file_name(), &entry.metadata()))
        .collect();
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// Driver for a directory shared over SFTP
#[derive(Default)]
pub struct SftpDriver {
    session: RwLock<Option<Arc<Mounted>>>,
}

impl SftpDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn mounted(&self) -> Result<Arc<Mounted>> {
        self.session
            .read()
            .clone()
            .ok_or(FileHubError::NotInitialized)
    }
}

#[async_trait]
impl StorageDriver for SftpDriver {
    fn name(&self) -> String {
        "sftp".to_string()
    }

    async fn init(&mut self, ctx: &RequestContext, config: &DriverConfig) -> Result<()> {
        let settings = SftpSettings::from_config(config)?;
        let mounted = ctx.run(connect(&settings)).await?;
        if let Some(previous) = self.session.write().replace(Arc::new(mounted)) {
            debug!("Re-initialized sftp driver, dropping previous session to {}", previous.share);
        }
        Ok(())
    }

    async fn list(&self, ctx: &RequestContext, path: &str) -> Result<Vec<FileInfo>> {
        let m = self.mounted()?;
        let remote = m.remote(path)?;
        trace!("list: path={:?} remote={:?}", path, remote);

        ctx.run(read_entries(&m.sftp, &remote)).await
    }

    async fn open(&self, ctx: &RequestContext, path: &str) -> Result<ReadStream> {
        let m = self.mounted()?;
        let remote = m.remote(path)?;
        trace!("open: path={:?} remote={:?}", path, remote);

        let file = ctx
            .run(async {
                let attrs = m
                    .sftp
                    .metadata(remote.as_str())
                    .await
                    .map_err(|e| map_sftp(e, path))?;
                if attrs.is_dir() {
                    return Err(FileHubError::IsADirectory(path.to_string()));
                }
                m.sftp
                    .open(remote.as_str())
                    .await
                    .map_err(|e| map_sftp(e, path))
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
        let m = self.mounted()?;
        let remote = m.remote(path)?;
        // The remote umask decides permissions of new files
        trace!("open_file: path={:?} flags={:?} mode={:o}", path, flags, mode);

        ctx.run(async {
            if !flags.is_write() {
                let attrs = m
                    .sftp
                    .metadata(remote.as_str())
                    .await
                    .map_err(|e| map_sftp(e, path))?;
                if attrs.is_dir() {
                    let entries = read_entries(&m.sftp, &remote).await?;
                    let handle = DirectoryHandle::new(to_info(display_name(path), &attrs), entries);
                    return Ok(Box::new(handle) as Box<dyn VfsFile>);
                }
            }

            let mut remote_flags = RemoteFlags::empty();
            if flags.read || !flags.is_write() {
                remote_flags |= RemoteFlags::READ;
            }
            if flags.write || flags.create || flags.truncate || flags.create_new {
                remote_flags |= RemoteFlags::WRITE;
            }
            if flags.append {
                remote_flags |= RemoteFlags::APPEND;
            }
            if flags.create || flags.create_new {
                remote_flags |= RemoteFlags::CREATE;
            }
            if flags.truncate {
                remote_flags |= RemoteFlags::TRUNCATE;
            }
            if flags.create_new {
                remote_flags |= RemoteFlags::EXCLUDE;
            }

            let file = m
                .sftp
                .open_with_flags(remote.as_str(), remote_flags)
                .await
                .map_err(|e| map_sftp(e, path))?;
            Ok(Box::new(SftpFile {
                file,
                name: display_name(path).to_string(),
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
        let m = self.mounted()?;
        let parts = segments(path)?;
        if parts.is_empty() {
            return Err(FileHubError::InvalidPath(
                "operation not allowed on the share root".to_string(),
            ));
        }
        let target = join_remote(&m.share, &parts);
        let staging = format!("{}.{}.partial", target, Uuid::new_v4().simple());
        debug!("create: path={:?} remote={:?} size={:?}", path, target, size);

        let uploaded = ctx
            .run(async {
                create_dirs(&m.sftp, &m.share, &parts[..parts.len() - 1]).await?;

                let mut file = m
                    .sftp
                    .create(staging.as_str())
                    .await
                    .map_err(|e| map_sftp(e, path))?;
                let written = tokio::io::copy(reader, &mut file).await?;
                file.shutdown().await?;
                Ok(written)
            })
            .await;

        // The swap is not cancellable: stopping between its renames would
        // leave neither file at the target
        let result = match uploaded {
            Ok(written) => commit_staged(&m.sftp, &staging, &target)
                .await
                .map(|()| written),
            Err(e) => Err(e),
        };

        if result.is_err() {
            if let Err(e) = m.sftp.remove_file(staging.as_str()).await {
                trace!("No staging file to clean up at {}: {}", staging, e);
            }
        }
        result
    }

    async fn mkdir(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        let m = self.mounted()?;
        let parts = segments(path)?;
        debug!("mkdir: path={:?}", path);

        ctx.run(create_dirs(&m.sftp, &m.share, &parts)).await
    }

    async fn stat(&self, ctx: &RequestContext, path: &str) -> Result<FileInfo> {
        let m = self.mounted()?;
        let remote = m.remote(path)?;
        trace!("stat: path={:?} remote={:?}", path, remote);

        ctx.run(async {
            let attrs = m
                .sftp
                .metadata(remote.as_str())
                .await
                .map_err(|e| map_sftp(e, path))?;
            Ok(to_info(display_name(path), &attrs))
        })
        .await
    }

    async fn delete(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        let m = self.mounted()?;
        let parts = segments(path)?;
        if parts.is_empty() {
            return Err(FileHubError::InvalidPath(
                "operation not allowed on the share root".to_string(),
            ));
        }
        let remote = join_remote(&m.share, &parts);
        debug!("delete: path={:?} remote={:?}", path, remote);

        ctx.run(remove_tree(&m.sftp, &remote)).await
    }

    async fn rename(&self, ctx: &RequestContext, from: &str, to: &str) -> Result<()> {
        let m = self.mounted()?;
        let remote_from = m.remote(from)?;
        let remote_to = m.remote(to)?;
        debug!("rename: {:?} -> {:?}", remote_from, remote_to);

        ctx.run(async {
            m.sftp
                .rename(remote_from.as_str(), remote_to.as_str())
                .await
                .map_err(|e| map_sftp(e, from))
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let Some(m) = self.session.write().take() else {
            return Ok(());
        };
        info!("Closing sftp session for share '{}'", m.share);

        if let Err(e) = m.sftp.close().await {
            debug!("SFTP close failed: {}", e);
        }
        disconnect(&m.handle).await;
        Ok(())
    }
}

/// Open remote file
struct SftpFile {
    file: RemoteFile,
    name: String,
}

impl AsyncRead for SftpFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

impl AsyncWrite for SftpFile {
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

impl AsyncSeek for SftpFile {
    fn start_seek(mut self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.file).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.file).poll_complete(cx)
    }
}

#[async_trait]
impl VfsFile for SftpFile {
    async fn read_dir(&mut self, _count: usize) -> Result<Vec<FileInfo>> {
        Err(FileHubError::NotADirectory(self.name.clone()))
    }

    async fn stat(&mut self) -> Result<FileInfo> {
        let attrs = self
            .file
            .metadata()
            .await
            .map_err(|e| map_sftp(e, &self.name))?;
        Ok(to_info(&self.name, &attrs))
    }

    async fn close(&mut self) -> Result<()> {
        self.file.shutdown().await?;
        Ok(())
    }
}
