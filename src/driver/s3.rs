//! S3 driver
//!
//! Serves a bucket (optionally below a key prefix) on Amazon S3 or an
//! S3-compatible store (MinIO, LocalStack, etc.). Directories are virtual:
//! they exist when objects share the prefix, and `mkdir` writes a zero-byte
//! `key/` marker object.

use std::collections::HashMap;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncWrite, ReadBuf};
use tracing::{debug, info, trace, warn};

use super::{
    base_name, resolve_path, DirectoryHandle, FileInfo, OpenFlags, ReadStream, StorageDriver,
    VfsFile, DEFAULT_FILE_MODE,
};
use crate::context::RequestContext;
use crate::error::{ConnectStage, FileHubError, Result};
use crate::model::DriverConfig;

/// S3 metadata key for storing POSIX file mode
const S3_MODE_METADATA_KEY: &str = "posix-mode";

/// Connection settings read from the source's config bag
#[derive(Debug, Clone)]
struct S3Settings {
    bucket: String,
    region: Option<String>,
    prefix: String,
    endpoint: Option<String>,
    force_path_style: bool,
    credentials: Option<(String, String)>,
}

impl S3Settings {
    fn from_config(config: &DriverConfig) -> Result<Self> {
        let credentials = match (config.get_str("access_key"), config.get_str("secret_key")) {
            (Some(access), Some(secret)) => Some((access.to_string(), secret.to_string())),
            (None, None) => None,
            _ => {
                return Err(FileHubError::Config(
                    "s3 driver requires both 'access_key' and 'secret_key' or neither".to_string(),
                ))
            }
        };

        Ok(Self {
            bucket: config.require_str("s3", "bucket")?.to_string(),
            region: config.get_str("region").map(str::to_string),
            prefix: config
                .get_str("prefix")
                .unwrap_or_default()
                .trim_matches('/')
                .to_string(),
            endpoint: config.get_str("endpoint").map(str::to_string),
            force_path_style: config.get_bool("force_path_style").unwrap_or(false),
            credentials,
        })
    }
}

/// Convert a virtual path to an S3 key below `prefix`
///
/// `..` is resolved before the key is built; climbing above the root is
/// refused so the key can never leave the prefix.
fn path_to_key(prefix: &str, path: &str) -> Result<String> {
    let resolved = resolve_path(path).map_err(|e| {
        warn!("Rejected path traversal attempt: {:?}", path);
        e
    })?;
    let path = resolved.trim_start_matches('/');

    Ok(if path.is_empty() {
        prefix.to_string()
    } else if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", prefix, path)
    })
}

/// Key with a trailing slash, as used for directory prefixes and markers
fn dir_key(key: &str) -> String {
    if key.is_empty() || key.ends_with('/') {
        key.to_string()
    } else {
        format!("{}/", key)
    }
}

/// Create S3 metadata HashMap with mode
fn mode_to_metadata(mode: u32) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert(S3_MODE_METADATA_KEY.to_string(), format!("{:o}", mode));
    metadata
}

fn to_system_time(dt: Option<&DateTime>) -> SystemTime {
    dt.and_then(|dt| u64::try_from(dt.secs()).ok())
        .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap_or(UNIX_EPOCH)
}

fn display_name(virtual_path: &str) -> &str {
    match base_name(virtual_path) {
        "" => "/",
        name => name,
    }
}

struct Bucket {
    client: Client,
    bucket: String,
    prefix: String,
}

/// Driver for an S3 bucket
#[derive(Default)]
pub struct S3Driver {
    inner: Option<Bucket>,
}

impl S3Driver {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self) -> Result<&Bucket> {
        self.inner.as_ref().ok_or(FileHubError::NotInitialized)
    }
}

impl Bucket {
    fn key(&self, path: &str) -> Result<String> {
        path_to_key(&self.prefix, path)
    }

    async fn put(&self, key: &str, data: Vec<u8>, mode: Option<u32>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .set_metadata(mode.map(mode_to_metadata))
            .send()
            .await
            .map_err(|e| FileHubError::Backend(format!("S3 PutObject error: {}", e)))?;
        Ok(())
    }

    /// Whole object body, or `None` when the key does not exist
    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Ok(None);
                }
                return Err(FileHubError::Backend(format!(
                    "S3 GetObject error: {}",
                    service_error
                )));
            }
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| FileHubError::Backend(format!("S3 read body error: {}", e)))?;
        Ok(Some(body.into_bytes().to_vec()))
    }

    /// Metadata of an object when `key` names one
    async fn head(&self, key: &str) -> Result<Option<(u64, SystemTime)>> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let size = output.content_length().unwrap_or(0).max(0) as u64;
                Ok(Some((size, to_system_time(output.last_modified()))))
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(None)
                } else {
                    Err(FileHubError::Backend(format!(
                        "S3 HeadObject error: {}",
                        service_error
                    )))
                }
            }
        }
    }

    /// Whether any object lives below the directory prefix
    async fn has_children(&self, prefix: &str) -> Result<bool> {
        let list_result = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                FileHubError::Backend(format!(
                    "S3 ListObjectsV2 error for prefix '{}': {:?}",
                    prefix, service_error
                ))
            })?;

        Ok(list_result.key_count().unwrap_or(0) > 0 || !list_result.common_prefixes().is_empty())
    }

    /// Every key below `prefix`, following continuation tokens
    async fn keys_under(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let result = request.send().await.map_err(|e| {
                let service_error = e.into_service_error();
                FileHubError::Backend(format!(
                    "S3 ListObjectsV2 error for prefix '{}': {:?}",
                    prefix, service_error
                ))
            })?;

            keys.extend(
                result
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .map(str::to_string),
            );

            if result.is_truncated().unwrap_or(false) {
                continuation_token = result.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(keys)
    }

    /// Batch-delete keys, 1000 per request
    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        for chunk in keys.chunks(1000) {
            let objects = chunk
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| FileHubError::Backend(format!("Failed to build delete: {}", e)))?;

            let delete = Delete::builder()
                .set_objects(Some(objects))
                .build()
                .map_err(|e| FileHubError::Backend(format!("Failed to build delete: {}", e)))?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| FileHubError::Backend(format!("S3 DeleteObjects error: {}", e)))?;
        }
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let copy_source = format!("{}/{}", self.bucket, from);
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(to)
            .copy_source(&copy_source)
            .send()
            .await
            .map_err(|e| FileHubError::Backend(format!("S3 CopyObject error: {}", e)))?;
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        let prefix = dir_key(&self.key(path)?);
        let mut files = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/");

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let result = request.send().await.map_err(|e| {
                let service_error = e.into_service_error();
                FileHubError::Backend(format!(
                    "S3 ListObjectsV2 list error: {:?}",
                    service_error
                ))
            })?;

            for obj in result.contents() {
                let Some(key) = obj.key() else { continue };
                // Skip directory marker objects
                if key.ends_with('/') || key == prefix {
                    continue;
                }
                let name = key.strip_prefix(&prefix).unwrap_or(key);
                if name.contains('/') {
                    continue;
                }
                let size = obj.size().unwrap_or(0).max(0) as u64;
                files.push(FileInfo::file(name, size, to_system_time(obj.last_modified())));
            }

            for common_prefix in result.common_prefixes() {
                if let Some(p) = common_prefix.prefix() {
                    let name = p.strip_prefix(&prefix).unwrap_or(p).trim_end_matches('/');
                    if !name.is_empty() {
                        files.push(FileInfo::directory(name, UNIX_EPOCH));
                    }
                }
            }

            if result.is_truncated().unwrap_or(false) {
                continuation_token = result.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        if files.is_empty() && !prefix.is_empty() && !self.has_children(&prefix).await? {
            return Err(FileHubError::NotFound(path.to_string()));
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let key = self.key(path)?;
        let name = display_name(path);

        // Root directory always exists
        if key.is_empty() || key == self.prefix {
            return Ok(FileInfo::directory(name, UNIX_EPOCH));
        }

        if let Some((size, modified)) = self.head(&key).await? {
            return Ok(FileInfo::file(name, size, modified));
        }

        if self.has_children(&dir_key(&key)).await? {
            return Ok(FileInfo::directory(name, UNIX_EPOCH));
        }

        Err(FileHubError::NotFound(path.to_string()))
    }
}

#[async_trait]
impl StorageDriver for S3Driver {
    fn name(&self) -> String {
        "s3".to_string()
    }

    async fn init(&mut self, ctx: &RequestContext, config: &DriverConfig) -> Result<()> {
        let settings = S3Settings::from_config(config)?;

        let mut sdk_config_builder = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            sdk_config_builder = sdk_config_builder.region(Region::new(region.clone()));
        }
        let sdk_config = ctx.run(async { Ok(sdk_config_builder.load().await) }).await?;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }
        if settings.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }
        if let Some((access_key, secret_key)) = &settings.credentials {
            s3_config_builder = s3_config_builder.credentials_provider(Credentials::new(
                access_key.as_str(),
                secret_key.as_str(),
                None,
                None,
                "filehub",
            ));
        }
        let client = Client::from_conf(s3_config_builder.build());

        info!("Checking bucket s3://{}/{}", settings.bucket, settings.prefix);
        ctx.run(async {
            client
                .head_bucket()
                .bucket(&settings.bucket)
                .send()
                .await
                .map_err(|e| {
                    FileHubError::connection(
                        ConnectStage::Mount,
                        format!("bucket '{}': {}", settings.bucket, e.into_service_error()),
                    )
                })
        })
        .await?;

        self.inner = Some(Bucket {
            client,
            bucket: settings.bucket,
            prefix: settings.prefix,
        });
        Ok(())
    }

    async fn list(&self, ctx: &RequestContext, path: &str) -> Result<Vec<FileInfo>> {
        let bucket = self.bucket()?;
        trace!("list: path={:?}", path);
        ctx.run(bucket.list(path)).await
    }

    async fn open(&self, ctx: &RequestContext, path: &str) -> Result<ReadStream> {
        let bucket = self.bucket()?;
        let key = bucket.key(path)?;
        trace!("open: path={:?} key={}", path, key);

        let output = ctx
            .run(async {
                bucket
                    .client
                    .get_object()
                    .bucket(&bucket.bucket)
                    .key(&key)
                    .send()
                    .await
                    .map_err(|e| {
                        let service_error = e.into_service_error();
                        if service_error.is_no_such_key() {
                            FileHubError::NotFound(path.to_string())
                        } else {
                            FileHubError::Backend(format!("S3 GetObject error: {}", service_error))
                        }
                    })
            })
            .await?;

        Ok(Box::pin(ctx.bind_reader(Box::pin(output.body.into_async_read()))))
    }

    async fn open_file(
        &self,
        ctx: &RequestContext,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<Box<dyn VfsFile>> {
        let bucket = self.bucket()?;
        let key = bucket.key(path)?;
        trace!("open_file: path={:?} key={} flags={:?}", path, key, flags);

        ctx.run(async {
            if key.is_empty() || key == bucket.prefix {
                if flags.is_write() {
                    return Err(FileHubError::IsADirectory(path.to_string()));
                }
                let info = bucket.stat(path).await?;
                let entries = bucket.list(path).await?;
                return Ok(Box::new(DirectoryHandle::new(info, entries)) as Box<dyn VfsFile>);
            }

            let existing = if flags.truncate && !flags.create_new {
                bucket.head(&key).await?.map(|_| Vec::new())
            } else {
                bucket.fetch(&key).await?
            };

            let (data, dirty) = match existing {
                Some(_) if flags.create_new => {
                    return Err(FileHubError::AlreadyExists(path.to_string()));
                }
                Some(data) => (data, flags.truncate),
                None if flags.create || flags.create_new => (Vec::new(), true),
                None => {
                    if !flags.is_write() {
                        let info = bucket.stat(path).await?;
                        if info.is_dir {
                            let entries = bucket.list(path).await?;
                            return Ok(Box::new(DirectoryHandle::new(info, entries))
                                as Box<dyn VfsFile>);
                        }
                    }
                    return Err(FileHubError::NotFound(path.to_string()));
                }
            };

            let mut data = Cursor::new(data);
            if flags.append {
                data.set_position(data.get_ref().len() as u64);
            }

            Ok(Box::new(S3File {
                client: bucket.client.clone(),
                bucket: bucket.bucket.clone(),
                key: key.clone(),
                name: display_name(path).to_string(),
                data,
                dirty,
                append: flags.append,
                writable: flags.is_write(),
                mode,
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
        let bucket = self.bucket()?;
        let key = bucket.key(path)?;
        if key.is_empty() || key == bucket.prefix {
            return Err(FileHubError::InvalidPath(
                "operation not allowed on the bucket root".to_string(),
            ));
        }
        debug!("create: path={:?} key={} size={:?}", path, key, size);

        ctx.run(async {
            // PutObject needs the whole body; nothing is stored until it arrived
            let capacity = size.unwrap_or(0).min(64 * 1024 * 1024) as usize;
            let mut data = Vec::with_capacity(capacity);
            reader.read_to_end(&mut data).await?;
            let written = data.len() as u64;
            bucket.put(&key, data, Some(DEFAULT_FILE_MODE)).await?;
            Ok(written)
        })
        .await
    }

    async fn mkdir(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        let bucket = self.bucket()?;
        let key = dir_key(&bucket.key(path)?);
        debug!("mkdir: path={:?} key={}", path, key);
        if key.is_empty() {
            return Ok(());
        }

        // Zero-byte object with trailing slash marks the directory
        ctx.run(bucket.put(&key, Vec::new(), None)).await
    }

    async fn stat(&self, ctx: &RequestContext, path: &str) -> Result<FileInfo> {
        let bucket = self.bucket()?;
        trace!("stat: path={:?}", path);
        ctx.run(bucket.stat(path)).await
    }

    async fn delete(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        let bucket = self.bucket()?;
        let key = bucket.key(path)?;
        if key.is_empty() || key == bucket.prefix {
            return Err(FileHubError::InvalidPath(
                "operation not allowed on the bucket root".to_string(),
            ));
        }
        debug!("delete: path={:?} key={}", path, key);

        ctx.run(async {
            let mut keys = bucket.keys_under(&dir_key(&key)).await?;
            if bucket.head(&key).await?.is_some() {
                keys.push(key.clone());
            }
            if keys.is_empty() {
                return Err(FileHubError::NotFound(path.to_string()));
            }
            bucket.delete_keys(&keys).await
        })
        .await
    }

    async fn rename(&self, ctx: &RequestContext, from: &str, to: &str) -> Result<()> {
        let bucket = self.bucket()?;
        let from_key = bucket.key(from)?;
        let to_key = bucket.key(to)?;
        debug!("rename: {} -> {}", from_key, to_key);

        // No native rename: copy every object, then delete the originals
        ctx.run(async {
            if bucket.head(&from_key).await?.is_some() {
                bucket.copy(&from_key, &to_key).await?;
                return bucket.delete_keys(&[from_key.clone()]).await;
            }

            let from_prefix = dir_key(&from_key);
            let to_prefix = dir_key(&to_key);
            let keys = bucket.keys_under(&from_prefix).await?;
            if keys.is_empty() {
                return Err(FileHubError::NotFound(from.to_string()));
            }
            for key in &keys {
                let suffix = key.strip_prefix(&from_prefix).unwrap_or(key);
                bucket.copy(key, &format!("{}{}", to_prefix, suffix)).await?;
            }
            bucket.delete_keys(&keys).await
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Object held in memory while open; uploaded on close when modified
struct S3File {
    client: Client,
    bucket: String,
    key: String,
    name: String,
    data: Cursor<Vec<u8>>,
    dirty: bool,
    append: bool,
    writable: bool,
    mode: u32,
}

fn read_only_error() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "file not opened for writing")
}

impl AsyncRead for S3File {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().data).poll_read(cx, buf)
    }
}

impl AsyncWrite for S3File {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.writable {
            return Poll::Ready(Err(read_only_error()));
        }
        if this.append {
            let end = this.data.get_ref().len() as u64;
            this.data.set_position(end);
        }
        this.dirty = true;
        Pin::new(&mut this.data).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for S3File {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.get_mut().data).start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.get_mut().data).poll_complete(cx)
    }
}

#[async_trait]
impl VfsFile for S3File {
    async fn read_dir(&mut self, _count: usize) -> Result<Vec<FileInfo>> {
        Err(FileHubError::NotADirectory(self.name.clone()))
    }

    async fn stat(&mut self) -> Result<FileInfo> {
        Ok(FileInfo::file(
            self.name.clone(),
            self.data.get_ref().len() as u64,
            SystemTime::now(),
        ))
    }

    async fn close(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        debug!("Uploading {} bytes to {}", self.data.get_ref().len(), self.key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(ByteStream::from(self.data.get_ref().clone()))
            .set_metadata(Some(mode_to_metadata(self.mode)))
            .send()
            .await
            .map_err(|e| FileHubError::Backend(format!("S3 PutObject error: {}", e)))?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncSeekExt, AsyncWriteExt};

    #[test]
    fn test_path_to_key() {
        assert_eq!(path_to_key("", "/").unwrap(), "");
        assert_eq!(path_to_key("", "/a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(path_to_key("data", "/").unwrap(), "data");
        assert_eq!(path_to_key("data", "/a/b.txt").unwrap(), "data/a/b.txt");
        assert_eq!(path_to_key("data", "a/./c/../b.txt").unwrap(), "data/a/b.txt");
        assert_eq!(dir_key("data/a"), "data/a/");
        assert_eq!(dir_key("data/a/"), "data/a/");
        assert_eq!(dir_key(""), "");
    }

    #[test]
    fn test_path_to_key_refuses_escaping_the_prefix() {
        for path in ["/../b/x", "..", "a/../../b", "/a/b/../../../data2/x"] {
            let err = path_to_key("data", path).unwrap_err();
            assert!(matches!(err, FileHubError::AccessDenied(_)), "{}", path);
        }
    }

    #[test]
    fn test_settings() {
        let config = DriverConfig::new()
            .with("bucket", "files")
            .with("prefix", "/tenant-a/")
            .with("force_path_style", true)
            .with("access_key", "minio")
            .with("secret_key", "minio123");
        let settings = S3Settings::from_config(&config).unwrap();
        assert_eq!(settings.bucket, "files");
        assert_eq!(settings.prefix, "tenant-a");
        assert!(settings.force_path_style);
        assert_eq!(
            settings.credentials,
            Some(("minio".to_string(), "minio123".to_string()))
        );
    }

    #[test]
    fn test_settings_validation() {
        let err = S3Settings::from_config(&DriverConfig::new()).unwrap_err();
        assert!(err.to_string().contains("bucket"));

        let half = DriverConfig::new()
            .with("bucket", "files")
            .with("access_key", "minio");
        assert!(matches!(
            S3Settings::from_config(&half),
            Err(FileHubError::Config(_))
        ));
    }

    #[test]
    fn test_timestamps() {
        assert_eq!(to_system_time(None), UNIX_EPOCH);
        let dt = DateTime::from_secs(1_700_000_000);
        assert_eq!(
            to_system_time(Some(&dt)),
            UNIX_EPOCH + Duration::from_secs(1_700_000_000)
        );
    }

    fn offline_file(data: &[u8], writable: bool, append: bool) -> S3File {
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        S3File {
            client: Client::from_conf(config),
            bucket: "files".to_string(),
            key: "a.txt".to_string(),
            name: "a.txt".to_string(),
            data: Cursor::new(data.to_vec()),
            dirty: false,
            append,
            writable,
            mode: DEFAULT_FILE_MODE,
        }
    }

    #[tokio::test]
    async fn test_buffered_file_tracks_writes() {
        let mut file = offline_file(b"hello world", true, false);
        file.seek(io::SeekFrom::Start(6)).await.unwrap();
        file.write_all(b"there").await.unwrap();
        assert!(file.dirty);
        assert_eq!(file.data.get_ref(), b"hello there");
        assert_eq!(file.stat().await.unwrap().size, 11);
    }

    #[tokio::test]
    async fn test_buffered_file_append_and_read_only() {
        let mut file = offline_file(b"log:", true, true);
        file.write_all(b"a").await.unwrap();
        file.seek(io::SeekFrom::Start(0)).await.unwrap();
        file.write_all(b"b").await.unwrap();
        assert_eq!(file.data.get_ref(), b"log:ab");

        let mut read_only = offline_file(b"x", false, false);
        assert!(read_only.write_all(b"y").await.is_err());
        assert!(!read_only.dirty);
        read_only.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_uninitialized() {
        let driver = S3Driver::new();
        let err = driver
            .stat(&RequestContext::background(), "/")
            .await
            .unwrap_err();
        assert!(matches!(err, FileHubError::NotInitialized));
    }
}
