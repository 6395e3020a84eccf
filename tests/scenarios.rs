//! End-to-end scenarios over a local source, driven through the hub

use std::io::Cursor;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::io::AsyncReadExt;

use filehub::config::Config;
use filehub::context::RequestContext;
use filehub::driver::StorageDriver;
use filehub::error::{Action, FileHubError};
use filehub::hub::FileHub;

fn hub_for(root: &TempDir, extra: &str) -> FileHub {
    let yaml = format!(
        r#"
sources:
  - id: 1
    key: test
    type: local
    config:
      root_path: '{}'
users:
  - id: 1
    username: admin
    role: admin
  - id: 2
    username: bob
  - id: 3
    username: carol
{}
"#,
        root.path().display(),
        extra
    );
    let config = Config::from_str(&yaml).unwrap();
    config.validate().unwrap();
    FileHub::from_config(&config)
}

async fn put(driver: &Arc<dyn StorageDriver>, ctx: &RequestContext, path: &str, data: &[u8]) -> filehub::Result<u64> {
    let mut reader = Cursor::new(data.to_vec());
    driver.create(ctx, path, &mut reader, Some(data.len() as u64)).await
}

async fn read_all(driver: &Arc<dyn StorageDriver>, ctx: &RequestContext, path: &str) -> filehub::Result<Vec<u8>> {
    let mut stream = driver.open(ctx, path).await?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[tokio::test]
async fn admin_writes_and_unprivileged_user_is_denied() {
    let root = TempDir::new().unwrap();
    let hub = hub_for(&root, "");

    let admin = hub.login("admin").await.unwrap();
    let driver = hub.driver(&admin, "test").await.unwrap();
    assert_eq!(put(&driver, &admin, "hello.txt", b"hi").await.unwrap(), 2);

    let entries = driver.list(&admin, "/").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "hello.txt");
    assert_eq!(entries[0].size, 2);
    assert!(!entries[0].is_dir);

    let bob = hub.login("bob").await.unwrap();
    let driver = hub.driver(&bob, "test").await.unwrap();
    let err = driver.list(&bob, "/").await.unwrap_err();
    assert!(err.is_access_denied());
    assert_eq!(err.http_status(), 403);

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn read_only_root_with_writable_subtree() {
    let root = TempDir::new().unwrap();
    let hub = hub_for(
        &root,
        r#"
permissions:
  - user: bob
    source: test
    prefix: /
    read: true
  - user: bob
    source: test
    prefix: /work
    read: true
    write: true
"#,
    );

    let admin = hub.login("admin").await.unwrap();
    let driver = hub.driver(&admin, "test").await.unwrap();
    put(&driver, &admin, "/other.txt", b"shared").await.unwrap();
    driver.mkdir(&admin, "/work").await.unwrap();

    let bob = hub.login("bob").await.unwrap();
    put(&driver, &bob, "/work/a.txt", b"mine").await.unwrap();

    match put(&driver, &bob, "/other.txt", b"overwrite").await {
        Err(FileHubError::PermissionDenied { path, action }) => {
            assert_eq!(path, "/other.txt");
            assert_eq!(action, Action::Write);
        }
        other => panic!("expected permission denied, got {:?}", other),
    }

    assert_eq!(read_all(&driver, &bob, "/other.txt").await.unwrap(), b"shared");
    assert_eq!(read_all(&driver, &bob, "/work/a.txt").await.unwrap(), b"mine");
}

#[tokio::test]
async fn dotdot_cannot_leave_the_writable_subtree() {
    let root = TempDir::new().unwrap();
    let hub = hub_for(
        &root,
        r#"
permissions:
  - user: bob
    source: test
    prefix: /
    read: true
  - user: bob
    source: test
    prefix: /work
    read: true
    write: true
"#,
    );

    let admin = hub.login("admin").await.unwrap();
    let driver = hub.driver(&admin, "test").await.unwrap();
    put(&driver, &admin, "/other.txt", b"shared").await.unwrap();
    driver.mkdir(&admin, "/work").await.unwrap();

    let bob = hub.login("bob").await.unwrap();
    let err = put(&driver, &bob, "/work/../other.txt", b"owned").await.unwrap_err();
    assert!(matches!(err, FileHubError::PermissionDenied { ref path, .. } if path == "/other.txt"));

    let err = driver.delete(&bob, "/work/../other.txt").await.unwrap_err();
    assert!(err.is_access_denied());

    let err = driver
        .rename(&bob, "/work/../other.txt", "/work/stolen.txt")
        .await
        .unwrap_err();
    assert!(err.is_access_denied());

    assert_eq!(read_all(&driver, &bob, "/other.txt").await.unwrap(), b"shared");
    assert!(root.path().join("other.txt").exists());

    // Segments that stay inside the subtree still work
    put(&driver, &bob, "/work/tmp/../b.txt", b"ok").await.unwrap();
    assert_eq!(read_all(&driver, &bob, "/work/b.txt").await.unwrap(), b"ok");
}

#[tokio::test]
async fn round_trip_reports_size() {
    let root = TempDir::new().unwrap();
    let hub = hub_for(&root, "");
    let admin = hub.login("admin").await.unwrap();
    let driver = hub.driver(&admin, "test").await.unwrap();

    let content: Vec<u8> = (0..=255u8).cycle().take(64 * 1024 + 17).collect();
    put(&driver, &admin, "/nested/dir/blob.bin", &content).await.unwrap();

    assert_eq!(read_all(&driver, &admin, "/nested/dir/blob.bin").await.unwrap(), content);
    let info = driver.stat(&admin, "/nested/dir/blob.bin").await.unwrap();
    assert_eq!(info.size, content.len() as u64);
    assert_eq!(info.name, "blob.bin");
}

#[tokio::test]
async fn rename_needs_write_on_both_ends() {
    let root = TempDir::new().unwrap();
    let hub = hub_for(
        &root,
        r#"
permissions:
  - user: carol
    source: test
    prefix: /inbox
    read: true
    write: true
"#,
    );

    let admin = hub.login("admin").await.unwrap();
    let driver = hub.driver(&admin, "test").await.unwrap();
    put(&driver, &admin, "/inbox/report.txt", b"q3").await.unwrap();

    let carol = hub.login("carol").await.unwrap();
    let err = driver
        .rename(&carol, "/inbox/report.txt", "/archive/report.txt")
        .await
        .unwrap_err();
    assert!(matches!(err, FileHubError::PermissionDenied { ref path, .. } if path == "/archive/report.txt"));
    assert!(driver.stat(&admin, "/inbox/report.txt").await.is_ok());

    driver
        .rename(&carol, "/inbox/report.txt", "/inbox/final.txt")
        .await
        .unwrap();
    assert_eq!(read_all(&driver, &carol, "/inbox/final.txt").await.unwrap(), b"q3");
}

#[tokio::test]
async fn traversal_is_refused_even_for_admin() {
    let root = TempDir::new().unwrap();
    let hub = hub_for(&root, "");
    let admin = hub.login("admin").await.unwrap();
    let driver = hub.driver(&admin, "test").await.unwrap();

    for path in ["../escape.txt", "/a/../../escape.txt"] {
        let err = put(&driver, &admin, path, b"x").await.unwrap_err();
        assert!(matches!(err, FileHubError::AccessDenied(_)), "{}", path);
    }
    assert!(!root.path().parent().unwrap().join("escape.txt").exists());
}

#[tokio::test]
async fn webdav_view_shares_the_cached_driver() {
    let root = TempDir::new().unwrap();
    let hub = hub_for(&root, "");
    let admin = hub.login("admin").await.unwrap();

    let path = filehub::dav::DavBridge::strip_prefix("/webdav/test/docs", "test").unwrap();
    let fs = hub.dav().filesystem(&admin, "test").await.unwrap();
    fs.mkdir(&admin, &path).await.unwrap();

    let driver = hub.driver(&admin, "test").await.unwrap();
    assert!(driver.stat(&admin, "/docs").await.unwrap().is_dir);
    assert_eq!(hub.drivers().len(), 1);
}
