use bytes::Bytes;
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use yaolist_transfer::storage::{DriverBox, Link, Linker, Lister, StorageManager};
use yaolist_transfer::transfer::{HashAlgorithm, UploadSource};
use yaolist_transfer::TransferError;

fn content(n: usize) -> Vec<u8> {
    (0..n).map(|i| ((i as u32).wrapping_mul(2_654_435_761) >> 7) as u8).collect()
}

async fn mount(root: &TempDir, extra: serde_json::Value) -> DriverBox {
    let manager = StorageManager::new();
    yaolist_transfer::register_storage_drivers(&manager).await.unwrap();

    let mut config = serde_json::json!({
        "root": root.path(),
        "chunk_size": 64 * 1024,
        "concurrency": 4,
        "transfer": { "retry_delay_ms": 1, "retry_backoff": false }
    });
    if let (Some(obj), Some(extra)) = (config.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    let driver = manager.create_driver("local", "local_chunked", config).await.unwrap();
    assert_eq!(manager.list_drivers().await, vec!["local"]);
    driver
}

async fn read_all(driver: &DriverBox, path: &str) -> Result<Vec<u8>, TransferError> {
    let object = driver.as_downloader().unwrap().remote_object(path).await.unwrap();
    let reader = object.open(0, CancellationToken::new());
    let data = reader.read_to_end().await?;
    reader.close().await?;
    Ok(data)
}

#[tokio::test]
async fn test_put_list_get_and_rapid_reupload() {
    let root = TempDir::new().unwrap();
    let driver = mount(&root, serde_json::json!({})).await;
    let uploader = driver.as_uploader().unwrap();
    let data = content(300 * 1024 + 17);

    let local = root.path().join("upload.bin");
    tokio::fs::write(&local, &data).await.unwrap();
    let first = uploader
        .put_chunked("/in/a.bin", UploadSource::open(&local).await.unwrap(), None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!first.rapid);
    assert_eq!(first.remote_id, "/in/a.bin");
    assert_eq!(first.uploaded_bytes, data.len() as u64);

    let listed = driver.list("/in").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].size, data.len() as u64);
    assert_eq!(read_all(&driver, "/in/a.bin").await.unwrap(), data);

    // Same bytes from a non-seekable stream: rapid, no part sent / 秒传
    let stream = UploadSource::from_reader(Box::new(Cursor::new(data.clone())), data.len() as u64);
    let second = uploader
        .put_chunked("/in/b.bin", stream, None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(second.rapid);
    assert_eq!(second.uploaded_bytes, 0);
    assert_eq!(read_all(&driver, "/in/b.bin").await.unwrap(), data);
}

#[tokio::test]
async fn test_ranged_link_and_obfuscated_chunks() {
    let root = TempDir::new().unwrap();
    let driver = mount(&root, serde_json::json!({ "download_chunk_size": 1000, "obfuscate_key": 90 })).await;
    let data = content(10_000);
    driver
        .as_uploader()
        .unwrap()
        .put_chunked("/r.bin", UploadSource::from_bytes(Bytes::from(data.clone())), None, &CancellationToken::new())
        .await
        .unwrap();

    let Link::Reader(mut reader) = driver.link("/r.bin", Some(2500..7100)).await.unwrap() else {
        panic!("local store always proxies");
    };
    let mut got = Vec::new();
    reader.read_to_end(&mut got).await.unwrap();
    assert_eq!(got, &data[2500..7100]);

    assert_eq!(read_all(&driver, "/r.bin").await.unwrap(), data);
}

#[tokio::test]
async fn test_corrupted_blob_detected_on_full_read_only() {
    let root = TempDir::new().unwrap();
    let driver = mount(&root, serde_json::json!({ "download_chunk_size": 4096 })).await;
    let data = content(20_000);
    driver
        .as_uploader()
        .unwrap()
        .put_chunked("/c.bin", UploadSource::from_bytes(Bytes::from(data.clone())), None, &CancellationToken::new())
        .await
        .unwrap();

    let blob = root.path().join("objects").join(HashAlgorithm::Sha1.digest_hex(&data));
    let mut raw = tokio::fs::read(&blob).await.unwrap();
    raw[10_000] ^= 0x01;
    tokio::fs::write(&blob, raw).await.unwrap();

    let err = read_all(&driver, "/c.bin").await.unwrap_err();
    assert!(matches!(err, TransferError::IntegrityMismatch { .. }));

    let object = driver.as_downloader().unwrap().remote_object("/c.bin").await.unwrap();
    let range = object.open_range(9_000, Some(2_000), CancellationToken::new());
    assert_eq!(range.read_to_end().await.unwrap().len(), 2_000);
    range.close().await.unwrap();
}

#[tokio::test]
async fn test_lazy_targets_with_progress() {
    let root = TempDir::new().unwrap();
    let driver = mount(&root, serde_json::json!({ "lazy_targets": true, "rapid_upload": false })).await;
    let data = content(200 * 1024);

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    let outcome = driver
        .as_uploader()
        .unwrap()
        .put_chunked(
            "/lazy.bin",
            UploadSource::from_bytes(Bytes::from(data.clone())),
            Some(Arc::new(move |done, total| seen_cb.lock().push((done, total)))),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(!outcome.rapid);
    let seen = seen.lock();
    assert_eq!(seen.len(), 4);
    assert_eq!(seen.iter().map(|(d, _)| *d).max(), Some(data.len() as u64));
    assert_eq!(read_all(&driver, "/lazy.bin").await.unwrap(), data);
}

#[tokio::test]
async fn test_expired_targets_exhaust_renewals() {
    let root = TempDir::new().unwrap();
    let driver = mount(&root, serde_json::json!({ "target_ttl_secs": 0, "rapid_upload": false })).await;
    let err = driver
        .as_uploader()
        .unwrap()
        .put_chunked("/x.bin", UploadSource::from_bytes(Bytes::from(content(1000))), None, &CancellationToken::new())
        .await
        .unwrap_err();
    let err = err.downcast::<TransferError>().unwrap();
    assert!(matches!(err, TransferError::SessionExpired(_)));
    assert!(driver.list("/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_put_leaves_nothing_visible() {
    let root = TempDir::new().unwrap();
    let driver = mount(&root, serde_json::json!({})).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = driver
        .as_uploader()
        .unwrap()
        .put_chunked("/gone.bin", UploadSource::from_bytes(Bytes::from(content(500_000))), None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err.downcast::<TransferError>().unwrap(), TransferError::Cancelled));
    assert!(driver.list("/").await.unwrap().is_empty());
}
