// Driver package / 驱动包
pub mod http;
pub mod http_chunked;
pub mod local;

use crate::storage::StorageManager;

/// Register all drivers to StorageManager / 注册所有驱动
pub async fn register_all(manager: &StorageManager) -> anyhow::Result<()> {
    // Register local chunk store driver / 注册本地分片存储驱动
    manager.register_factory(Box::new(local::LocalChunkedDriverFactory)).await?;
    // Register HTTP part object driver / 注册 HTTP 分片对象存储驱动
    manager.register_factory(Box::new(http_chunked::HttpChunkedDriverFactory)).await?;
    Ok(())
}
