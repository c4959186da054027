//! 本地分片存储驱动
//!
//! Content-addressed store under a local directory. It implements every
//! transfer transport itself, so the CLI and tests can exercise rapid upload,
//! part renewal and chunked reads without a network vendor.

pub mod driver;
pub mod store;
pub mod types;

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::storage::{DriverFactory, StorageDriver};

pub use driver::LocalChunkedDriver;
pub use store::ChunkStore;
pub use types::LocalChunkedOptions;

pub struct LocalChunkedDriverFactory;

impl DriverFactory for LocalChunkedDriverFactory {
    fn driver_type(&self) -> &'static str {
        "local_chunked"
    }

    fn create_driver(&self, config: Value) -> Result<Box<dyn StorageDriver>> {
        let options: LocalChunkedOptions = serde_json::from_value(config)
            .map_err(|e| anyhow!("Invalid local_chunked config: {}", e))?;
        let transfer = options.transfer_config().map_err(|e| anyhow!(e))?;

        // 同步初始化（工厂方法是同步的）
        let store = ChunkStore::open(&options)?;
        tracing::info!("Local chunked driver initialized, root: {:?}", options.root);

        Ok(Box::new(LocalChunkedDriver::new(
            store,
            transfer,
            options.download_chunk_size,
        )))
    }
}
