use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use anyhow::{anyhow, Result};
use serde_json::Value;

use super::{Lister, StorageDriver};

pub type DriverBox = Arc<dyn StorageDriver>;

/// Driver factory trait / 驱动工厂 trait
pub trait DriverFactory: Send + Sync {
    /// Registry key / 驱动类型名称
    fn driver_type(&self) -> &'static str;

    /// 创建驱动实例
    fn create_driver(&self, config: Value) -> Result<Box<dyn StorageDriver>>;
}

/// Name-keyed registry of driver factories and live instances / 存储管理器
#[derive(Clone, Default)]
pub struct StorageManager {
    drivers: Arc<RwLock<HashMap<String, DriverBox>>>,
    factories: Arc<RwLock<HashMap<String, Arc<dyn DriverFactory>>>>,
}

impl StorageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register driver factory / 注册驱动工厂
    pub async fn register_factory(&self, factory: Box<dyn DriverFactory>) -> Result<()> {
        let driver_type = factory.driver_type().to_string();
        let mut factories = self.factories.write().await;
        if factories.contains_key(&driver_type) {
            return Err(anyhow!("Driver type already registered: {}", driver_type));
        }
        factories.insert(driver_type.clone(), Arc::from(factory));

        tracing::info!("Driver factory registered: {}", driver_type);
        Ok(())
    }

    /// Create a driver instance under `name` / 创建驱动实例
    ///
    /// The instance is verified by listing its root and only registered when
    /// that succeeds. An existing instance with the same name is replaced.
    pub async fn create_driver(&self, name: &str, driver_type: &str, config: Value) -> Result<DriverBox> {
        let factory = self
            .factories
            .read()
            .await
            .get(driver_type)
            .cloned()
            .ok_or_else(|| anyhow!("Driver type not found: {}", driver_type))?;

        let driver: DriverBox = Arc::from(factory.create_driver(config).map_err(|e| {
            tracing::error!("Driver creation failed: {} ({}) - {}", name, driver_type, e);
            e
        })?);

        if let Err(e) = driver.list("/").await {
            tracing::warn!("Driver verification failed: {} ({}) - {}", name, driver_type, e);
            return Err(e.context(format!("Driver {} failed verification", name)));
        }

        self.drivers.write().await.insert(name.to_string(), driver.clone());
        tracing::info!("Driver created and verified: {} ({})", name, driver_type);
        Ok(driver)
    }

    /// Get driver instance / 获取驱动实例
    pub async fn get_driver(&self, name: &str) -> Option<DriverBox> {
        self.drivers.read().await.get(name).cloned()
    }

    /// Remove driver instance / 移除驱动实例
    pub async fn remove_driver(&self, name: &str) -> Result<()> {
        self.drivers
            .write()
            .await
            .remove(name)
            .ok_or_else(|| anyhow!("Driver not found: {}", name))?;

        tracing::info!("Driver removed: {}", name);
        Ok(())
    }

    /// Instance names, sorted / 列出所有驱动实例
    pub async fn list_drivers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered driver types, sorted / 列出所有可用的驱动类型
    pub async fn list_driver_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().await.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Capability, Entry, Link, Linker};
    use async_trait::async_trait;
    use std::ops::Range;

    struct Fixed {
        tag: String,
        healthy: bool,
    }

    #[async_trait]
    impl Lister for Fixed {
        async fn list(&self, _path: &str) -> Result<Vec<Entry>> {
            if self.healthy {
                Ok(vec![])
            } else {
                Err(anyhow!("token expired"))
            }
        }
    }

    #[async_trait]
    impl Linker for Fixed {
        async fn link(&self, path: &str, _range: Option<Range<u64>>) -> Result<Link> {
            Ok(Link::Url {
                url: format!("{}{}", self.tag, path),
                headers: HashMap::new(),
            })
        }
    }

    impl StorageDriver for Fixed {
        fn name(&self) -> &str {
            &self.tag
        }

        fn version(&self) -> &str {
            "1.0.0"
        }

        fn capabilities(&self) -> Capability {
            Capability::default()
        }
    }

    struct FixedFactory;

    impl DriverFactory for FixedFactory {
        fn driver_type(&self) -> &'static str {
            "fixed"
        }

        fn create_driver(&self, config: Value) -> Result<Box<dyn StorageDriver>> {
            let tag = config
                .get("tag")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("missing tag"))?;
            Ok(Box::new(Fixed {
                tag: tag.to_string(),
                healthy: config.get("healthy").and_then(|v| v.as_bool()).unwrap_or(true),
            }))
        }
    }

    async fn manager() -> StorageManager {
        let m = StorageManager::new();
        m.register_factory(Box::new(FixedFactory)).await.unwrap();
        m
    }

    #[tokio::test]
    async fn test_register_twice_rejected() {
        let m = manager().await;
        assert!(m.register_factory(Box::new(FixedFactory)).await.is_err());
        assert_eq!(m.list_driver_types().await, vec!["fixed"]);
    }

    #[tokio::test]
    async fn test_instances_keyed_by_name() {
        let m = manager().await;
        m.create_driver("media", "fixed", serde_json::json!({"tag": "m1"})).await.unwrap();
        m.create_driver("backup", "fixed", serde_json::json!({"tag": "b1"})).await.unwrap();
        assert_eq!(m.list_drivers().await, vec!["backup", "media"]);
        assert_eq!(m.get_driver("media").await.unwrap().name(), "m1");

        m.create_driver("media", "fixed", serde_json::json!({"tag": "m2"})).await.unwrap();
        assert_eq!(m.get_driver("media").await.unwrap().name(), "m2");

        m.remove_driver("media").await.unwrap();
        assert!(m.get_driver("media").await.is_none());
        assert!(m.remove_driver("media").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_verification_not_registered() {
        let m = manager().await;
        let err = m
            .create_driver("sick", "fixed", serde_json::json!({"tag": "s", "healthy": false}))
            .await
            .err().unwrap();
        assert!(format!("{:#}", err).contains("token expired"));
        assert!(m.get_driver("sick").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_type_and_bad_config() {
        let m = manager().await;
        assert!(m.create_driver("x", "nope", Value::Null).await.is_err());
        let err = m.create_driver("x", "fixed", serde_json::json!({})).await.err().unwrap();
        assert_eq!(err.to_string(), "missing tag");
        assert!(m.list_drivers().await.is_empty());
    }
}
