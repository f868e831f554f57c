//! 存储位置注册表
//!
//! 内存缓存 + DuckDB 持久化。写操作在写锁内先落库再更新缓存，
//! 读操作每次返回一份新的拷贝，调用方不长期持有密码。

use crate::database::{Credential, Database, Location};
use crate::{Result, ResticError};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct LocationRegistry {
    database: Database,
    cache: Arc<RwLock<HashMap<String, Location>>>,
}

impl LocationRegistry {
    /// 从数据库加载全部存储位置
    pub async fn load(database: Database) -> Result<Self> {
        let locations = database.list_locations().await?;
        info!("已加载 {} 个存储位置", locations.len());

        let cache = locations
            .into_iter()
            .map(|location| (location.id.clone(), location))
            .collect();

        Ok(Self {
            database,
            cache: Arc::new(RwLock::new(cache)),
        })
    }

    /// 由仓库路径推导存储位置ID（取最后一级目录名）
    pub fn derive_location_id(repository_path: &str) -> Result<String> {
        let trimmed = repository_path.trim().trim_end_matches(['/', '\\']);
        Path::new(trimmed)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                ResticError::invalid_input(format!("无法从路径推导存储位置ID: {repository_path}"))
            })
    }

    /// 获取存储位置
    pub async fn get(&self, id: &str) -> Result<Location> {
        self.cache
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ResticError::LocationNotFound(id.to_string()))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.cache.read().await.contains_key(id)
    }

    /// 获取全部存储位置，按ID排序
    pub async fn list(&self) -> Vec<Location> {
        let mut locations: Vec<_> = self.cache.read().await.values().cloned().collect();
        locations.sort_by(|a, b| a.id.cmp(&b.id));
        locations
    }

    /// 注册新的存储位置
    pub async fn register(
        &self,
        id: &str,
        repository_path: &str,
        credential: Credential,
    ) -> Result<Location> {
        let mut cache = self.cache.write().await;
        if cache.contains_key(id) {
            return Err(ResticError::LocationExists(id.to_string()));
        }

        let location = Location {
            id: id.to_string(),
            repository_path: repository_path.to_string(),
            credential,
            known_paths: Vec::new(),
            created_at: Utc::now(),
        };
        self.database.insert_location(&location).await?;
        cache.insert(id.to_string(), location.clone());

        info!(location_id = %id, repository_path = %repository_path, "存储位置已注册");
        Ok(location)
    }

    /// 记录一个新出现的备份路径，已存在时不做任何事。返回是否新增
    pub async fn learn_path(&self, id: &str, path: &str) -> Result<bool> {
        let mut cache = self.cache.write().await;
        let location = cache
            .get_mut(id)
            .ok_or_else(|| ResticError::LocationNotFound(id.to_string()))?;

        if location.known_paths.iter().any(|known| known == path) {
            return Ok(false);
        }

        let mut known_paths = location.known_paths.clone();
        known_paths.push(path.to_string());
        self.database.update_known_paths(id, &known_paths).await?;
        location.known_paths = known_paths;

        debug!(location_id = %id, path = %path, "记录新的备份路径");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> LocationRegistry {
        let db = Database::connect_memory().await.unwrap();
        LocationRegistry::load(db).await.unwrap()
    }

    #[test]
    fn test_derive_location_id() {
        assert_eq!(
            LocationRegistry::derive_location_id("/mnt/backups/photos/").unwrap(),
            "photos"
        );
        assert_eq!(
            LocationRegistry::derive_location_id("/mnt/backups/photos").unwrap(),
            "photos"
        );
        assert!(LocationRegistry::derive_location_id("/").is_err());
        assert!(LocationRegistry::derive_location_id("").is_err());
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = registry().await;
        registry
            .register("photos", "/mnt/photos", Credential::new("pw"))
            .await
            .unwrap();

        let location = registry.get("photos").await.unwrap();
        assert_eq!(location.repository_path, "/mnt/photos");
        assert!(location.known_paths.is_empty());

        let again = registry
            .register("photos", "/other/photos", Credential::new("pw"))
            .await;
        assert!(matches!(again, Err(ResticError::LocationExists(_))));

        assert!(matches!(
            registry.get("missing").await,
            Err(ResticError::LocationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_learn_path_is_persisted_once() {
        let db = Database::connect_memory().await.unwrap();
        let registry = LocationRegistry::load(db.clone()).await.unwrap();
        registry
            .register("photos", "/mnt/photos", Credential::new("pw"))
            .await
            .unwrap();

        assert!(registry.learn_path("photos", "/home/me").await.unwrap());
        assert!(!registry.learn_path("photos", "/home/me").await.unwrap());
        assert!(registry.learn_path("photos", "/etc").await.unwrap());

        // 重新加载后数据仍在
        let reloaded = LocationRegistry::load(db).await.unwrap();
        let location = reloaded.get("photos").await.unwrap();
        assert_eq!(location.known_paths, vec!["/home/me", "/etc"]);
    }

    #[tokio::test]
    async fn test_concurrent_learn_path() {
        let registry = registry().await;
        registry
            .register("photos", "/mnt/photos", Credential::new("pw"))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.learn_path("photos", &format!("/data/{}", i % 4)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let location = registry.get("photos").await.unwrap();
        assert_eq!(location.known_paths.len(), 4);
    }
}
