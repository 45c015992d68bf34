//! Cookie 持久化 - 基础设施层
//!
//! 按会话 ID 保存 Cookie，进程重启后可以免登录

use crate::error::{AppError, AppResult};
use crate::infrastructure::session::CookieJar;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;
use tracing::debug;

/// Cookie 存储
#[async_trait]
pub trait CookieStore: Send + Sync {
    /// 读取某个会话保存的 Cookie，不存在时返回 None
    async fn load(&self, session_id: usize) -> AppResult<Option<CookieJar>>;

    /// 保存某个会话的 Cookie
    async fn save(&self, session_id: usize, cookies: &CookieJar) -> AppResult<()>;
}

/// 基于 JSON 文件的 Cookie 存储，每个会话一个文件
pub struct FileCookieStore {
    dir: PathBuf,
}

impl FileCookieStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, session_id: usize) -> PathBuf {
        self.dir.join(format!("session_{}.json", session_id))
    }
}

#[async_trait]
impl CookieStore for FileCookieStore {
    async fn load(&self, session_id: usize) -> AppResult<Option<CookieJar>> {
        let path = self.path_for(session_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| AppError::file_read_failed(path.display().to_string(), e))?;
        let jar: CookieJar = serde_json::from_str(&content)?;

        debug!("[会话 {}] 从 {} 读取 {} 个 Cookie", session_id, path.display(), jar.len());
        Ok(Some(jar))
    }

    async fn save(&self, session_id: usize, cookies: &CookieJar) -> AppResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AppError::file_write_failed(self.dir.display().to_string(), e))?;

        let path = self.path_for(session_id);
        let content = serde_json::to_string_pretty(cookies)?;
        fs::write(&path, content)
            .await
            .map_err(|e| AppError::file_write_failed(path.display().to_string(), e))?;

        debug!("[会话 {}] Cookie 已保存到 {}", session_id, path.display());
        Ok(())
    }
}

/// 内存中的 Cookie 存储
#[derive(Default)]
pub struct MemoryCookieStore {
    jars: Mutex<HashMap<usize, CookieJar>>,
}

impl MemoryCookieStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CookieStore for MemoryCookieStore {
    async fn load(&self, session_id: usize) -> AppResult<Option<CookieJar>> {
        let jars = self.jars.lock().map_err(|e| AppError::Other(e.to_string()))?;
        Ok(jars.get(&session_id).cloned())
    }

    async fn save(&self, session_id: usize, cookies: &CookieJar) -> AppResult<()> {
        let mut jars = self.jars.lock().map_err(|e| AppError::Other(e.to_string()))?;
        jars.insert(session_id, cookies.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCookieStore::new(dir.path().join("cookies"));

        assert!(store.load(3).await.unwrap().is_none());

        let mut jar = CookieJar::new();
        jar.insert("PHPSESSID", "xyz");
        store.save(3, &jar).await.unwrap();

        assert_eq!(store.load(3).await.unwrap(), Some(jar));
        assert!(store.load(4).await.unwrap().is_none());
    }

    #[test]
    fn test_memory_store_overwrites() {
        let store = MemoryCookieStore::new();
        let mut first = CookieJar::new();
        first.insert("sid", "a");
        let mut second = CookieJar::new();
        second.insert("sid", "b");

        tokio_test::block_on(async {
            tokio_test::assert_ok!(store.save(1, &first).await);
            tokio_test::assert_ok!(store.save(1, &second).await);
            assert_eq!(store.load(1).await.unwrap(), Some(second));
        });
    }
}
