//! 会话池 - 业务能力层
//!
//! ## 职责
//!
//! - 并发建立 N 个会话并登录
//! - 登录顺序：持久化 Cookie → 浏览器导入 → 账号密码登录（有限重试）
//! - 登录彻底失败的会话被排除，池子随之缩小
//! - 借出会话（非阻塞轮询），同一时间一个会话只借给一个调用方

use crate::browser::import_browser_cookies;
use crate::clients::GameClient;
use crate::infrastructure::{CookieJar, CookieStore, LoginState, Session};
use rand::Rng;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// 从浏览器导入 Cookie 的参数
#[derive(Debug, Clone)]
pub struct BrowserImport {
    pub port: u16,
    pub base_url: String,
}

/// 登录参数
#[derive(Debug, Clone)]
pub struct LoginOptions {
    /// 账号密码登录的最大尝试次数
    pub retries: usize,
    pub retry_delay: Duration,
    pub browser_import: Option<BrowserImport>,
}

impl Default for LoginOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_secs(2),
            browser_import: None,
        }
    }
}

/// 会话登录服务
///
/// 职责：
/// - 让一个会话进入已登录状态
/// - 登录成功后持久化 Cookie
pub struct SessionLogin {
    game: Arc<dyn GameClient>,
    cookies: Arc<dyn CookieStore>,
    options: LoginOptions,
}

impl SessionLogin {
    pub fn new(
        game: Arc<dyn GameClient>,
        cookies: Arc<dyn CookieStore>,
        options: LoginOptions,
    ) -> Self {
        Self {
            game,
            cookies,
            options,
        }
    }

    /// 确保会话已登录
    ///
    /// # 返回
    /// 所有途径都失败时返回 false，此时会话处于 LoggedOut
    pub async fn ensure_logged_in(&self, session: &mut Session) -> bool {
        if session.is_logged_in() {
            return true;
        }
        session.set_state(LoginState::LoggingIn);

        // 1. 持久化的 Cookie
        match self.cookies.load(session.id()).await {
            Ok(Some(jar)) if !jar.is_empty() => {
                if self.try_cookies(session, jar, "已保存的 Cookie").await {
                    return true;
                }
            }
            Ok(_) => debug!("{} 没有已保存的 Cookie", session),
            Err(e) => warn!("{} 读取已保存的 Cookie 失败: {}", session, e),
        }

        // 2. 浏览器导入
        if let Some(import) = &self.options.browser_import {
            match import_browser_cookies(import.port, &import.base_url).await {
                Ok(jar) if !jar.is_empty() => {
                    if self.try_cookies(session, jar, "浏览器 Cookie").await {
                        return true;
                    }
                }
                Ok(_) => debug!("{} 浏览器中没有游戏 Cookie", session),
                Err(e) => warn!("{} 浏览器 Cookie 导入失败: {}", session, e),
            }
        }

        // 3. 账号密码登录
        for attempt in 1..=self.options.retries {
            match self.game.login(session).await {
                Ok(true) => {
                    info!("✓ {} 登录成功 (第 {} 次尝试)", session, attempt);
                    self.mark_logged_in(session).await;
                    return true;
                }
                Ok(false) => warn!(
                    "{} 登录被拒绝 (尝试 {}/{})",
                    session, attempt, self.options.retries
                ),
                Err(e) => warn!(
                    "{} 登录请求失败 (尝试 {}/{}): {}",
                    session, attempt, self.options.retries, e
                ),
            }
            if attempt < self.options.retries {
                sleep(self.backoff(attempt)).await;
            }
        }

        error!(
            "✗ {} 登录失败，已尝试 {} 次",
            session, self.options.retries
        );
        session.set_state(LoginState::LoggedOut);
        false
    }

    /// 线性退避加随机抖动，避免多个会话同时重试
    fn backoff(&self, attempt: usize) -> Duration {
        let base = self.options.retry_delay * attempt as u32;
        let max_jitter = self.options.retry_delay.as_millis() as u64;
        let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter);
        base + Duration::from_millis(jitter_ms)
    }

    async fn try_cookies(&self, session: &mut Session, jar: CookieJar, source: &str) -> bool {
        session.replace_cookies(jar);
        match self.game.check_login(session).await {
            Ok(true) => {
                info!("✓ {} 使用{}登录成功", session, source);
                self.mark_logged_in(session).await;
                true
            }
            Ok(false) => {
                debug!("{} {}已失效", session, source);
                session.replace_cookies(CookieJar::new());
                false
            }
            Err(e) => {
                warn!("{} 检查{}时出错: {}", session, source, e);
                false
            }
        }
    }

    async fn mark_logged_in(&self, session: &mut Session) {
        session.set_state(LoginState::LoggedIn);
        if let Err(e) = self.cookies.save(session.id(), session.cookies()).await {
            warn!("{} 保存 Cookie 失败: {}", session, e);
        }
    }
}

#[derive(Clone)]
struct PooledSession {
    id: usize,
    session: Arc<Mutex<Session>>,
}

/// 归还信号，在会话锁释放之后触发
struct ReleaseSignal(Arc<Notify>);

impl Drop for ReleaseSignal {
    fn drop(&mut self) {
        self.0.notify_one();
    }
}

/// 借出的会话，离开作用域时归还
pub struct SessionLease {
    // 字段按声明顺序析构：先释放锁，再唤醒等待者
    guard: OwnedMutexGuard<Session>,
    _signal: ReleaseSignal,
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.guard
    }
}

impl DerefMut for SessionLease {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.guard
    }
}

/// 会话池
pub struct SessionPool {
    sessions: RwLock<Arc<Vec<PooledSession>>>,
    cursor: AtomicUsize,
    released: Arc<Notify>,
    login: Arc<SessionLogin>,
    requested: usize,
}

impl SessionPool {
    /// 并发建立并登录 `count` 个会话，登录失败的不会进入池子
    pub async fn build(count: usize, login: Arc<SessionLogin>) -> Self {
        info!("🔐 正在建立 {} 个会话...", count);

        let mut handles = Vec::with_capacity(count);
        for id in 1..=count {
            let login = login.clone();
            handles.push(tokio::spawn(async move {
                let mut session = match Session::new(id) {
                    Ok(session) => session,
                    Err(e) => {
                        error!("[会话 {}] 创建失败: {}", id, e);
                        return None;
                    }
                };
                login
                    .ensure_logged_in(&mut session)
                    .await
                    .then_some(session)
            }));
        }

        let mut live = Vec::with_capacity(count);
        for handle in handles {
            match handle.await {
                Ok(Some(session)) => live.push(session),
                Ok(None) => {}
                Err(e) => error!("登录任务异常: {}", e),
            }
        }
        live.sort_by_key(Session::id);

        info!("✓ 会话池就绪: {}/{} 个会话可用", live.len(), count);
        Self::from_sessions(live, login, count)
    }

    /// 用已经登录的会话组成池子
    pub fn from_sessions(
        sessions: Vec<Session>,
        login: Arc<SessionLogin>,
        requested: usize,
    ) -> Self {
        let sessions = sessions
            .into_iter()
            .map(|s| PooledSession {
                id: s.id(),
                session: Arc::new(Mutex::new(s)),
            })
            .collect();
        Self {
            sessions: RwLock::new(Arc::new(sessions)),
            cursor: AtomicUsize::new(0),
            released: Arc::new(Notify::new()),
            login,
            requested,
        }
    }

    fn snapshot(&self) -> Arc<Vec<PooledSession>> {
        self.sessions
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// 非阻塞地借出一个空闲会话，从轮询位置开始依次尝试
    pub fn acquire(&self) -> Option<SessionLease> {
        let sessions = self.snapshot();
        let n = sessions.len();
        if n == 0 {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        (0..n).find_map(|k| {
            sessions[(start + k) % n]
                .session
                .clone()
                .try_lock_owned()
                .ok()
                .map(|guard| SessionLease {
                    guard,
                    _signal: ReleaseSignal(self.released.clone()),
                })
        })
    }

    /// 借出会话，全部被占用时最多等待 `wait`
    ///
    /// 池子为空或超时返回 None
    pub async fn acquire_wait(&self, wait: Duration) -> Option<SessionLease> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(lease) = self.acquire() {
                return Some(lease);
            }
            if self.is_empty() {
                return None;
            }
            if timeout_at(deadline, self.released.notified()).await.is_err() {
                return self.acquire();
            }
        }
    }

    /// 服务器提示已登出时重新登录，失败则把会话移出池子
    pub async fn relogin(&self, lease: &mut SessionLease) -> bool {
        lease.set_state(LoginState::LoggedOut);
        warn!("{} 已登出，尝试重新登录", &**lease);
        let ok = self.login.ensure_logged_in(lease).await;
        if !ok {
            self.exclude(lease.id());
        }
        ok
    }

    /// 把会话移出池子
    pub fn exclude(&self, session_id: usize) -> bool {
        let removed = {
            let mut sessions = match self.sessions.write() {
                Ok(sessions) => sessions,
                Err(poisoned) => poisoned.into_inner(),
            };
            let before = sessions.len();
            let remaining: Vec<PooledSession> = sessions
                .iter()
                .filter(|s| s.id != session_id)
                .cloned()
                .collect();
            let removed = remaining.len() < before;
            *sessions = Arc::new(remaining);
            removed
        };

        if removed {
            warn!(
                "[会话 {}] 已从池中移除，剩余 {} 个",
                session_id,
                self.len()
            );
            // 让等待者重新检查池子是否已空
            self.released.notify_waiters();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 最初请求的会话数
    pub fn requested(&self) -> usize {
        self.requested
    }
}
