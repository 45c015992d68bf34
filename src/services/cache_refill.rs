//! 验证码缓存补充
//!
//! ## 职责
//!
//! - 监听缓存事件，数量低于目标时补充
//! - 同一时间最多一个补充任务
//! - 连续失败达到上限时发出"缓存饥饿"信号，由编排层终止运行

use crate::clients::GameClient;
use crate::error::{AppResult, SessionError};
use crate::models::Captcha;
use crate::services::captcha_cache::{CacheEvent, CaptchaCache};
use crate::services::session_pool::SessionPool;
use crate::services::solvers::{solve_captcha, CaptchaSolver};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// 等待空闲会话的时长
const SESSION_WAIT: Duration = Duration::from_secs(30);

/// 验证码来源
#[async_trait]
pub trait CaptchaProvider: Send + Sync {
    /// 获取一个新的验证码
    async fn provide(&self) -> AppResult<Captcha>;
}

/// 借用会话池中的会话获取验证码
///
/// 配置了打码服务时预先求解，取出即可提交
pub struct SessionCaptchaProvider {
    pool: Arc<SessionPool>,
    game: Arc<dyn GameClient>,
    solver: Option<Arc<dyn CaptchaSolver>>,
}

impl SessionCaptchaProvider {
    pub fn new(
        pool: Arc<SessionPool>,
        game: Arc<dyn GameClient>,
        solver: Option<Arc<dyn CaptchaSolver>>,
    ) -> Self {
        Self { pool, game, solver }
    }
}

#[async_trait]
impl CaptchaProvider for SessionCaptchaProvider {
    async fn provide(&self) -> AppResult<Captcha> {
        let mut session = self
            .pool
            .acquire_wait(SESSION_WAIT)
            .await
            .ok_or(SessionError::PoolExhausted)?;
        let mut captcha = self.game.fetch_captcha(&mut session).await?;
        drop(session);

        if let Some(solver) = &self.solver {
            solve_captcha(solver.as_ref(), &mut captcha).await?;
        }
        Ok(captcha)
    }
}

/// 缓存补充器
pub struct CacheRefiller {
    cache: CaptchaCache,
    provider: Arc<dyn CaptchaProvider>,
    target_size: usize,
    max_failures: usize,
    retry_delay: Duration,
    in_flight: AtomicBool,
    cycles: AtomicUsize,
    consecutive_failures: AtomicUsize,
    starved: watch::Sender<bool>,
}

impl CacheRefiller {
    /// 创建补充器并订阅缓存事件
    ///
    /// # 参数
    /// - `target_size`: 缓存目标数量
    /// - `max_failures`: 连续失败多少次判定为饥饿
    pub fn start(
        cache: CaptchaCache,
        provider: Arc<dyn CaptchaProvider>,
        target_size: usize,
        max_failures: usize,
    ) -> Arc<Self> {
        Self::with_retry_delay(
            cache,
            provider,
            target_size,
            max_failures,
            Duration::from_secs(1),
        )
    }

    pub fn with_retry_delay(
        cache: CaptchaCache,
        provider: Arc<dyn CaptchaProvider>,
        target_size: usize,
        max_failures: usize,
        retry_delay: Duration,
    ) -> Arc<Self> {
        let (starved, _) = watch::channel(false);
        let refiller = Arc::new(Self {
            cache: cache.clone(),
            provider,
            target_size,
            max_failures: max_failures.max(1),
            retry_delay,
            in_flight: AtomicBool::new(false),
            cycles: AtomicUsize::new(0),
            consecutive_failures: AtomicUsize::new(0),
            starved,
        });

        let weak = Arc::downgrade(&refiller);
        cache.subscribe(move |event| {
            if !matches!(event, CacheEvent::Removed | CacheEvent::Empty) {
                return;
            }
            if let Some(refiller) = weak.upgrade() {
                if refiller.is_below_target() {
                    refiller.trigger();
                }
            }
        });
        refiller
    }

    /// 启动一次补充，已有补充在进行或已饥饿时返回 false
    pub fn trigger(self: &Arc<Self>) -> bool {
        if self.is_starved() || !self.try_claim() {
            return false;
        }
        let this = self.clone();
        tokio::spawn(async move { this.run().await });
        true
    }

    /// 触发补充并等待缓存填满
    ///
    /// # 返回
    /// 在 `wait` 内填满返回 true；饥饿或超时返回 false
    pub async fn warm_up(self: &Arc<Self>, wait: Duration) -> bool {
        info!("🧩 预热验证码缓存 (目标 {} 个)...", self.target_size);
        self.trigger();

        let mut starved = self.starved_signal();
        let filled = timeout(wait, async {
            loop {
                if !self.is_below_target() {
                    return true;
                }
                if *starved.borrow() {
                    return false;
                }
                tokio::select! {
                    changed = starved.changed() => {
                        if changed.is_err() {
                            return false;
                        }
                    }
                    _ = sleep(Duration::from_millis(100)) => {}
                }
            }
        })
        .await
        .unwrap_or(false);

        if filled {
            info!("✓ 验证码缓存已就绪: {} 个", self.cache.len());
        } else {
            warn!("⚠️ 验证码缓存未能填满: {}/{}", self.cache.len(), self.target_size);
        }
        filled
    }

    /// 饥饿信号
    pub fn starved_signal(&self) -> watch::Receiver<bool> {
        self.starved.subscribe()
    }

    pub fn is_starved(&self) -> bool {
        *self.starved.borrow()
    }

    /// 已执行的补充轮数
    pub fn cycles(&self) -> usize {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn is_refilling(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn try_claim(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_below_target(&self) -> bool {
        self.cache.len() < self.target_size
    }

    async fn run(self: Arc<Self>) {
        loop {
            let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("第 {} 轮缓存补充开始", cycle);
            self.fill().await;
            self.in_flight.store(false, Ordering::Release);

            // 释放标记后复查水位，避免错过补充期间发生的取出
            if self.is_starved() || !self.is_below_target() || !self.try_claim() {
                break;
            }
        }
    }

    async fn fill(&self) {
        while self.is_below_target() && !self.cache.is_closed() {
            match self.provider.provide().await {
                Ok(captcha) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    if !self.cache.add(captcha) {
                        debug!("补充的验证码已过期，丢弃");
                    }
                }
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(
                        "获取验证码失败 ({}/{}): {}",
                        failures, self.max_failures, e
                    );
                    if failures >= self.max_failures {
                        error!(
                            "❌ 验证码缓存饥饿：连续 {} 次获取失败",
                            failures
                        );
                        self.starved.send_replace(true);
                        return;
                    }
                    sleep(self.retry_delay * failures as u32).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fake::FakeGame;
    use crate::error::CaptchaError;
    use crate::infrastructure::{LoginState, MemoryCookieStore, Session};
    use crate::models::CaptchaKind;
    use crate::services::session_pool::{LoginOptions, SessionLogin};

    /// 计数的验证码来源
    #[derive(Default)]
    struct CountingProvider {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        always_fail: bool,
    }

    #[async_trait]
    impl CaptchaProvider for CountingProvider {
        async fn provide(&self) -> AppResult<Captcha> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.always_fail {
                return Err(CaptchaError::NotPresent.into());
            }
            Ok(Captcha::new(format!("p{}", n), CaptchaKind::Image, None))
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_to_target_without_overlap() {
        let cache = CaptchaCache::new();
        let provider = Arc::new(CountingProvider::default());
        let refiller = CacheRefiller::start(cache.clone(), provider.clone(), 3, 5);

        assert!(refiller.warm_up(Duration::from_secs(10)).await);
        assert_eq!(cache.len(), 3);

        // 连续取出，补充期间再取也不会出现第二个补充任务
        for _ in 0..3 {
            assert!(cache.pop_oldest_valid().is_some());
            assert!(!refiller.trigger() || refiller.is_refilling());
            settle().await;
        }
        sleep(Duration::from_secs(1)).await;

        assert_eq!(cache.len(), 3);
        assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_is_single_flight() {
        let cache = CaptchaCache::new();
        let provider = Arc::new(CountingProvider::default());
        let refiller = CacheRefiller::start(cache.clone(), provider.clone(), 2, 5);

        assert!(refiller.trigger());
        assert!(!refiller.trigger());
        assert!(!refiller.trigger());

        sleep(Duration::from_secs(1)).await;
        assert_eq!(cache.len(), 2);
        assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_signal_starvation() {
        let cache = CaptchaCache::new();
        let provider = Arc::new(CountingProvider {
            always_fail: true,
            ..CountingProvider::default()
        });
        let refiller = CacheRefiller::with_retry_delay(
            cache.clone(),
            provider.clone(),
            3,
            4,
            Duration::from_millis(10),
        );
        let mut starved = refiller.starved_signal();

        assert!(!refiller.warm_up(Duration::from_secs(60)).await);
        starved.wait_for(|s| *s).await.unwrap();

        assert!(refiller.is_starved());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
        assert!(!refiller.trigger());
        assert_eq!(refiller.consecutive_failures(), 4);
    }

    #[tokio::test]
    async fn test_session_provider_presolves_equations() {
        let game = Arc::new(FakeGame::default());
        let login = Arc::new(SessionLogin::new(
            game.clone(),
            Arc::new(MemoryCookieStore::new()),
            LoginOptions::default(),
        ));
        let mut session = Session::new(1).unwrap();
        session.set_state(LoginState::LoggedIn);
        let pool = Arc::new(SessionPool::from_sessions(vec![session], login, 1));

        let solver: Arc<dyn CaptchaSolver> = Arc::new(crate::services::solvers::ManualSolver::new(
            std::env::temp_dir().join("unused.png").to_string_lossy(),
        ));
        let provider = SessionCaptchaProvider::new(pool, game, Some(solver));

        let captcha = provider.provide().await.unwrap();
        assert_eq!(captcha.kind(), CaptchaKind::Equation);
        assert_eq!(captcha.answer(), Some("7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_provider_recovers_from_transient_failures() {
        let game = Arc::new(FakeGame {
            captcha_failures: AtomicUsize::new(2),
            captcha_delay: Some(Duration::from_millis(5)),
            ..FakeGame::default()
        });
        let login = Arc::new(SessionLogin::new(
            game.clone(),
            Arc::new(MemoryCookieStore::new()),
            LoginOptions::default(),
        ));
        let sessions = (1..=2)
            .map(|id| {
                let mut s = Session::new(id).unwrap();
                s.set_state(LoginState::LoggedIn);
                s
            })
            .collect();
        let pool = Arc::new(SessionPool::from_sessions(sessions, login, 2));
        let provider = Arc::new(SessionCaptchaProvider::new(pool, game.clone(), None));

        let cache = CaptchaCache::new();
        let refiller = CacheRefiller::with_retry_delay(
            cache.clone(),
            provider,
            3,
            5,
            Duration::from_millis(10),
        );

        assert!(refiller.warm_up(Duration::from_secs(10)).await);
        assert_eq!(cache.len(), 3);
        assert!(!refiller.is_starved());
        assert_eq!(refiller.consecutive_failures(), 0);
        // 两次失败 + 三次成功，始终只有一个请求在进行
        assert_eq!(game.captcha_calls.load(Ordering::SeqCst), 5);
        assert_eq!(game.captcha_max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(game.captcha_in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_session_provider_surfaces_fetch_failure() {
        let game = Arc::new(FakeGame {
            captcha_failures: AtomicUsize::new(usize::MAX),
            ..FakeGame::default()
        });
        let login = Arc::new(SessionLogin::new(
            game.clone(),
            Arc::new(MemoryCookieStore::new()),
            LoginOptions::default(),
        ));
        let mut session = Session::new(1).unwrap();
        session.set_state(LoginState::LoggedIn);
        let pool = Arc::new(SessionPool::from_sessions(vec![session], login, 1));
        let provider = SessionCaptchaProvider::new(pool, game.clone(), None);

        for _ in 0..3 {
            assert!(provider.provide().await.is_err());
        }
        assert_eq!(game.captcha_calls.load(Ordering::SeqCst), 3);
    }
}
