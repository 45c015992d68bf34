//! 派发流程 - 流程层
//!
//! 核心职责：定义"对一个目标行动一次"的完整流程
//!
//! 流程顺序：
//! 1. 取验证码（缓存优先，否则用会话现取）并求解
//! 2. 借出会话提交行动
//! 3. 把服务器回复归类为 [`DispatchResult`]
//! 4. 向打码服务反馈答案对错

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clients::GameClient;
use crate::error::{AppResult, SessionError};
use crate::models::{ActionOutcome, Captcha, DispatchResult};
use crate::services::solvers::{report_captcha, solve_captcha};
use crate::services::{CacheRefiller, CaptchaCache, CaptchaSolver, SessionLease, SessionPool};
use crate::utils::truncate_text;
use crate::workflow::dispatch_ctx::DispatchCtx;

/// 派发流程
///
/// - 编排单次行动
/// - 不决定目标何时完成（由派发器根据结果计数）
/// - 只依赖业务能力（services）
pub struct DispatchFlow {
    pool: Arc<SessionPool>,
    game: Arc<dyn GameClient>,
    solver: Arc<dyn CaptchaSolver>,
    cache: Option<CaptchaCache>,
    refiller: Option<Arc<CacheRefiller>>,
    captcha_wait: Duration,
    session_wait: Duration,
}

impl DispatchFlow {
    pub fn new(
        pool: Arc<SessionPool>,
        game: Arc<dyn GameClient>,
        solver: Arc<dyn CaptchaSolver>,
    ) -> Self {
        Self {
            pool,
            game,
            solver,
            cache: None,
            refiller: None,
            captcha_wait: Duration::from_secs(20),
            session_wait: Duration::from_secs(60),
        }
    }

    /// 使用验证码缓存
    pub fn with_cache(
        mut self,
        cache: CaptchaCache,
        refiller: Option<Arc<CacheRefiller>>,
        captcha_wait: Duration,
    ) -> Self {
        self.cache = Some(cache);
        self.refiller = refiller;
        self.captcha_wait = captcha_wait;
        self
    }

    pub fn with_session_wait(mut self, wait: Duration) -> Self {
        self.session_wait = wait;
        self
    }

    /// 对目标行动一次
    pub async fn run(&self, ctx: &DispatchCtx) -> DispatchResult {
        match self.try_run(ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!("{} ⚠️ 行动出错: {}", ctx, e);
                DispatchResult::Error(e.to_string())
            }
        }
    }

    async fn try_run(&self, ctx: &DispatchCtx) -> AppResult<DispatchResult> {
        // 缓存中的验证码在借会话之前取，避免占着会话等缓存
        let cached = self.take_cached(ctx).await;

        let mut session = self
            .pool
            .acquire_wait(self.session_wait)
            .await
            .ok_or(SessionError::PoolExhausted)?;

        let mut captcha = match cached {
            Some(captcha) => captcha,
            None => self.fetch_fresh(ctx, &mut session).await?,
        };

        let submitted = captcha.kind().needs_answer().then_some(&captcha);
        let page = self
            .game
            .submit_action(&mut session, &ctx.target, submitted)
            .await?;
        debug!(
            "{} {} 服务器回复: {}",
            ctx,
            &*session,
            truncate_text(&page.message, 80)
        );

        let result = match page.outcome {
            ActionOutcome::Success => DispatchResult::Success,
            ActionOutcome::Failure => DispatchResult::Failure,
            ActionOutcome::WrongCaptcha => DispatchResult::WrongCaptcha,
            ActionOutcome::AdminDetected => DispatchResult::AdminDetected,
            ActionOutcome::ActionLimitReached => DispatchResult::ActionLimitReached,
            ActionOutcome::LoggedOut => {
                let relogged = self.pool.relogin(&mut session).await;
                DispatchResult::Error(if relogged {
                    "会话已登出，已重新登录".to_string()
                } else {
                    "会话已登出且无法重新登录".to_string()
                })
            }
            ActionOutcome::Unknown => {
                DispatchResult::Error(format!(
                    "无法识别的回复: {}",
                    truncate_text(&page.message, 120)
                ))
            }
        };
        drop(session);

        match &result {
            DispatchResult::WrongCaptcha => {
                report_captcha(self.solver.as_ref(), &mut captcha, false).await
            }
            DispatchResult::Error(_) => {}
            _ => report_captcha(self.solver.as_ref(), &mut captcha, true).await,
        }

        info!("{} → {}", ctx, result);
        Ok(result)
    }

    /// 从缓存取一个可用的验证码
    ///
    /// 缓存为空但正在补充时等待一段时间；取到的验证码在这里求解
    async fn take_cached(&self, ctx: &DispatchCtx) -> Option<Captcha> {
        let cache = self.cache.as_ref()?;

        let mut captcha = match cache.pop_oldest_valid() {
            Some(captcha) => captcha,
            None => {
                let refilling = self
                    .refiller
                    .as_ref()
                    .map(|r| !r.is_starved())
                    .unwrap_or(false);
                if !refilling {
                    return None;
                }
                debug!("{} 缓存为空，等待补充...", ctx);
                cache.pop_oldest_valid_wait(self.captcha_wait).await?
            }
        };

        if let Err(e) = solve_captcha(self.solver.as_ref(), &mut captcha).await {
            warn!("{} 缓存中的 {} 求解失败: {}", ctx, captcha, e);
            return None;
        }
        if captcha.is_expired() {
            debug!("{} {} 求解后已过期", ctx, captcha);
            return None;
        }
        Some(captcha)
    }

    async fn fetch_fresh(
        &self,
        ctx: &DispatchCtx,
        session: &mut SessionLease,
    ) -> AppResult<Captcha> {
        let mut captcha = self.game.fetch_captcha(session).await?;
        solve_captcha(self.solver.as_ref(), &mut captcha).await?;
        debug!("{} 现取 {}", ctx, captcha);
        Ok(captcha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fake::FakeGame;
    use crate::infrastructure::{LoginState, MemoryCookieStore, Session};
    use crate::models::{CaptchaKind, Target};
    use crate::services::session_pool::{LoginOptions, SessionLogin};
    use crate::services::solvers::ManualSolver;
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;

    fn flow_with(game: Arc<FakeGame>, sessions: usize) -> (DispatchFlow, Arc<SessionPool>) {
        let login = Arc::new(SessionLogin::new(
            game.clone(),
            Arc::new(MemoryCookieStore::new()),
            LoginOptions {
                retries: 1,
                retry_delay: Duration::from_millis(1),
                browser_import: None,
            },
        ));
        let live = (1..=sessions)
            .map(|id| {
                let mut s = Session::new(id).unwrap();
                s.set_state(LoginState::LoggedIn);
                s
            })
            .collect();
        let pool = Arc::new(SessionPool::from_sessions(live, login, sessions));
        let solver: Arc<dyn CaptchaSolver> = Arc::new(ManualSolver::new("unused.png"));
        let flow = DispatchFlow::new(pool.clone(), game, solver)
            .with_session_wait(Duration::from_millis(50));
        (flow, pool)
    }

    fn ctx() -> DispatchCtx {
        let mut ctx = DispatchCtx::new(1, Target::new(42, 1, "victim"));
        ctx.next_attempt();
        ctx
    }

    #[tokio::test]
    async fn test_outcomes_are_classified() {
        let game = Arc::new(FakeGame {
            outcomes: std::sync::Mutex::new(VecDeque::from([
                ActionOutcome::Success,
                ActionOutcome::WrongCaptcha,
                ActionOutcome::AdminDetected,
                ActionOutcome::Unknown,
            ])),
            ..FakeGame::default()
        });
        let (flow, _pool) = flow_with(game.clone(), 1);

        assert_eq!(flow.run(&ctx()).await, DispatchResult::Success);
        assert_eq!(flow.run(&ctx()).await, DispatchResult::WrongCaptcha);
        assert_eq!(flow.run(&ctx()).await, DispatchResult::AdminDetected);
        assert!(matches!(flow.run(&ctx()).await, DispatchResult::Error(_)));
        assert_eq!(game.actions_on(42), 4);
    }

    #[tokio::test]
    async fn test_cached_captcha_used_before_fresh_fetch() {
        let game = Arc::new(FakeGame::default());
        let (flow, _pool) = flow_with(game.clone(), 1);
        let cache = CaptchaCache::new();
        cache.add(Captcha::new("cached", CaptchaKind::Equation, Some(b"1+1".to_vec())));
        let flow = flow.with_cache(cache.clone(), None, Duration::from_millis(10));

        assert_eq!(flow.run(&ctx()).await, DispatchResult::Success);
        assert_eq!(game.captcha_calls.load(Ordering::SeqCst), 0);

        // 缓存空了，现取
        assert_eq!(flow.run(&ctx()).await, DispatchResult::Success);
        assert_eq!(game.captcha_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_logged_out_session_relogs_or_leaves_pool() {
        let game = Arc::new(FakeGame {
            failing_logins: std::collections::HashSet::from([1]),
            default_outcome: Some(ActionOutcome::LoggedOut),
            ..FakeGame::default()
        });
        let (flow, pool) = flow_with(game, 1);

        assert!(matches!(flow.run(&ctx()).await, DispatchResult::Error(_)));
        assert!(pool.is_empty());
        // 池子空了之后直接报错
        assert!(matches!(flow.run(&ctx()).await, DispatchResult::Error(_)));
    }
}
