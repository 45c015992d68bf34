//! 应用主流程 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，按固定顺序推进各个阶段：
//!
//! 1. **建立会话池**：并发登录，一个可用会话都没有则终止
//! 2. **预热验证码缓存**：缓存饥饿则终止
//! 3. **扫描名单**：一个目标都没有则终止
//! 4. **过滤目标**
//! 5. **派发**：收到停止信号（Ctrl-C 或缓存饥饿）时尽快收尾
//! 6. **汇总报告**：输出统计并写入日志文件
//!
//! 终止原因记录在 [`RunSummary::fatal`] 中，不会被当作正常结束。
//! 任何阶段收到停止信号都会放弃当前阶段，记为 [`RunSummary::interrupted`]。

use crate::clients::{Credentials, GameClient, RocWebClient};
use crate::config::Config;
use crate::error::AppResult;
use crate::infrastructure::{CookieStore, FileCookieStore};
use crate::orchestrator::dispatcher::{DispatchReport, DispatchSettings, Dispatcher, TargetState};
use crate::orchestrator::roster_scanner::{RosterScanner, ScanReport, ScanSettings};
use crate::services::{
    build_solver, BrowserImport, CacheRefiller, CaptchaCache, CaptchaSolver, LoginOptions,
    SessionCaptchaProvider, SessionLogin, SessionPool, TargetFilter,
};
use crate::utils::logging;
use crate::workflow::DispatchFlow;
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// 阶段总数
const TOTAL_PHASES: usize = 5;

/// 缓存预热的最长等待
const WARM_UP_TIMEOUT: Duration = Duration::from_secs(180);

/// 导致运行终止的原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalCause {
    #[error("没有任何会话登录成功")]
    NoSessions,

    #[error("无法确定名单页数: {0}")]
    PageRangeUnknown(String),

    #[error("扫描没有得到任何目标")]
    NoTargets,

    #[error("验证码缓存饥饿: 连续 {failures} 次获取失败")]
    CacheStarved { failures: usize },
}

/// 阶段耗时
#[derive(Debug, Clone)]
pub struct PhaseTiming {
    pub name: &'static str,
    pub elapsed: Duration,
}

/// 一次运行的汇总
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub started_at: DateTime<Local>,
    pub phases: Vec<PhaseTiming>,
    pub sessions_requested: usize,
    pub sessions_live: usize,
    /// 未启用缓存时为 None
    pub cache_warmed: Option<bool>,
    pub scan: Option<ScanReport>,
    pub filtered_out: usize,
    pub dispatch: Option<DispatchReport>,
    pub fatal: Option<FatalCause>,
    /// 收到停止信号，提前结束
    pub interrupted: bool,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            started_at: Local::now(),
            phases: Vec::new(),
            sessions_requested: 0,
            sessions_live: 0,
            cache_warmed: None,
            scan: None,
            filtered_out: 0,
            dispatch: None,
            fatal: None,
            interrupted: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.fatal.is_none()
    }

    /// 渲染为写入日志文件的文本
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", "=".repeat(60));
        let _ = writeln!(
            out,
            "运行汇总 - 开始于 {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S")
        );
        let _ = writeln!(out, "{}", "=".repeat(60));
        for phase in &self.phases {
            let _ = writeln!(
                out,
                "阶段 {:<8} {:>8.1} 秒",
                phase.name,
                phase.elapsed.as_secs_f64()
            );
        }
        let _ = writeln!(
            out,
            "会话: {}/{}",
            self.sessions_live, self.sessions_requested
        );
        if let Some(warmed) = self.cache_warmed {
            let _ = writeln!(out, "验证码缓存预热: {}", if warmed { "完成" } else { "未完成" });
        }
        if let Some(scan) = &self.scan {
            let _ = writeln!(
                out,
                "扫描: {} 个目标, {} 页成功, 失败页 {:?}, 放弃 {} 块",
                scan.targets.len(),
                scan.pages_scanned,
                scan.failed_pages,
                scan.chunks_abandoned
            );
        }
        let _ = writeln!(out, "过滤掉: {}", self.filtered_out);
        if let Some(dispatch) = &self.dispatch {
            let s = &dispatch.stats;
            let _ = writeln!(
                out,
                "派发: 尝试 {} | 成功 {} | 失败 {} | 验证码错误 {} | 管理员 {} | 上限 {} | 错误 {}",
                s.attempts,
                s.successes,
                s.failures,
                s.wrong_captcha,
                s.admin_detected,
                s.limit_reached,
                s.errors
            );
            let _ = writeln!(
                out,
                "目标: 完成 {} | 放弃 {}{}",
                s.completed,
                s.abandoned,
                if dispatch.interrupted { " | 已中断" } else { "" }
            );
            for (target, state) in &dispatch.targets {
                let _ = writeln!(out, "  {} {:?}", target, state);
            }
        }
        match &self.fatal {
            Some(cause) => {
                let _ = writeln!(out, "结果: 终止 - {}", cause);
            }
            None if self.interrupted => {
                let _ = writeln!(out, "结果: 已中断");
            }
            None => {
                let _ = writeln!(out, "结果: 正常结束");
            }
        }
        let _ = writeln!(out, "{}", "=".repeat(60));
        out
    }
}

/// 应用主结构
pub struct App {
    config: Config,
    game: Arc<dyn GameClient>,
    cookies: Arc<dyn CookieStore>,
    solver: Arc<dyn CaptchaSolver>,
    filter: TargetFilter,
    stop: Arc<watch::Sender<bool>>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> AppResult<Self> {
        // 初始化日志文件
        logging::init_log_file(&config.output_log_file)?;

        logging::log_startup(&config);

        let game: Arc<dyn GameClient> = Arc::new(RocWebClient::new(
            &config.base_url,
            Credentials {
                email: config.email.clone(),
                password: config.password.clone(),
            },
        ));
        let cookies: Arc<dyn CookieStore> = Arc::new(FileCookieStore::new(&config.cookie_dir));
        let solver = build_solver(&config)?;
        let filter = TargetFilter::from_config(&config);

        Ok(Self::with_components(config, game, cookies, solver).with_filter(filter))
    }

    /// 使用指定组件创建
    pub fn with_components(
        config: Config,
        game: Arc<dyn GameClient>,
        cookies: Arc<dyn CookieStore>,
        solver: Arc<dyn CaptchaSolver>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            game,
            cookies,
            solver,
            filter: TargetFilter::allow_all(),
            stop: Arc::new(stop),
        }
    }

    pub fn with_filter(mut self, filter: TargetFilter) -> Self {
        self.filter = filter;
        self
    }

    /// 请求停止（Ctrl-C）
    pub fn request_stop(&self) {
        if !self.stop.send_replace(true) {
            warn!("⚠️ 收到停止信号，等待进行中的行动结束...");
        }
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> RunSummary {
        let mut summary = RunSummary::new();
        summary.fatal = self.run_phases(&mut summary).await.err();

        if let Some(cause) = &summary.fatal {
            error!("❌ 运行终止: {}", cause);
        }
        self.print_final_stats(&summary);
        if let Err(e) = logging::append_log_file(&self.config.output_log_file, &summary.render()) {
            warn!("写入日志文件失败: {}", e);
        }
        summary
    }

    async fn run_phases(&self, summary: &mut RunSummary) -> Result<(), FatalCause> {
        // ========== 阶段 1: 会话池 ==========
        let started = Self::phase_start(1, "建立会话池");
        let login = Arc::new(SessionLogin::new(
            self.game.clone(),
            self.cookies.clone(),
            self.login_options(),
        ));
        let Some(pool) = self
            .unless_stopped(SessionPool::build(self.config.session_count, login))
            .await
        else {
            return Self::interrupt(summary, "会话池");
        };
        let pool = Arc::new(pool);
        summary.sessions_requested = pool.requested();
        summary.sessions_live = pool.len();
        Self::phase_done(summary, "会话池", started);
        if pool.is_empty() {
            return Err(FatalCause::NoSessions);
        }

        // ========== 阶段 2: 验证码缓存 ==========
        let started = Self::phase_start(2, "预热验证码缓存");
        let cache = self.start_cache(&pool, summary).await;
        Self::phase_done(summary, "缓存", started);

        if self.stop_requested() {
            if let Some((cache, _)) = &cache {
                cache.close();
            }
            return Self::interrupt(summary, "缓存预热");
        }
        if let Some((_, refiller)) = &cache {
            if refiller.is_starved() {
                return Err(FatalCause::CacheStarved {
                    failures: refiller.consecutive_failures(),
                });
            }
            self.watch_starvation(refiller);
        }

        let result = self.scan_and_dispatch(&pool, cache.as_ref(), summary).await;

        if let Some((cache, refiller)) = &cache {
            cache.close();
            // 派发途中饥饿同样是终止
            if refiller.is_starved() {
                return Err(FatalCause::CacheStarved {
                    failures: refiller.consecutive_failures(),
                });
            }
        }
        result
    }

    async fn scan_and_dispatch(
        &self,
        pool: &Arc<SessionPool>,
        cache: Option<&(CaptchaCache, Arc<CacheRefiller>)>,
        summary: &mut RunSummary,
    ) -> Result<(), FatalCause> {
        // ========== 阶段 3: 扫描 ==========
        let started = Self::phase_start(3, "扫描名单");
        let scanner = RosterScanner::new(
            pool.clone(),
            self.game.clone(),
            ScanSettings {
                workers: self.config.scan_workers,
                chunk_size: self.config.scan_chunk_size,
                ..ScanSettings::default()
            },
        );
        let (first, last) = match self.config.page_range() {
            Some(range) => range,
            None => {
                let first = self.config.first_page;
                let Some(detected) = self.unless_stopped(scanner.detect_last_page(first)).await
                else {
                    return Self::interrupt(summary, "扫描");
                };
                let last = detected.map_err(|e| FatalCause::PageRangeUnknown(e.to_string()))?;
                info!("📄 自动检测到名单共 {} 页", last);
                (first, last)
            }
        };
        let Some(report) = self.unless_stopped(scanner.scan(first, last)).await else {
            return Self::interrupt(summary, "扫描");
        };
        let targets = report.targets.clone();
        summary.scan = Some(report);
        Self::phase_done(summary, "扫描", started);
        if targets.is_empty() {
            return Err(FatalCause::NoTargets);
        }

        // ========== 阶段 4: 过滤 ==========
        let started = Self::phase_start(4, "过滤目标");
        let (targets, skipped) = self.filter.apply(targets);
        summary.filtered_out = skipped;
        info!("✓ 保留 {} 个目标，过滤掉 {} 个", targets.len(), skipped);
        Self::phase_done(summary, "过滤", started);
        if targets.is_empty() {
            warn!("⚠️ 过滤后没有目标，跳过派发");
            return Ok(());
        }

        if self.stop_requested() {
            return Self::interrupt(summary, "过滤");
        }

        // ========== 阶段 5: 派发 ==========
        let started = Self::phase_start(5, "派发");
        let mut flow = DispatchFlow::new(pool.clone(), self.game.clone(), self.solver.clone());
        if let Some((cache, refiller)) = cache {
            flow = flow.with_cache(
                cache.clone(),
                Some(refiller.clone()),
                Duration::from_secs(self.config.captcha_wait_secs),
            );
        }
        let dispatcher = Dispatcher::new(flow, self.dispatch_settings());
        let report = dispatcher.dispatch(targets, self.stop.subscribe()).await;
        summary.interrupted = report.interrupted;
        summary.dispatch = Some(report);
        Self::phase_done(summary, "派发", started);

        Ok(())
    }

    /// 创建缓存和补充器并预热，未启用缓存时返回 None
    async fn start_cache(
        &self,
        pool: &Arc<SessionPool>,
        summary: &mut RunSummary,
    ) -> Option<(CaptchaCache, Arc<CacheRefiller>)> {
        if self.config.cache_size == 0 {
            info!("验证码缓存未启用，派发时现取验证码");
            return None;
        }

        let cache = CaptchaCache::new();
        let provider = Arc::new(SessionCaptchaProvider::new(
            pool.clone(),
            self.game.clone(),
            Some(self.solver.clone()),
        ));
        let refiller = CacheRefiller::start(
            cache.clone(),
            provider,
            self.config.cache_size,
            self.config.cache_max_failures,
        );
        let warmed = self.unless_stopped(refiller.warm_up(WARM_UP_TIMEOUT)).await;
        summary.cache_warmed = Some(warmed.unwrap_or(false));
        Some((cache, refiller))
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// 执行一个阶段，收到停止信号时放弃它并返回 None
    async fn unless_stopped<T>(&self, phase: impl Future<Output = T>) -> Option<T> {
        let mut stop = self.stop.subscribe();
        tokio::select! {
            biased;
            // 发送端由 App 持有，只有收到 true 才会走这个分支
            true = async move { stop.wait_for(|s| *s).await.is_ok() } => None,
            out = phase => Some(out),
        }
    }

    fn interrupt(summary: &mut RunSummary, phase: &str) -> Result<(), FatalCause> {
        warn!("⚠️ {}阶段收到停止信号，提前结束", phase);
        summary.interrupted = true;
        Ok(())
    }

    /// 缓存饥饿时发出停止信号
    fn watch_starvation(&self, refiller: &Arc<CacheRefiller>) {
        let mut starved = refiller.starved_signal();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            if starved.wait_for(|s| *s).await.is_ok() {
                error!("❌ 验证码缓存饥饿，停止派发");
                stop.send_replace(true);
            }
        });
    }

    fn login_options(&self) -> LoginOptions {
        LoginOptions {
            retries: self.config.login_retries.max(1),
            browser_import: self.config.import_browser_cookies.then(|| BrowserImport {
                port: self.config.browser_debug_port,
                base_url: self.config.base_url.clone(),
            }),
            ..LoginOptions::default()
        }
    }

    fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            workers: self.config.dispatch_workers,
            action_cap: self.config.action_cap,
            max_errors: self.config.max_target_errors,
            max_wrong_captcha: self.config.max_wrong_captcha,
        }
    }

    fn phase_start(index: usize, name: &str) -> Instant {
        logging::log_phase_start(index, TOTAL_PHASES, name);
        Instant::now()
    }

    fn phase_done(summary: &mut RunSummary, name: &'static str, started: Instant) {
        let elapsed = started.elapsed();
        logging::log_phase_complete(name, elapsed.as_secs_f64());
        summary.phases.push(PhaseTiming { name, elapsed });
    }

    fn print_final_stats(&self, summary: &RunSummary) {
        info!("\n{}", "=".repeat(60));
        info!("📊 运行统计");
        info!(
            "完成时间: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        info!("{}", "=".repeat(60));
        info!(
            "🔐 会话: {}/{}",
            summary.sessions_live, summary.sessions_requested
        );
        if let Some(scan) = &summary.scan {
            info!(
                "🔍 扫描: {} 个目标 ({} 页失败)",
                scan.targets.len(),
                scan.failed_pages.len()
            );
        }
        if let Some(dispatch) = &summary.dispatch {
            let completed = dispatch
                .targets
                .iter()
                .filter(|(_, s)| *s == TargetState::Completed)
                .count();
            info!("✅ 完成: {}/{}", completed, dispatch.targets.len());
            info!("❌ 放弃: {}", dispatch.stats.abandoned);
            info!(
                "🎯 行动: 成功 {} | 失败 {} | 验证码错误 {}",
                dispatch.stats.successes, dispatch.stats.failures, dispatch.stats.wrong_captcha
            );
        }
        match &summary.fatal {
            Some(cause) => info!("💥 结果: 终止 - {}", cause),
            None if summary.interrupted => info!("⏹️ 结果: 已中断"),
            None => info!("🏁 结果: 正常结束"),
        }
        info!("{}", "=".repeat(60));
        info!("\n日志已保存至: {}", self.config.output_log_file);
    }
}
