//! 派发器 - 编排层
//!
//! ## 职责
//!
//! 多个工人从共享队列取目标，对每个目标反复执行 [`DispatchFlow`]，
//! 根据结果推进目标状态：
//!
//! ```text
//! Pending → InProgress → Completed
//!                      ↘ Abandoned
//! ```
//!
//! ## 计数规则
//!
//! | 结果 | 处理 |
//! |------|------|
//! | Success / Failure | 计入行动上限，达到上限即完成 |
//! | WrongCaptcha | 不计入上限，累计过多则放弃 |
//! | AdminDetected / ActionLimitReached | 立即完成 |
//! | Error | 计入连续错误，达到上限则放弃 |
//!
//! 同一个目标可能被多个工人拿到，每次尝试前都在目标锁内复查完成状态，
//! 已完成的目标不会再有任何行动。

use crate::models::{DispatchResult, Target};
use crate::workflow::{DispatchCtx, DispatchFlow};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{error, info, warn};

/// 派发参数
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub workers: usize,
    /// 每个目标的行动上限
    pub action_cap: u32,
    /// 连续错误上限
    pub max_errors: u32,
    /// 验证码答错上限
    pub max_wrong_captcha: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            action_cap: 10,
            max_errors: 3,
            max_wrong_captcha: 5,
        }
    }
}

/// 目标状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetState {
    #[default]
    Pending,
    InProgress,
    Completed,
    Abandoned,
}

impl TargetState {
    pub fn is_finished(self) -> bool {
        matches!(self, TargetState::Completed | TargetState::Abandoned)
    }
}

/// 单个目标的进度，所有工人共享
#[derive(Debug, Default)]
struct TargetProgress {
    state: TargetState,
    actions: u32,
    consecutive_errors: u32,
    wrong_captchas: u32,
}

/// 已完成目标登记表
///
/// 每个目标一把异步锁，同一目标的尝试串行执行
#[derive(Default)]
pub struct CompletionRegistry {
    completed: Mutex<HashSet<u64>>,
    progress: Mutex<HashMap<u64, Arc<AsyncMutex<TargetProgress>>>>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_completed(&self, target_id: u64) -> bool {
        self.completed
            .lock()
            .map(|c| c.contains(&target_id))
            .unwrap_or(false)
    }

    /// 登记完成，第一次登记返回 true
    pub fn mark_completed(&self, target_id: u64) -> bool {
        self.completed
            .lock()
            .map(|mut c| c.insert(target_id))
            .unwrap_or(false)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn progress_for(&self, target_id: u64) -> Arc<AsyncMutex<TargetProgress>> {
        let mut progress = self
            .progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        progress.entry(target_id).or_default().clone()
    }

    fn state_of(&self, target_id: u64) -> TargetState {
        let progress = self
            .progress
            .lock()
            .ok()
            .and_then(|p| p.get(&target_id).cloned());
        match progress {
            Some(p) => p.try_lock().map(|p| p.state).unwrap_or(TargetState::InProgress),
            None => TargetState::Pending,
        }
    }
}

/// 派发统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    pub attempts: usize,
    pub successes: usize,
    pub failures: usize,
    pub wrong_captcha: usize,
    pub admin_detected: usize,
    pub limit_reached: usize,
    pub errors: usize,
    /// 完成的目标数
    pub completed: usize,
    /// 放弃的目标数
    pub abandoned: usize,
    /// 拿到时已被其它工人完成的次数
    pub already_finished: usize,
}

impl DispatchStats {
    fn record(&mut self, result: &DispatchResult) {
        self.attempts += 1;
        match result {
            DispatchResult::Success => self.successes += 1,
            DispatchResult::Failure => self.failures += 1,
            DispatchResult::WrongCaptcha => self.wrong_captcha += 1,
            DispatchResult::AdminDetected => self.admin_detected += 1,
            DispatchResult::ActionLimitReached => self.limit_reached += 1,
            DispatchResult::Error(_) => self.errors += 1,
        }
    }

    fn merge(&mut self, other: &DispatchStats) {
        self.attempts += other.attempts;
        self.successes += other.successes;
        self.failures += other.failures;
        self.wrong_captcha += other.wrong_captcha;
        self.admin_detected += other.admin_detected;
        self.limit_reached += other.limit_reached;
        self.errors += other.errors;
        self.completed += other.completed;
        self.abandoned += other.abandoned;
        self.already_finished += other.already_finished;
    }
}

/// 派发结果
#[derive(Debug, Default, Clone)]
pub struct DispatchReport {
    pub stats: DispatchStats,
    /// 每个目标的最终状态（`completed` 字段已更新）
    pub targets: Vec<(Target, TargetState)>,
    /// 收到停止信号
    pub interrupted: bool,
}

/// 单个目标的处理结局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetOutcome {
    Completed,
    Abandoned,
    AlreadyFinished,
    Interrupted,
}

/// 派发器
pub struct Dispatcher {
    flow: Arc<DispatchFlow>,
    settings: DispatchSettings,
    registry: Arc<CompletionRegistry>,
}

impl Dispatcher {
    pub fn new(flow: DispatchFlow, settings: DispatchSettings) -> Self {
        Self {
            flow: Arc::new(flow),
            settings,
            registry: Arc::new(CompletionRegistry::new()),
        }
    }

    pub fn registry(&self) -> &CompletionRegistry {
        &self.registry
    }

    /// 派发所有目标，直到队列为空或收到停止信号
    ///
    /// 队列中可以有重复的目标
    pub async fn dispatch(
        &self,
        targets: Vec<Target>,
        stop: watch::Receiver<bool>,
    ) -> DispatchReport {
        let workers = self.settings.workers.max(1).min(targets.len().max(1));
        info!(
            "🎯 开始派发 {} 个目标，{} 个工人，每个目标上限 {} 次",
            targets.len(),
            workers,
            self.settings.action_cap
        );

        let queue = Arc::new(Mutex::new(targets.iter().cloned().collect::<VecDeque<_>>()));
        let mut handles = Vec::with_capacity(workers);

        for worker in 1..=workers {
            let queue = queue.clone();
            let flow = self.flow.clone();
            let registry = self.registry.clone();
            let settings = self.settings.clone();
            let stop = stop.clone();

            handles.push((
                worker,
                tokio::spawn(async move {
                    run_worker(worker, queue, flow, registry, settings, stop).await
                }),
            ));
        }

        let mut report = DispatchReport::default();
        for (worker, handle) in handles {
            match handle.await {
                Ok(stats) => report.stats.merge(&stats),
                Err(e) => error!("[工人 {}] 任务执行失败: {}", worker, e),
            }
        }
        report.interrupted = *stop.borrow();

        let mut seen = HashSet::new();
        for mut target in targets {
            if !seen.insert(target.id) {
                continue;
            }
            let state = self.registry.state_of(target.id);
            target.completed = state == TargetState::Completed;
            report.targets.push((target, state));
        }

        info!(
            "✓ 派发结束: 完成 {}，放弃 {}，共尝试 {} 次{}",
            report.stats.completed,
            report.stats.abandoned,
            report.stats.attempts,
            if report.interrupted { " (已中断)" } else { "" }
        );
        report
    }
}

async fn run_worker(
    worker: usize,
    queue: Arc<Mutex<VecDeque<Target>>>,
    flow: Arc<DispatchFlow>,
    registry: Arc<CompletionRegistry>,
    settings: DispatchSettings,
    stop: watch::Receiver<bool>,
) -> DispatchStats {
    let mut stats = DispatchStats::default();

    loop {
        if *stop.borrow() {
            break;
        }
        let next = queue.lock().ok().and_then(|mut q| q.pop_front());
        let Some(target) = next else {
            break;
        };

        let outcome =
            process_target(worker, target, &flow, &registry, &settings, &stop, &mut stats).await;
        match outcome {
            TargetOutcome::Completed => stats.completed += 1,
            TargetOutcome::Abandoned => stats.abandoned += 1,
            TargetOutcome::AlreadyFinished => stats.already_finished += 1,
            TargetOutcome::Interrupted => break,
        }
    }

    stats
}

async fn process_target(
    worker: usize,
    target: Target,
    flow: &DispatchFlow,
    registry: &CompletionRegistry,
    settings: &DispatchSettings,
    stop: &watch::Receiver<bool>,
    stats: &mut DispatchStats,
) -> TargetOutcome {
    let target_id = target.id;
    let progress = registry.progress_for(target_id);
    let mut ctx = DispatchCtx::new(worker, target);

    loop {
        if *stop.borrow() {
            return TargetOutcome::Interrupted;
        }

        let mut p = progress.lock().await;
        // 拿到锁之后复查
        if registry.is_completed(target_id) || p.state.is_finished() {
            return TargetOutcome::AlreadyFinished;
        }
        p.state = TargetState::InProgress;
        ctx.next_attempt();

        let result = flow.run(&ctx).await;
        stats.record(&result);

        let finished = match result {
            DispatchResult::Success | DispatchResult::Failure => {
                p.actions += 1;
                p.consecutive_errors = 0;
                (p.actions >= settings.action_cap).then_some(TargetState::Completed)
            }
            DispatchResult::AdminDetected | DispatchResult::ActionLimitReached => {
                Some(TargetState::Completed)
            }
            DispatchResult::WrongCaptcha => {
                p.wrong_captchas += 1;
                (p.wrong_captchas >= settings.max_wrong_captcha).then_some(TargetState::Abandoned)
            }
            DispatchResult::Error(_) => {
                p.consecutive_errors += 1;
                (p.consecutive_errors >= settings.max_errors).then_some(TargetState::Abandoned)
            }
        };

        match finished {
            Some(TargetState::Completed) => {
                p.state = TargetState::Completed;
                registry.mark_completed(target_id);
                info!("{} ✅ 目标完成 (行动 {} 次)", ctx, p.actions);
                return TargetOutcome::Completed;
            }
            Some(_) => {
                p.state = TargetState::Abandoned;
                warn!(
                    "{} ❌ 放弃目标 (连续错误 {}，验证码错误 {})",
                    ctx, p.consecutive_errors, p.wrong_captchas
                );
                return TargetOutcome::Abandoned;
            }
            None => {}
        }
    }
}
