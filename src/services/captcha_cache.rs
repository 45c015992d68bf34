//! 验证码缓存 - 业务能力层
//!
//! ## 职责
//!
//! 预先获取的验证码放在这里，派发时按"最老的未过期优先"取出。
//!
//! ## 设计要点
//!
//! 1. **列表存储**：缓存很小，取出时线性扫描
//! 2. **惰性清理**：每次操作列表时顺带清掉过期项
//! 3. **刷新定时器**：同一时间最多一个，定在最早的过期时刻，只在锁内布置/取消
//! 4. **通知线程**：每个缓存自带一个通知任务，监听器在锁外串行执行，
//!    同一次修改里重复的事件合并为一个

use crate::models::Captcha;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, warn};

/// 通知队列容量
const EVENT_QUEUE_CAPACITY: usize = 64;

/// 缓存事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Added,
    Removed,
    Empty,
}

/// 监听器
pub type CacheListener = Arc<dyn Fn(CacheEvent) + Send + Sync>;

/// 一次修改中产生的事件（按类型合并）
#[derive(Debug, Default)]
struct PendingEvents {
    added: bool,
    removed: bool,
    empty: bool,
}

struct Entry {
    seq: u64,
    captcha: Captcha,
}

struct RefreshTimer {
    deadline: Instant,
    generation: u64,
    handle: JoinHandle<()>,
}

struct CacheState {
    entries: Vec<Entry>,
    next_seq: u64,
    timer: Option<RefreshTimer>,
    timer_generation: u64,
    closed: bool,
}

struct CacheShared {
    state: Mutex<CacheState>,
    events: mpsc::Sender<CacheEvent>,
    listeners: Arc<RwLock<Vec<CacheListener>>>,
    available: Notify,
    notifier: Mutex<Option<JoinHandle<()>>>,
}

/// 验证码缓存
///
/// 克隆后共享同一份数据。必须在 tokio 运行时内创建和使用
#[derive(Clone)]
pub struct CaptchaCache {
    shared: Arc<CacheShared>,
}

impl CaptchaCache {
    /// 创建缓存并启动它的通知任务
    pub fn new() -> Self {
        let (events, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let listeners: Arc<RwLock<Vec<CacheListener>>> = Arc::new(RwLock::new(Vec::new()));
        let notifier = tokio::spawn(run_notifier(rx, listeners.clone()));

        Self {
            shared: Arc::new(CacheShared {
                state: Mutex::new(CacheState {
                    entries: Vec::new(),
                    next_seq: 0,
                    timer: None,
                    timer_generation: 0,
                    closed: false,
                }),
                events,
                listeners,
                available: Notify::new(),
                notifier: Mutex::new(Some(notifier)),
            }),
        }
    }

    /// 订阅缓存事件
    pub fn subscribe(&self, listener: impl Fn(CacheEvent) + Send + Sync + 'static) {
        if let Ok(mut listeners) = self.shared.listeners.write() {
            listeners.push(Arc::new(listener));
        }
    }

    /// 加入验证码，已过期或缓存已关闭时返回 false
    pub fn add(&self, captcha: Captcha) -> bool {
        let now = Instant::now();
        let mut events = PendingEvents::default();

        let accepted = {
            let mut state = self.shared.lock_state();
            purge_expired(&mut state, now, &mut events);

            let accepted = !state.closed && !captcha.is_expired_at(now);
            if accepted {
                let seq = state.next_seq;
                state.next_seq += 1;
                debug!("缓存加入 {} (共 {} 个)", captcha, state.entries.len() + 1);
                state.entries.push(Entry { seq, captcha });
                events.added = true;
            } else {
                debug!("拒绝加入 {} (已过期或缓存已关闭)", captcha);
            }

            self.shared.rearm_timer(&mut state, now);
            accepted
        };

        if accepted {
            self.shared.available.notify_one();
        }
        self.shared.emit(events);
        accepted
    }

    /// 取出最老的未过期验证码，没有时立即返回 None
    pub fn pop_oldest_valid(&self) -> Option<Captcha> {
        let now = Instant::now();
        let mut events = PendingEvents::default();

        let popped = {
            let mut state = self.shared.lock_state();
            purge_expired(&mut state, now, &mut events);

            // 创建时间最早即年龄最大，同时创建的按加入顺序
            let oldest = state
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| (e.captcha.created_at(), e.seq))
                .map(|(i, _)| i);

            let popped = oldest.map(|i| state.entries.remove(i).captcha);
            if popped.is_some() {
                events.removed = true;
                events.empty = state.entries.is_empty();
            }

            self.shared.rearm_timer(&mut state, now);
            popped
        };

        self.shared.emit(events);
        popped
    }

    /// 取出最老的未过期验证码，没有时最多等待 `wait`
    pub async fn pop_oldest_valid_wait(&self, wait: Duration) -> Option<Captcha> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(captcha) = self.pop_oldest_valid() {
                return Some(captcha);
            }
            if self.is_closed() {
                return None;
            }
            if timeout_at(deadline, self.shared.available.notified())
                .await
                .is_err()
            {
                return self.pop_oldest_valid();
            }
        }
    }

    /// 按 ID 删除
    pub fn remove(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut events = PendingEvents::default();

        let removed = {
            let mut state = self.shared.lock_state();
            purge_expired(&mut state, now, &mut events);

            let index = state.entries.iter().position(|e| e.captcha.id() == id);
            if let Some(i) = index {
                state.entries.remove(i);
                events.removed = true;
                events.empty = state.entries.is_empty();
            }

            self.shared.rearm_timer(&mut state, now);
            index.is_some()
        };

        self.shared.emit(events);
        removed
    }

    /// 当前未过期的验证码数量
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut events = PendingEvents::default();

        let len = {
            let mut state = self.shared.lock_state();
            purge_expired(&mut state, now, &mut events);
            if events.removed {
                self.shared.rearm_timer(&mut state, now);
            }
            state.entries.len()
        };

        self.shared.emit(events);
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_state().closed
    }

    /// 关闭缓存：取消定时器，停止通知任务，唤醒所有等待者
    pub fn close(&self) {
        {
            let mut state = self.shared.lock_state();
            state.closed = true;
            state.entries.clear();
            if let Some(timer) = state.timer.take() {
                timer.handle.abort();
            }
        }
        if let Ok(mut notifier) = self.shared.notifier.lock() {
            if let Some(handle) = notifier.take() {
                handle.abort();
            }
        }
        self.shared.available.notify_waiters();
    }

    /// 当前刷新定时器的触发时刻
    pub fn refresh_deadline(&self) -> Option<Instant> {
        self.shared.lock_state().timer.as_ref().map(|t| t.deadline)
    }
}

impl Default for CaptchaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheShared {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        // 锁内不会 panic，中毒时直接沿用数据
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 按最早过期时刻重新布置定时器，已经布置在同一时刻则保持不变
    fn rearm_timer(self: &Arc<Self>, state: &mut CacheState, now: Instant) {
        let next = state
            .entries
            .iter()
            .map(|e| now + e.captcha.time_to_expiry(now))
            .min();

        let current = state.timer.as_ref().map(|t| t.deadline);
        if next == current || state.closed {
            return;
        }

        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }

        if let Some(deadline) = next {
            state.timer_generation += 1;
            let generation = state.timer_generation;
            let weak: Weak<CacheShared> = Arc::downgrade(self);
            let handle = tokio::spawn(async move {
                sleep_until(deadline).await;
                if let Some(shared) = weak.upgrade() {
                    shared.on_timer(generation);
                }
            });
            state.timer = Some(RefreshTimer {
                deadline,
                generation,
                handle,
            });
        }
    }

    fn on_timer(self: &Arc<Self>, generation: u64) {
        let now = Instant::now();
        let mut events = PendingEvents::default();
        {
            let mut state = self.lock_state();
            let is_current = state
                .timer
                .as_ref()
                .map(|t| t.generation == generation)
                .unwrap_or(false);
            if !is_current || state.closed {
                return;
            }
            state.timer = None;

            purge_expired(&mut state, now, &mut events);
            if state.entries.is_empty() {
                events.empty = true;
            }
            self.rearm_timer(&mut state, now);
        }
        self.emit(events);
    }

    /// 在锁外把事件交给通知任务
    fn emit(&self, events: PendingEvents) {
        let kinds = [
            (events.added, CacheEvent::Added),
            (events.removed, CacheEvent::Removed),
            (events.empty, CacheEvent::Empty),
        ];
        for (_, event) in kinds.into_iter().filter(|(set, _)| *set) {
            if let Err(e) = self.events.try_send(event) {
                debug!("缓存事件 {:?} 未送达: {}", event, e);
            }
        }
    }
}

/// 清除过期项
fn purge_expired(state: &mut CacheState, now: Instant, events: &mut PendingEvents) {
    let before = state.entries.len();
    state.entries.retain(|e| !e.captcha.is_expired_at(now));
    let purged = before - state.entries.len();
    if purged > 0 {
        debug!("清除 {} 个过期验证码", purged);
        events.removed = true;
        events.empty = state.entries.is_empty();
    }
}

/// 通知任务：逐个执行监听器
async fn run_notifier(
    mut rx: mpsc::Receiver<CacheEvent>,
    listeners: Arc<RwLock<Vec<CacheListener>>>,
) {
    while let Some(event) = rx.recv().await {
        let snapshot: Vec<CacheListener> = match listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => {
                warn!("监听器列表不可用，丢弃事件 {:?}", event);
                continue;
            }
        };
        for listener in snapshot {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CaptchaKind, EXPIRATION_AGE};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn captcha_aged(id: &str, age_secs: u64) -> Captcha {
        Captcha::with_created_at(
            id,
            CaptchaKind::Image,
            None,
            Instant::now() - Duration::from_secs(age_secs),
        )
    }

    fn recording(cache: &CaptchaCache) -> UnboundedReceiver<CacheEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        cache.subscribe(move |event| {
            let _ = tx.send(event);
        });
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_returns_decreasing_age() {
        // 先推进时钟，才能构造"已经存在一段时间"的验证码
        tokio::time::advance(Duration::from_secs(600)).await;
        let cache = CaptchaCache::new();
        for (id, age) in [("b", 30), ("d", 5), ("a", 100), ("c", 10)] {
            assert!(cache.add(captcha_aged(id, age)));
        }

        let order: Vec<String> = std::iter::from_fn(|| cache.pop_oldest_valid())
            .map(|c| c.id().to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
        assert!(cache.pop_oldest_valid().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ties_broken_by_insertion_order() {
        let cache = CaptchaCache::new();
        let created = Instant::now();
        for id in ["first", "second", "third"] {
            cache.add(Captcha::with_created_at(id, CaptchaKind::Image, None, created));
        }
        assert_eq!(cache.pop_oldest_valid().unwrap().id(), "first");
        assert_eq!(cache.pop_oldest_valid().unwrap().id(), "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_add_is_rejected() {
        tokio::time::advance(Duration::from_secs(600)).await;
        let cache = CaptchaCache::new();
        cache.add(captcha_aged("fresh", 1));

        assert!(!cache.add(captcha_aged("stale", EXPIRATION_AGE.as_secs())));
        assert!(!cache.add(captcha_aged("older", 500)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_pops_expired() {
        let cache = CaptchaCache::new();
        cache.add(Captcha::new("x", CaptchaKind::Image, None));

        tokio::time::advance(EXPIRATION_AGE).await;
        assert!(cache.pop_oldest_valid().is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_by_id() {
        let cache = CaptchaCache::new();
        cache.add(Captcha::new("x", CaptchaKind::Image, None));
        cache.add(Captcha::new("y", CaptchaKind::Image, None));

        assert!(cache.remove("x"));
        assert!(!cache.remove("x"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_timer_tracks_earliest_expiry() {
        tokio::time::advance(Duration::from_secs(600)).await;
        let cache = CaptchaCache::new();
        assert!(cache.refresh_deadline().is_none());

        cache.add(captcha_aged("young", 10));
        let first = cache.refresh_deadline().unwrap();
        assert_eq!(first, Instant::now() + EXPIRATION_AGE - Duration::from_secs(10));

        cache.add(captcha_aged("old", 100));
        let second = cache.refresh_deadline().unwrap();
        assert_eq!(second, Instant::now() + EXPIRATION_AGE - Duration::from_secs(100));

        cache.pop_oldest_valid();
        assert_eq!(cache.refresh_deadline(), Some(first));

        cache.pop_oldest_valid();
        assert!(cache.refresh_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_purges_and_reports_empty() {
        let cache = CaptchaCache::new();
        let mut events = recording(&cache);
        let start = Instant::now();

        cache.add(Captcha::new("x", CaptchaKind::Image, None));
        assert_eq!(events.recv().await, Some(CacheEvent::Added));

        // 运行时空闲时自动推进时钟到定时器触发
        assert_eq!(events.recv().await, Some(CacheEvent::Removed));
        assert_eq!(events.recv().await, Some(CacheEvent::Empty));
        assert!(Instant::now() - start >= EXPIRATION_AGE);
        assert!(cache.refresh_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_coalesced_per_mutation() {
        let cache = CaptchaCache::new();
        let mut events = recording(&cache);

        cache.add(Captcha::new("a", CaptchaKind::Image, None));
        cache.add(Captcha::new("b", CaptchaKind::Image, None));
        assert_eq!(events.recv().await, Some(CacheEvent::Added));
        assert_eq!(events.recv().await, Some(CacheEvent::Added));

        // 两个同时过期，一次清理只产生一个 Removed 和一个 Empty
        assert_eq!(events.recv().await, Some(CacheEvent::Removed));
        assert_eq!(events.recv().await, Some(CacheEvent::Empty));
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_pop_wakes_on_add() {
        let cache = CaptchaCache::new();
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.pop_oldest_valid_wait(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;

        cache.add(Captcha::new("late", CaptchaKind::Image, None));
        let popped = waiter.await.unwrap();
        assert_eq!(popped.unwrap().id(), "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_pop_times_out() {
        let cache = CaptchaCache::new();
        let start = Instant::now();
        assert!(cache.pop_oldest_valid_wait(Duration::from_secs(5)).await.is_none());
        assert!(Instant::now() - start >= Duration::from_secs(5));
    }
}
