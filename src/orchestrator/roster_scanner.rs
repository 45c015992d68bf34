//! 名单扫描器 - 编排层
//!
//! ## 职责
//!
//! 把页码范围切成若干块，用有界的并发池并行扫描，汇总所有目标。
//!
//! ## 规则
//!
//! 1. **页码越界**：只结束当前块，其它块不受影响
//! 2. **单页失败**：记录并计数，继续下一页
//! 3. **借不到会话**：换一个会话重试一次，仍失败则放弃该块
//! 4. **去重**：同一目标出现在多页时保留第一次出现的

use crate::clients::GameClient;
use crate::error::{AppResult, ScanError, SessionError};
use crate::models::Target;
use crate::services::SessionPool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// 一个块最多尝试借会话的次数
const CHUNK_ATTEMPTS: usize = 2;

/// 扫描参数
#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// 并发扫描的块数
    pub workers: usize,
    /// 每块的页数
    pub chunk_size: u32,
    /// 等待空闲会话的时长
    pub session_wait: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            chunk_size: 5,
            session_wait: Duration::from_secs(30),
        }
    }
}

/// 扫描结果
#[derive(Debug, Default, Clone)]
pub struct ScanReport {
    /// 去重后按排名排序的目标
    pub targets: Vec<Target>,
    pub pages_scanned: usize,
    pub failed_pages: Vec<u32>,
    pub chunks_total: usize,
    pub chunks_abandoned: usize,
    pub duplicates: usize,
}

/// 单块的扫描结果
#[derive(Debug, Default)]
struct ChunkResult {
    entries: Vec<Target>,
    pages_scanned: usize,
    failed_pages: Vec<u32>,
    abandoned: bool,
}

/// 名单扫描器
pub struct RosterScanner {
    pool: Arc<SessionPool>,
    game: Arc<dyn GameClient>,
    settings: ScanSettings,
}

impl RosterScanner {
    pub fn new(pool: Arc<SessionPool>, game: Arc<dyn GameClient>, settings: ScanSettings) -> Self {
        Self {
            pool,
            game,
            settings,
        }
    }

    /// 读取第一页上标注的总页数
    pub async fn detect_last_page(&self, first_page: u32) -> AppResult<u32> {
        let mut session = self
            .pool
            .acquire_wait(self.settings.session_wait)
            .await
            .ok_or(SessionError::PoolExhausted)?;
        let page = self.game.roster_page(&mut session, first_page).await?;

        page.total_pages
            .filter(|&total| total >= first_page)
            .ok_or_else(|| {
                ScanError::PageParseFailed {
                    page: first_page,
                    reason: "页面上没有总页数".to_string(),
                }
                .into()
            })
    }

    /// 扫描 `[first_page, last_page]`
    pub async fn scan(&self, first_page: u32, last_page: u32) -> ScanReport {
        let chunks = chunk_ranges(first_page, last_page, self.settings.chunk_size);
        info!(
            "🔍 扫描第 {}-{} 页，共 {} 块，并发 {}",
            first_page,
            last_page,
            chunks.len(),
            self.settings.workers
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut handles = Vec::with_capacity(chunks.len());

        for (index, (start, end)) in chunks.iter().copied().enumerate() {
            let chunk_no = index + 1;
            let semaphore = semaphore.clone();
            let pool = self.pool.clone();
            let game = self.game.clone();
            let wait = self.settings.session_wait;

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                Some(scan_chunk(&pool, game.as_ref(), chunk_no, start, end, wait).await)
            });
            handles.push((chunk_no, handle));
        }

        let mut report = ScanReport {
            chunks_total: chunks.len(),
            ..ScanReport::default()
        };
        let mut seen = HashSet::new();

        for (chunk_no, handle) in handles {
            let chunk = match handle.await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    error!("[扫描块 {}] 并发池已关闭", chunk_no);
                    report.chunks_abandoned += 1;
                    continue;
                }
                Err(e) => {
                    error!("[扫描块 {}] 任务执行失败: {}", chunk_no, e);
                    report.chunks_abandoned += 1;
                    continue;
                }
            };

            report.pages_scanned += chunk.pages_scanned;
            report.failed_pages.extend(chunk.failed_pages);
            if chunk.abandoned {
                report.chunks_abandoned += 1;
            }
            for target in chunk.entries {
                if seen.insert(target.id) {
                    report.targets.push(target);
                } else {
                    report.duplicates += 1;
                }
            }
        }

        report.targets.sort_by_key(|t| (t.rank, t.id));
        report.failed_pages.sort_unstable();

        info!(
            "✓ 扫描完成: {} 个目标，{} 页成功，{} 页失败，{} 块放弃",
            report.targets.len(),
            report.pages_scanned,
            report.failed_pages.len(),
            report.chunks_abandoned
        );
        report
    }
}

/// 把页码范围切块
fn chunk_ranges(first: u32, last: u32, chunk_size: u32) -> Vec<(u32, u32)> {
    let size = chunk_size.max(1);
    if last < first {
        return Vec::new();
    }
    (first..=last)
        .step_by(size as usize)
        .map(|start| (start, start.saturating_add(size - 1).min(last)))
        .collect()
}

async fn scan_chunk(
    pool: &SessionPool,
    game: &dyn GameClient,
    chunk_no: usize,
    start: u32,
    end: u32,
    wait: Duration,
) -> ChunkResult {
    let mut result = ChunkResult::default();

    let mut lease = None;
    for attempt in 1..=CHUNK_ATTEMPTS {
        lease = pool.acquire_wait(wait).await;
        if lease.is_some() {
            break;
        }
        warn!(
            "[扫描块 {}] 借不到会话 (尝试 {}/{})",
            chunk_no, attempt, CHUNK_ATTEMPTS
        );
    }
    let Some(mut session) = lease else {
        error!("[扫描块 {}] ❌ 放弃第 {}-{} 页", chunk_no, start, end);
        result.abandoned = true;
        return result;
    };

    debug!("[扫描块 {}] {} 扫描第 {}-{} 页", chunk_no, &*session, start, end);
    for page in start..=end {
        match game.roster_page(&mut session, page).await {
            Ok(roster) if roster.out_of_range => {
                debug!("[扫描块 {}] 第 {} 页超出范围，本块结束", chunk_no, page);
                break;
            }
            Ok(roster) => {
                result.pages_scanned += 1;
                result.entries.extend(roster.entries);
            }
            Err(e) => {
                warn!("[扫描块 {}] ⚠️ 第 {} 页失败: {}", chunk_no, page, e);
                result.failed_pages.push(page);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fake::FakeGame;
    use crate::infrastructure::{LoginState, MemoryCookieStore, Session};
    use crate::services::{LoginOptions, SessionLogin};

    fn pool_of(game: Arc<FakeGame>, sessions: usize) -> Arc<SessionPool> {
        let login = Arc::new(SessionLogin::new(
            game,
            Arc::new(MemoryCookieStore::new()),
            LoginOptions::default(),
        ));
        let live = (1..=sessions)
            .map(|id| {
                let mut s = Session::new(id).unwrap();
                s.set_state(LoginState::LoggedIn);
                s
            })
            .collect();
        Arc::new(SessionPool::from_sessions(live, login, sessions))
    }

    fn scanner(game: Arc<FakeGame>, sessions: usize, workers: usize, chunk: u32) -> RosterScanner {
        RosterScanner::new(
            pool_of(game.clone(), sessions),
            game,
            ScanSettings {
                workers,
                chunk_size: chunk,
                session_wait: Duration::from_millis(100),
            },
        )
    }

    #[test]
    fn test_chunk_ranges() {
        assert_eq!(chunk_ranges(1, 10, 4), vec![(1, 4), (5, 8), (9, 10)]);
        assert_eq!(chunk_ranges(3, 3, 5), vec![(3, 3)]);
        assert!(chunk_ranges(5, 4, 2).is_empty());
        assert_eq!(chunk_ranges(1, 2, 0), vec![(1, 1), (2, 2)]);
    }

    #[tokio::test]
    async fn test_out_of_range_ends_only_its_chunk() {
        // 只有 1-6 页和 8-10 页有数据，第 7 页越界
        let mut fake = FakeGame::with_roster(10, 2);
        fake.roster.remove(&7);
        let game = Arc::new(fake);
        let scanner = scanner(game.clone(), 3, 3, 3);

        let report = scanner.scan(1, 10).await;

        // 块 (7,9) 在第 7 页结束，8、9 页不会被请求
        let calls = game.roster_calls.lock().unwrap().clone();
        let pages: HashSet<u32> = calls.iter().map(|(_, p)| *p).collect();
        assert!(!pages.contains(&8));
        assert!(!pages.contains(&9));
        assert!(pages.contains(&10));

        assert_eq!(report.pages_scanned, 7);
        assert_eq!(report.targets.len(), 14);
        assert!(report.failed_pages.is_empty());
        assert_eq!(report.chunks_abandoned, 0);
    }

    #[tokio::test]
    async fn test_failed_page_is_counted_and_skipped() {
        let mut fake = FakeGame::with_roster(6, 3);
        fake.failing_pages.insert(3);
        let game = Arc::new(fake);
        let scanner = scanner(game, 2, 2, 2);

        let report = scanner.scan(1, 6).await;

        assert_eq!(report.failed_pages, vec![3]);
        assert_eq!(report.pages_scanned, 5);
        assert_eq!(report.targets.len(), 15);
        assert!(report.targets.iter().all(|t| !(7..=9).contains(&t.id)));
        // 按排名排序
        assert!(report.targets.windows(2).all(|w| w[0].rank <= w[1].rank));
    }

    #[tokio::test]
    async fn test_duplicates_removed_and_detect_total() {
        let mut fake = FakeGame::with_roster(3, 2);
        let repeated = fake.roster[&1][0].clone();
        fake.roster.get_mut(&2).unwrap().push(repeated);
        let game = Arc::new(fake);
        let scanner = scanner(game, 1, 4, 1);

        assert_eq!(scanner.detect_last_page(1).await.unwrap(), 3);
        let report = scanner.scan(1, 3).await;
        assert_eq!(report.targets.len(), 6);
        assert_eq!(report.duplicates, 1);
    }

    #[tokio::test]
    async fn test_chunks_abandoned_when_pool_empty() {
        let game = Arc::new(FakeGame::with_roster(4, 1));
        let scanner = scanner(game, 0, 2, 2);

        let report = scanner.scan(1, 4).await;
        assert_eq!(report.chunks_total, 2);
        assert_eq!(report.chunks_abandoned, 2);
        assert!(report.targets.is_empty());
    }
}
