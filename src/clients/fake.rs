//! 单元测试用的内存游戏客户端

use super::GameClient;
use crate::error::{AppError, AppResult, CaptchaError};
use crate::infrastructure::{CookieJar, Session};
use crate::models::{ActionOutcome, ActionPage, Captcha, CaptchaKind, RosterPage, Target};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct FakeGame {
    /// 这些会话的登录永远失败
    pub failing_logins: HashSet<usize>,
    /// 名单：页码 → 条目
    pub roster: HashMap<u32, Vec<Target>>,
    pub total_pages: u32,
    /// 这些页面请求出错
    pub failing_pages: HashSet<u32>,
    /// 剩余的获取验证码失败次数，`usize::MAX` 表示永远失败
    pub captcha_failures: AtomicUsize,
    pub captcha_delay: Option<Duration>,
    /// 按顺序返回的行动结果，用完后返回 `default_outcome`
    pub outcomes: Mutex<VecDeque<ActionOutcome>>,
    pub default_outcome: Option<ActionOutcome>,
    pub action_delay: Option<Duration>,

    pub login_calls: AtomicUsize,
    pub captcha_calls: AtomicUsize,
    pub captcha_in_flight: AtomicUsize,
    pub captcha_max_in_flight: AtomicUsize,
    /// (会话, 目标) 的行动记录
    pub actions: Mutex<Vec<(usize, u64)>>,
    pub roster_calls: Mutex<Vec<(usize, u32)>>,
}

impl FakeGame {
    pub fn with_roster(pages: u32, per_page: u64) -> Self {
        let mut roster = HashMap::new();
        for page in 1..=pages {
            let entries = (0..per_page)
                .map(|i| {
                    let id = (page as u64 - 1) * per_page + i + 1;
                    Target::new(id, id as u32, format!("player{}", id))
                })
                .collect();
            roster.insert(page, entries);
        }
        Self {
            roster,
            total_pages: pages,
            ..Self::default()
        }
    }

    pub fn actions_on(&self, target_id: u64) -> usize {
        self.actions
            .lock()
            .map(|a| a.iter().filter(|(_, t)| *t == target_id).count())
            .unwrap_or(0)
    }

    fn logged_cookie(session: &Session) -> bool {
        let expected = format!("s{}", session.id());
        session.cookies().get("sid") == Some(expected.as_str())
    }
}

#[async_trait]
impl GameClient for FakeGame {
    async fn check_login(&self, session: &mut Session) -> AppResult<bool> {
        Ok(Self::logged_cookie(session))
    }

    async fn login(&self, session: &mut Session) -> AppResult<bool> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_logins.contains(&session.id()) {
            return Ok(false);
        }
        let mut jar = CookieJar::new();
        jar.insert("sid", format!("s{}", session.id()));
        session.replace_cookies(jar);
        Ok(true)
    }

    async fn fetch_captcha(&self, _session: &mut Session) -> AppResult<Captcha> {
        let n = self.captcha_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.captcha_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.captcha_max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if let Some(delay) = self.captcha_delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .captcha_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();

        self.captcha_in_flight.fetch_sub(1, Ordering::SeqCst);
        if failing {
            return Err(CaptchaError::NotPresent.into());
        }
        Ok(Captcha::new(
            format!("c{}", n),
            CaptchaKind::Equation,
            Some(b"3 + 4".to_vec()),
        ))
    }

    async fn roster_page(&self, session: &mut Session, page: u32) -> AppResult<RosterPage> {
        if let Ok(mut calls) = self.roster_calls.lock() {
            calls.push((session.id(), page));
        }
        if self.failing_pages.contains(&page) {
            return Err(AppError::Other(format!("第 {} 页加载失败", page)));
        }
        Ok(match self.roster.get(&page) {
            Some(entries) => RosterPage {
                page,
                total_pages: Some(self.total_pages),
                entries: entries.clone(),
                out_of_range: false,
            },
            None => RosterPage {
                page,
                total_pages: Some(self.total_pages),
                entries: Vec::new(),
                out_of_range: true,
            },
        })
    }

    async fn submit_action(
        &self,
        session: &mut Session,
        target: &Target,
        _captcha: Option<&Captcha>,
    ) -> AppResult<ActionPage> {
        if let Some(delay) = self.action_delay {
            tokio::time::sleep(delay).await;
        }
        if let Ok(mut actions) = self.actions.lock() {
            actions.push((session.id(), target.id));
        }
        let next = self.outcomes.lock().ok().and_then(|mut o| o.pop_front());
        let outcome = next
            .or(self.default_outcome)
            .unwrap_or(ActionOutcome::Success);
        Ok(ActionPage {
            outcome,
            message: format!("{:?}", outcome),
        })
    }
}
