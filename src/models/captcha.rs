//! 验证码模型
//!
//! 验证码从获取开始老化，超过 [`EXPIRATION_AGE`] 后服务器不再接受

use std::fmt::Display;
use std::time::Duration;
use tokio::time::Instant;

/// 验证码过期时间（4 分 30 秒）
pub const EXPIRATION_AGE: Duration = Duration::from_secs(270);

/// 验证码类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptchaKind {
    /// 图片验证码，需要点击数字
    Image,
    /// 算式验证码，本地计算即可
    Equation,
    /// 冷却/纯文本提示，不需要答案
    Cooldown,
}

impl CaptchaKind {
    pub fn needs_answer(self) -> bool {
        !matches!(self, CaptchaKind::Cooldown)
    }
}

impl Display for CaptchaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CaptchaKind::Image => "图片",
            CaptchaKind::Equation => "算式",
            CaptchaKind::Cooldown => "冷却",
        };
        f.write_str(name)
    }
}

/// 验证码
///
/// 除 `answer` 和 `answer_correct` 外不可变，这两个字段各自只能设置一次
#[derive(Debug, Clone)]
pub struct Captcha {
    id: String,
    payload: Option<Vec<u8>>,
    kind: CaptchaKind,
    answer: Option<String>,
    answer_correct: Option<bool>,
    created_at: Instant,
}

impl Captcha {
    /// 创建新获取的验证码
    pub fn new(id: impl Into<String>, kind: CaptchaKind, payload: Option<Vec<u8>>) -> Self {
        Self::with_created_at(id, kind, payload, Instant::now())
    }

    /// 指定创建时间
    pub fn with_created_at(
        id: impl Into<String>,
        kind: CaptchaKind,
        payload: Option<Vec<u8>>,
        created_at: Instant,
    ) -> Self {
        Self {
            id: id.into(),
            payload,
            kind,
            answer: None,
            answer_correct: None,
            created_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> CaptchaKind {
        self.kind
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// 算式验证码的文本内容
    pub fn payload_text(&self) -> Option<String> {
        self.payload
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn answer(&self) -> Option<&str> {
        self.answer.as_deref()
    }

    pub fn answer_correct(&self) -> Option<bool> {
        self.answer_correct
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.age_at(Instant::now())
    }

    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.age_at(now) >= EXPIRATION_AGE
    }

    /// 距离过期还剩多久
    pub fn time_to_expiry(&self, now: Instant) -> Duration {
        EXPIRATION_AGE.saturating_sub(self.age_at(now))
    }

    /// 设置答案，已经设置过则返回 false
    pub fn set_answer(&mut self, answer: impl Into<String>) -> bool {
        if self.answer.is_some() {
            return false;
        }
        self.answer = Some(answer.into());
        true
    }

    /// 记录服务器反馈，已经记录过则返回 false
    pub fn set_answer_correct(&mut self, correct: bool) -> bool {
        if self.answer.is_none() || self.answer_correct.is_some() {
            return false;
        }
        self.answer_correct = Some(correct);
        true
    }

    /// 是否可以直接提交（已答或不需要答案）
    pub fn is_ready(&self) -> bool {
        !self.kind.needs_answer() || self.answer.is_some()
    }
}

impl Display for Captcha {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[验证码 {} {}]", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expiry_boundary() {
        let captcha = Captcha::new("abc", CaptchaKind::Image, None);
        assert!(!captcha.is_expired());

        tokio::time::advance(EXPIRATION_AGE - Duration::from_millis(1)).await;
        assert!(!captcha.is_expired());
        assert_eq!(captcha.time_to_expiry(Instant::now()), Duration::from_millis(1));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(captcha.is_expired());
    }

    #[test]
    fn test_answer_set_once() {
        let mut captcha = Captcha::new("abc", CaptchaKind::Image, None);
        assert!(!captcha.set_answer_correct(true));
        assert!(captcha.set_answer("7"));
        assert!(!captcha.set_answer("8"));
        assert_eq!(captcha.answer(), Some("7"));

        assert!(captcha.set_answer_correct(false));
        assert!(!captcha.set_answer_correct(true));
        assert_eq!(captcha.answer_correct(), Some(false));
    }

    #[test]
    fn test_cooldown_is_ready_without_answer() {
        let captcha = Captcha::new("cd", CaptchaKind::Cooldown, None);
        assert!(captcha.is_ready());
        let captcha = Captcha::new("img", CaptchaKind::Image, None);
        assert!(!captcha.is_ready());
    }
}
