//! 打码服务 - 业务能力层
//!
//! 每种打码方式实现 [`CaptchaSolver`]，验证码类型只在 [`solve_captcha`] 里判断一次

pub mod anti_captcha;
pub mod inference;
pub mod manual;
pub mod two_captcha;

pub use anti_captcha::AntiCaptchaSolver;
pub use inference::InferenceSolver;
pub use manual::ManualSolver;
pub use two_captcha::TwoCaptchaSolver;

use crate::config::{Config, SolverKind};
use crate::error::{AppResult, CaptchaError, ConfigError, SolverError};
use crate::models::{Captcha, CaptchaKind};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// 打码方式
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// 名称（用于日志）
    fn name(&self) -> &str;

    /// 识别图片验证码，返回答案
    async fn solve(&self, captcha: &Captcha) -> AppResult<String>;

    /// 反馈答案是否正确
    async fn report(&self, captcha: &Captcha, correct: bool) -> AppResult<()>;
}

/// 为验证码设置答案
///
/// - 冷却类不需要答案
/// - 算式类本地计算
/// - 图片类交给打码服务
pub async fn solve_captcha(solver: &dyn CaptchaSolver, captcha: &mut Captcha) -> AppResult<()> {
    if captcha.answer().is_some() {
        return Ok(());
    }

    let answer = match captcha.kind() {
        CaptchaKind::Cooldown => return Ok(()),
        CaptchaKind::Equation => {
            let expression = captcha.payload_text().unwrap_or_default();
            solve_equation(&expression)?.to_string()
        }
        CaptchaKind::Image => {
            let raw = solver.solve(captcha).await?;
            normalize_digit_answer(&raw).ok_or(SolverError::UnparsableAnswer { response: raw })?
        }
    };

    debug!("{} 答案: {} (来自 {})", captcha, answer, solver.name());
    captcha.set_answer(answer);
    Ok(())
}

/// 反馈答案结果，本地计算的答案不需要反馈
pub async fn report_captcha(solver: &dyn CaptchaSolver, captcha: &mut Captcha, correct: bool) {
    if !captcha.set_answer_correct(correct) || captcha.kind() != CaptchaKind::Image {
        return;
    }
    if let Err(e) = solver.report(captcha, correct).await {
        warn!("{} 反馈打码结果失败 ({}): {}", captcha, solver.name(), e);
    }
}

/// 计算形如 `a + b` 的算式
pub fn solve_equation(expression: &str) -> Result<i64, CaptchaError> {
    let bad = || CaptchaError::BadEquation {
        expression: expression.to_string(),
    };
    let cleaned: String = expression
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=' && *c != '?')
        .map(|c| match c {
            '×' | 'x' | 'X' => '*',
            '÷' => '/',
            '−' => '-',
            other => other,
        })
        .collect();

    // 跳过开头的负号再找运算符
    let op_index = cleaned
        .char_indices()
        .skip(1)
        .find(|(_, c)| matches!(c, '+' | '-' | '*' | '/'))
        .map(|(i, _)| i)
        .ok_or_else(bad)?;
    let (left, rest) = cleaned.split_at(op_index);
    let op = rest.chars().next().ok_or_else(bad)?;
    let right = &rest[op.len_utf8()..];

    let a: i64 = left.parse().map_err(|_| bad())?;
    let b: i64 = right.parse().map_err(|_| bad())?;

    match op {
        '+' => a.checked_add(b),
        '-' => a.checked_sub(b),
        '*' => a.checked_mul(b),
        '/' if b != 0 && a % b == 0 => Some(a / b),
        _ => None,
    }
    .ok_or_else(bad)
}

/// 图片验证码的答案是 1-9 中的一个数字
pub fn normalize_digit_answer(raw: &str) -> Option<String> {
    raw.chars()
        .find(|c| ('1'..='9').contains(c))
        .map(|c| c.to_string())
}

/// 根据配置创建打码方式
pub fn build_solver(config: &Config) -> AppResult<Arc<dyn CaptchaSolver>> {
    let solver: Arc<dyn CaptchaSolver> = match config.solver {
        SolverKind::Manual => Arc::new(ManualSolver::new(&config.manual_captcha_file)),
        SolverKind::TwoCaptcha => {
            require_key("twocaptcha_key", &config.twocaptcha_key)?;
            Arc::new(TwoCaptchaSolver::new(&config.twocaptcha_key))
        }
        SolverKind::AntiCaptcha => {
            require_key("anticaptcha_key", &config.anticaptcha_key)?;
            Arc::new(AntiCaptchaSolver::new(&config.anticaptcha_key))
        }
        SolverKind::Inference => {
            require_key("inference_api_key", &config.inference_api_key)?;
            Arc::new(InferenceSolver::new(config))
        }
    };
    Ok(solver)
}

fn require_key(key: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: "所选打码方式需要 API Key".to_string(),
        });
    }
    Ok(())
}
