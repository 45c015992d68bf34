//! 手动打码
//!
//! 把验证码图片写到文件，从标准输入读取答案

use super::CaptchaSolver;
use crate::error::{AppError, AppResult, SolverError};
use crate::models::Captcha;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex;
use tracing::info;

/// 手动打码
///
/// 同一时间只有一个验证码在等待输入
pub struct ManualSolver {
    image_path: String,
    input: Mutex<BufReader<Stdin>>,
}

impl ManualSolver {
    pub fn new(image_path: impl Into<String>) -> Self {
        Self {
            image_path: image_path.into(),
            input: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }
}

#[async_trait]
impl CaptchaSolver for ManualSolver {
    fn name(&self) -> &str {
        "manual"
    }

    async fn solve(&self, captcha: &Captcha) -> AppResult<String> {
        let payload = captcha.payload().ok_or_else(|| SolverError::MissingPayload {
            captcha_id: captcha.id().to_string(),
        })?;

        let mut input = self.input.lock().await;

        tokio::fs::write(&self.image_path, payload)
            .await
            .map_err(|e| AppError::file_write_failed(&self.image_path, e))?;
        info!(
            "🖼️ {} 已保存到 {}，请输入图片中的数字 (1-9) 并回车:",
            captcha, self.image_path
        );

        let mut line = String::new();
        input
            .read_line(&mut line)
            .await
            .map_err(|e| SolverError::InputFailed {
                source: Box::new(e),
            })?;

        Ok(line.trim().to_string())
    }

    async fn report(&self, captcha: &Captcha, correct: bool) -> AppResult<()> {
        if !correct {
            info!("✗ {} 手动输入的答案错误", captcha);
        }
        Ok(())
    }
}
