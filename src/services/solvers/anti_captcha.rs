//! Anti-Captcha 打码

use super::CaptchaSolver;
use crate::error::{AppError, AppResult, SolverError};
use crate::models::Captcha;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

const SERVICE: &str = "anti-captcha";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResponse {
    error_id: u32,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    task_id: Option<u64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    solution: Option<Solution>,
}

#[derive(Debug, Deserialize)]
struct Solution {
    text: String,
}

/// Anti-Captcha 打码服务
pub struct AntiCaptchaSolver {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    poll_interval: Duration,
    max_polls: usize,
    tasks: Mutex<HashMap<String, u64>>,
}

impl AntiCaptchaSolver {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, "https://api.anti-captcha.com")
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(3),
            max_polls: 40,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: usize) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls;
        self
    }

    async fn call(&self, method: &str, body: JsonValue) -> AppResult<TaskResponse> {
        let response: TaskResponse = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::solver_api_failed(SERVICE, e))?
            .json()
            .await
            .map_err(|e| AppError::solver_api_failed(SERVICE, e))?;

        if response.error_id != 0 {
            return Err(SolverError::BadResponse {
                service: SERVICE.to_string(),
                message: response
                    .error_description
                    .unwrap_or_else(|| format!("errorId={}", response.error_id)),
            }
            .into());
        }
        Ok(response)
    }
}

#[async_trait]
impl CaptchaSolver for AntiCaptchaSolver {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn solve(&self, captcha: &Captcha) -> AppResult<String> {
        let payload = captcha.payload().ok_or_else(|| SolverError::MissingPayload {
            captcha_id: captcha.id().to_string(),
        })?;

        let created = self
            .call(
                "createTask",
                json!({
                    "clientKey": self.api_key,
                    "task": {
                        "type": "ImageToTextTask",
                        "body": base64::engine::general_purpose::STANDARD.encode(payload),
                        "numeric": 1,
                        "minLength": 1,
                        "maxLength": 1
                    }
                }),
            )
            .await?;
        let task_id = created.task_id.ok_or_else(|| SolverError::BadResponse {
            service: SERVICE.to_string(),
            message: "createTask 没有返回 taskId".to_string(),
        })?;
        debug!("{} 已创建 Anti-Captcha 任务 {}", captcha, task_id);

        for _ in 0..self.max_polls {
            sleep(self.poll_interval).await;
            let result = self
                .call(
                    "getTaskResult",
                    json!({ "clientKey": self.api_key, "taskId": task_id }),
                )
                .await?;
            if result.status.as_deref() == Some("ready") {
                let solution = result.solution.ok_or_else(|| SolverError::BadResponse {
                    service: SERVICE.to_string(),
                    message: "任务完成但没有 solution".to_string(),
                })?;
                if let Ok(mut tasks) = self.tasks.lock() {
                    tasks.insert(captcha.id().to_string(), task_id);
                }
                return Ok(solution.text);
            }
        }

        Err(SolverError::Timeout {
            service: SERVICE.to_string(),
            polls: self.max_polls,
        }
        .into())
    }

    async fn report(&self, captcha: &Captcha, correct: bool) -> AppResult<()> {
        let task_id = self
            .tasks
            .lock()
            .ok()
            .and_then(|mut tasks| tasks.remove(captcha.id()));
        // Anti-Captcha 只接受错误反馈
        let Some(task_id) = task_id.filter(|_| !correct) else {
            return Ok(());
        };
        self.call(
            "reportIncorrectImageCaptcha",
            json!({ "clientKey": self.api_key, "taskId": task_id }),
        )
        .await?;
        Ok(())
    }
}
