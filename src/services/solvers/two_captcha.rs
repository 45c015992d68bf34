//! 2Captcha 打码
//!
//! 上传 `in.php`，轮询 `res.php` 取答案

use super::CaptchaSolver;
use crate::error::{AppError, AppResult, SolverError};
use crate::models::Captcha;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const SERVICE: &str = "2captcha";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: u8,
    request: String,
}

/// 2Captcha 打码服务
pub struct TwoCaptchaSolver {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    poll_interval: Duration,
    max_polls: usize,
    /// 验证码 ID → 打码任务 ID，用于反馈
    tasks: Mutex<HashMap<String, String>>,
}

impl TwoCaptchaSolver {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, "https://2captcha.com")
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(5),
            max_polls: 24,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// 调整轮询节奏
    pub fn with_polling(mut self, interval: Duration, max_polls: usize) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls;
        self
    }

    async fn call(&self, request: reqwest::RequestBuilder) -> AppResult<ApiResponse> {
        let response = request
            .send()
            .await
            .map_err(|e| AppError::solver_api_failed(SERVICE, e))?;
        response
            .json::<ApiResponse>()
            .await
            .map_err(|e| AppError::solver_api_failed(SERVICE, e))
    }

    fn remember_task(&self, captcha_id: &str, task_id: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(captcha_id.to_string(), task_id.to_string());
        }
    }

    fn take_task(&self, captcha_id: &str) -> Option<String> {
        self.tasks.lock().ok()?.remove(captcha_id)
    }
}

#[async_trait]
impl CaptchaSolver for TwoCaptchaSolver {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn solve(&self, captcha: &Captcha) -> AppResult<String> {
        let payload = captcha.payload().ok_or_else(|| SolverError::MissingPayload {
            captcha_id: captcha.id().to_string(),
        })?;
        let body = base64::engine::general_purpose::STANDARD.encode(payload);

        let upload = self
            .call(self.client.post(format!("{}/in.php", self.base_url)).form(&[
                ("key", self.api_key.as_str()),
                ("method", "base64"),
                ("body", body.as_str()),
                ("numeric", "1"),
                ("json", "1"),
            ]))
            .await?;
        if upload.status != 1 {
            return Err(SolverError::BadResponse {
                service: SERVICE.to_string(),
                message: upload.request,
            }
            .into());
        }
        let task_id = upload.request;
        debug!("{} 已上传 2Captcha，任务 {}", captcha, task_id);

        for poll in 1..=self.max_polls {
            sleep(self.poll_interval).await;
            let result = self
                .call(self.client.get(format!("{}/res.php", self.base_url)).query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", task_id.as_str()),
                    ("json", "1"),
                ]))
                .await?;

            match (result.status, result.request.as_str()) {
                (1, _) => {
                    self.remember_task(captcha.id(), &task_id);
                    return Ok(result.request);
                }
                (_, "CAPCHA_NOT_READY") => {
                    debug!("2Captcha 任务 {} 未完成 ({}/{})", task_id, poll, self.max_polls);
                }
                _ => {
                    return Err(SolverError::BadResponse {
                        service: SERVICE.to_string(),
                        message: result.request,
                    }
                    .into())
                }
            }
        }

        Err(SolverError::Timeout {
            service: SERVICE.to_string(),
            polls: self.max_polls,
        }
        .into())
    }

    async fn report(&self, captcha: &Captcha, correct: bool) -> AppResult<()> {
        let Some(task_id) = self.take_task(captcha.id()) else {
            return Ok(());
        };
        let action = if correct { "reportgood" } else { "reportbad" };
        let result = self
            .call(self.client.get(format!("{}/res.php", self.base_url)).query(&[
                ("key", self.api_key.as_str()),
                ("action", action),
                ("id", task_id.as_str()),
                ("json", "1"),
            ]))
            .await?;
        if result.status != 1 {
            warn!("2Captcha 反馈未被接受: {}", result.request);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CaptchaKind;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_solve_polls_until_ready_and_reports() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/in.php"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": 1, "request": "T42"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/res.php"))
            .and(query_param("action", "get"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": 0, "request": "CAPCHA_NOT_READY"})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/res.php"))
            .and(query_param("action", "get"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": 1, "request": "5"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/res.php"))
            .and(query_param("action", "reportbad"))
            .and(query_param("id", "T42"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": 1, "request": "OK_REPORT_RECORDED"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let solver = TwoCaptchaSolver::with_base_url("key", server.uri())
            .with_polling(Duration::from_millis(10), 5);
        let captcha = Captcha::new("c1", CaptchaKind::Image, Some(vec![9, 9]));

        assert_eq!(solver.solve(&captcha).await.unwrap(), "5");
        solver.report(&captcha, false).await.unwrap();
        // 同一个任务只反馈一次
        solver.report(&captcha, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_solve_without_payload_fails() {
        let solver = TwoCaptchaSolver::with_base_url("key", "http://127.0.0.1:9");
        let captcha = Captcha::new("c1", CaptchaKind::Image, None);
        assert!(matches!(
            solver.solve(&captcha).await,
            Err(AppError::Solver(SolverError::MissingPayload { .. }))
        ));
    }
}
