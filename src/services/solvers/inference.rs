//! 远程推理打码
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 兼容 OpenAI API 的视觉模型服务均可使用
//! - 图片以 data URL 形式随消息发送

use super::{normalize_digit_answer, CaptchaSolver};
use crate::config::Config;
use crate::error::{AppError, AppResult, SolverError};
use crate::models::Captcha;
use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageDetail,
        ImageUrl,
    },
    Client,
};
use async_trait::async_trait;
use base64::Engine;
use tracing::{debug, warn};

const SERVICE: &str = "inference";

const SYSTEM_PROMPT: &str = "You read game captcha images. The image shows exactly one digit \
                             between 1 and 9. Reply with that single digit and nothing else.";

/// 远程推理打码服务
///
/// 职责：
/// - 把验证码图片发给视觉模型
/// - 从回复中提取 1-9 的数字
/// - 不关心验证码从哪里来
pub struct InferenceSolver {
    client: Client<OpenAIConfig>,
    model_name: String,
    max_retries: usize,
}

impl InferenceSolver {
    /// 创建新的推理打码服务
    pub fn new(config: &Config) -> Self {
        // 配置 OpenAI 客户端（兼容 OpenAI API 的服务）
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.inference_api_key)
            .with_api_base(&config.inference_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.inference_model.clone(),
            max_retries: 3,
        }
    }

    /// 发送一次识别请求，返回模型原始回复
    async fn ask_model(&self, image_data_url: &str) -> AppResult<String> {
        let build_err = |e: async_openai::error::OpenAIError| AppError::solver_api_failed(SERVICE, e);

        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(SYSTEM_PROMPT)
            .build()
            .map_err(build_err)?;

        let content_parts = vec![
            ChatCompletionRequestUserMessageContentPart::Text(
                ChatCompletionRequestMessageContentPartText {
                    text: "Which digit is shown?".to_string(),
                },
            ),
            ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImage {
                    image_url: ImageUrl {
                        url: image_data_url.to_string(),
                        detail: Some(ImageDetail::High),
                    },
                },
            ),
        ];
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Array(content_parts))
            .build()
            .map_err(build_err)?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(vec![
                ChatCompletionRequestMessage::System(system_msg),
                ChatCompletionRequestMessage::User(user_msg),
            ])
            .temperature(0.0)
            .max_tokens(8u32)
            .build()
            .map_err(build_err)?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("推理 API 调用失败: {}", e);
            build_err(e)
        })?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .map(|content| content.trim().to_string())
            .ok_or_else(|| {
                SolverError::BadResponse {
                    service: SERVICE.to_string(),
                    message: "返回内容为空".to_string(),
                }
                .into()
            })
    }
}

#[async_trait]
impl CaptchaSolver for InferenceSolver {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn solve(&self, captcha: &Captcha) -> AppResult<String> {
        let payload = captcha.payload().ok_or_else(|| SolverError::MissingPayload {
            captcha_id: captcha.id().to_string(),
        })?;
        let data_url = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(payload)
        );

        let mut last_response = String::new();
        for attempt in 1..=self.max_retries {
            let response = self.ask_model(&data_url).await?;
            if let Some(digit) = normalize_digit_answer(&response) {
                debug!("{} 模型识别为 {} (第 {} 次)", captcha, digit, attempt);
                return Ok(digit);
            }
            warn!(
                "{} 无法解析模型回复 '{}' (尝试 {}/{})",
                captcha, response, attempt, self.max_retries
            );
            last_response = response;
        }

        Err(SolverError::UnparsableAnswer {
            response: last_response,
        }
        .into())
    }

    async fn report(&self, captcha: &Captcha, correct: bool) -> AppResult<()> {
        // 模型没有反馈接口，只记录
        debug!("{} 推理结果反馈: {}", captcha, if correct { "正确" } else { "错误" });
        Ok(())
    }
}
