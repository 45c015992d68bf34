use crate::error::{AppError, AppResult, ConfigError, FileError};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

/// 打码方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    /// 手动输入
    Manual,
    /// 2Captcha
    TwoCaptcha,
    /// Anti-Captcha
    AntiCaptcha,
    /// 兼容 OpenAI 接口的视觉模型
    Inference,
}

impl FromStr for SolverKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(SolverKind::Manual),
            "twocaptcha" | "2captcha" => Ok(SolverKind::TwoCaptcha),
            "anticaptcha" | "anti-captcha" => Ok(SolverKind::AntiCaptcha),
            "inference" | "llm" => Ok(SolverKind::Inference),
            other => Err(ConfigError::UnknownSolver(other.to_string())),
        }
    }
}

/// 程序配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 游戏地址
    pub base_url: String,
    /// 登录邮箱
    pub email: String,
    /// 登录密码
    pub password: String,

    // --- 会话池 ---
    /// 会话数量
    pub session_count: usize,
    /// 每个会话重新登录的最大次数
    pub login_retries: usize,
    /// Cookie 保存目录
    pub cookie_dir: String,
    /// 是否从本地浏览器导入 Cookie
    pub import_browser_cookies: bool,
    /// 浏览器调试端口
    pub browser_debug_port: u16,

    // --- 名单扫描 ---
    /// 扫描并发数
    pub scan_workers: usize,
    /// 每个扫描任务负责的页数
    pub scan_chunk_size: u32,
    /// 起始页
    pub first_page: u32,
    /// 结束页，0 表示根据第一页自动检测
    pub last_page: u32,

    // --- 派发 ---
    /// 派发并发数
    pub dispatch_workers: usize,
    /// 每个目标的行动次数上限（成功和失败都计入，验证码错误不计）
    pub action_cap: u32,
    /// 每个目标连续错误次数上限
    pub max_target_errors: u32,
    /// 每个目标验证码答错次数上限
    pub max_wrong_captcha: u32,

    // --- 验证码缓存 ---
    /// 缓存水位，0 表示不使用缓存
    pub cache_size: usize,
    /// 缓存补充连续失败上限
    pub cache_max_failures: usize,
    /// 阻塞等待验证码的超时秒数
    pub captcha_wait_secs: u64,

    // --- 打码 ---
    pub solver: SolverKind,
    pub twocaptcha_key: String,
    pub anticaptcha_key: String,
    pub inference_api_key: String,
    pub inference_api_base_url: String,
    pub inference_model: String,
    /// 手动打码时验证码图片保存位置
    pub manual_captcha_file: String,

    // --- 目标过滤 ---
    /// 最低金币估值
    pub min_gold: Option<u64>,
    /// 最高兵力估值
    pub max_strength: Option<u64>,
    /// 跳过的联盟 ID
    pub skip_alliances: Vec<u64>,
    /// 是否跳过金币未知的目标
    pub skip_unknown_gold: bool,

    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "https://ruinsofchaos.com".to_string(),
            email: String::new(),
            password: String::new(),
            session_count: 4,
            login_retries: 3,
            cookie_dir: "cookies".to_string(),
            import_browser_cookies: false,
            browser_debug_port: 9222,
            scan_workers: 8,
            scan_chunk_size: 5,
            first_page: 1,
            last_page: 0,
            dispatch_workers: 8,
            action_cap: 10,
            max_target_errors: 3,
            max_wrong_captcha: 5,
            cache_size: 3,
            cache_max_failures: 5,
            captcha_wait_secs: 20,
            solver: SolverKind::Manual,
            twocaptcha_key: String::new(),
            anticaptcha_key: String::new(),
            inference_api_key: String::new(),
            inference_api_base_url: "https://api.openai.com/v1".to_string(),
            inference_model: "gpt-4o-mini".to_string(),
            manual_captcha_file: "captcha.png".to_string(),
            min_gold: None,
            max_strength: None,
            skip_alliances: Vec::new(),
            skip_unknown_gold: false,
            verbose_logging: false,
            output_log_file: "output.txt".to_string(),
        }
    }
}

impl Config {
    /// 加载配置：默认值 → TOML 文件 (ROC_CONFIG，默认 roc.toml) → 环境变量
    pub fn load() -> AppResult<Self> {
        let path = std::env::var("ROC_CONFIG").unwrap_or_else(|_| "roc.toml".to_string());
        let base = if Path::new(&path).exists() {
            Self::from_toml_file(&path)?
        } else {
            Self::default()
        };
        let config = base.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件读取，缺失的键使用默认值
    pub fn from_toml_file(path: &str) -> AppResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| AppError::file_read_failed(path, e))?;
        Self::from_toml_str(&content).map_err(|e| match e {
            AppError::File(FileError::TomlParseFailed { source, .. }) => {
                AppError::File(FileError::TomlParseFailed {
                    path: path.to_string(),
                    source,
                })
            }
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// 使用环境变量覆盖配置
    pub fn with_env_overrides(self) -> AppResult<Self> {
        Ok(Self {
            base_url: env_string("ROC_BASE_URL").unwrap_or(self.base_url),
            email: env_string("ROC_EMAIL").unwrap_or(self.email),
            password: env_string("ROC_PASSWORD").unwrap_or(self.password),
            session_count: env_parse("SESSION_COUNT", "usize")?.unwrap_or(self.session_count),
            login_retries: env_parse("LOGIN_RETRIES", "usize")?.unwrap_or(self.login_retries),
            cookie_dir: env_string("COOKIE_DIR").unwrap_or(self.cookie_dir),
            import_browser_cookies: env_parse("IMPORT_BROWSER_COOKIES", "bool")?
                .unwrap_or(self.import_browser_cookies),
            browser_debug_port: env_parse("BROWSER_DEBUG_PORT", "u16")?
                .unwrap_or(self.browser_debug_port),
            scan_workers: env_parse("SCAN_WORKERS", "usize")?.unwrap_or(self.scan_workers),
            scan_chunk_size: env_parse("SCAN_CHUNK_SIZE", "u32")?.unwrap_or(self.scan_chunk_size),
            first_page: env_parse("FIRST_PAGE", "u32")?.unwrap_or(self.first_page),
            last_page: env_parse("LAST_PAGE", "u32")?.unwrap_or(self.last_page),
            dispatch_workers: env_parse("DISPATCH_WORKERS", "usize")?
                .unwrap_or(self.dispatch_workers),
            action_cap: env_parse("ACTION_CAP", "u32")?.unwrap_or(self.action_cap),
            max_target_errors: env_parse("MAX_TARGET_ERRORS", "u32")?
                .unwrap_or(self.max_target_errors),
            max_wrong_captcha: env_parse("MAX_WRONG_CAPTCHA", "u32")?
                .unwrap_or(self.max_wrong_captcha),
            cache_size: env_parse("CACHE_SIZE", "usize")?.unwrap_or(self.cache_size),
            cache_max_failures: env_parse("CACHE_MAX_FAILURES", "usize")?
                .unwrap_or(self.cache_max_failures),
            captcha_wait_secs: env_parse("CAPTCHA_WAIT_SECS", "u64")?
                .unwrap_or(self.captcha_wait_secs),
            solver: match env_string("SOLVER") {
                Some(v) => v.parse()?,
                None => self.solver,
            },
            twocaptcha_key: env_string("TWOCAPTCHA_KEY").unwrap_or(self.twocaptcha_key),
            anticaptcha_key: env_string("ANTICAPTCHA_KEY").unwrap_or(self.anticaptcha_key),
            inference_api_key: env_string("INFERENCE_API_KEY").unwrap_or(self.inference_api_key),
            inference_api_base_url: env_string("INFERENCE_API_BASE_URL")
                .unwrap_or(self.inference_api_base_url),
            inference_model: env_string("INFERENCE_MODEL").unwrap_or(self.inference_model),
            manual_captcha_file: env_string("MANUAL_CAPTCHA_FILE")
                .unwrap_or(self.manual_captcha_file),
            min_gold: env_parse("MIN_GOLD", "u64")?.or(self.min_gold),
            max_strength: env_parse("MAX_STRENGTH", "u64")?.or(self.max_strength),
            skip_alliances: self.skip_alliances,
            skip_unknown_gold: env_parse("SKIP_UNKNOWN_GOLD", "bool")?
                .unwrap_or(self.skip_unknown_gold),
            verbose_logging: env_parse("VERBOSE_LOGGING", "bool")?
                .unwrap_or(self.verbose_logging),
            output_log_file: env_string("OUTPUT_LOG_FILE").unwrap_or(self.output_log_file),
        })
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("session_count", self.session_count),
            ("scan_workers", self.scan_workers),
            ("dispatch_workers", self.dispatch_workers),
            ("scan_chunk_size", self.scan_chunk_size as usize),
            ("action_cap", self.action_cap as usize),
            ("login_retries", self.login_retries),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "必须大于 0".to_string(),
                });
            }
        }
        if self.first_page == 0 {
            return Err(ConfigError::InvalidValue {
                key: "first_page".to_string(),
                reason: "页码从 1 开始".to_string(),
            });
        }
        if self.last_page != 0 && self.last_page < self.first_page {
            return Err(ConfigError::InvalidValue {
                key: "last_page".to_string(),
                reason: format!("不能小于 first_page ({})", self.first_page),
            });
        }
        if self.cache_size > 0 && self.cache_max_failures == 0 {
            return Err(ConfigError::InvalidValue {
                key: "cache_max_failures".to_string(),
                reason: "启用缓存时必须大于 0".to_string(),
            });
        }
        Ok(())
    }

    /// 显式配置的页码范围；结束页为 0 时返回 None
    pub fn page_range(&self) -> Option<(u32, u32)> {
        (self.last_page != 0).then_some((self.first_page, self.last_page))
    }
}

fn env_string(var_name: &str) -> Option<String> {
    std::env::var(var_name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(var_name: &str, expected_type: &str) -> Result<Option<T>, ConfigError> {
    match env_string(var_name) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: var_name.to_string(),
                value,
                expected_type: expected_type.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_partial_uses_defaults() {
        let config = Config::from_toml_str(
            r#"
            email = "someone@example.com"
            session_count = 6
            solver = "twocaptcha"
            skip_alliances = [12, 40]
            "#,
        )
        .unwrap();

        assert_eq!(config.email, "someone@example.com");
        assert_eq!(config.session_count, 6);
        assert_eq!(config.solver, SolverKind::TwoCaptcha);
        assert_eq!(config.skip_alliances, vec![12, 40]);
        assert_eq!(config.cache_size, Config::default().cache_size);
        assert!(config.page_range().is_none());
    }

    #[test]
    fn test_validate_rejects_bad_range() {
        let config = Config {
            first_page: 10,
            last_page: 3,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "last_page"
        ));
    }

    #[test]
    fn test_solver_kind_parse() {
        assert_eq!("2captcha".parse::<SolverKind>().unwrap(), SolverKind::TwoCaptcha);
        assert_eq!("LLM".parse::<SolverKind>().unwrap(), SolverKind::Inference);
        assert!("ocr".parse::<SolverKind>().is_err());
    }
}
