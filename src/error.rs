use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 会话相关错误
    #[error("会话错误: {0}")]
    Session(#[from] SessionError),
    /// 验证码相关错误
    #[error("验证码错误: {0}")]
    Captcha(#[from] CaptchaError),
    /// 打码服务错误
    #[error("打码服务错误: {0}")]
    Solver(#[from] SolverError),
    /// 名单扫描错误
    #[error("扫描错误: {0}")]
    Scan(#[from] ScanError),
    /// 文件操作错误
    #[error("文件错误: {0}")]
    File(#[from] FileError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 会话相关错误
#[derive(Debug, Error)]
pub enum SessionError {
    /// 网络请求失败
    #[error("请求 {url} 失败: {source}")]
    RequestFailed { url: String, source: BoxedSource },
    /// 服务器返回错误状态码
    #[error("请求 {url} 返回状态码 {status}")]
    BadStatus { url: String, status: u16 },
    /// 会话池中没有可用会话
    #[error("会话池为空，没有可用的已登录会话")]
    PoolExhausted,
    /// 浏览器 Cookie 导入失败
    #[error("从浏览器导入 Cookie 失败 (端口: {port}): {source}")]
    BrowserImportFailed { port: u16, source: BoxedSource },
}

/// 验证码相关错误
#[derive(Debug, Error)]
pub enum CaptchaError {
    /// 页面上没有找到验证码
    #[error("页面上没有验证码")]
    NotPresent,
    /// 算式无法解析
    #[error("无法解析算式: {expression}")]
    BadEquation { expression: String },
}

/// 打码服务错误
#[derive(Debug, Error)]
pub enum SolverError {
    /// API 调用失败
    #[error("打码 API 调用失败 ({service}): {source}")]
    ApiCallFailed { service: String, source: BoxedSource },
    /// API 返回错误响应
    #[error("打码 API 返回错误 ({service}): {message}")]
    BadResponse { service: String, message: String },
    /// 超过轮询次数仍未得到答案
    #[error("打码服务 {service} 超时，已轮询 {polls} 次")]
    Timeout { service: String, polls: usize },
    /// 返回内容无法解析为答案
    #[error("无法解析打码结果: {response}")]
    UnparsableAnswer { response: String },
    /// 验证码缺少图片内容
    #[error("验证码 {captcha_id} 没有图片内容")]
    MissingPayload { captcha_id: String },
    /// 手动输入失败
    #[error("读取手动输入失败: {source}")]
    InputFailed { source: BoxedSource },
}

/// 名单扫描错误
#[derive(Debug, Error)]
pub enum ScanError {
    /// 页面解析失败
    #[error("第 {page} 页解析失败: {reason}")]
    PageParseFailed { page: u32, reason: String },
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    /// 读取文件失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed { path: String, source: BoxedSource },
    /// 写入文件失败
    #[error("写入文件失败 ({path}): {source}")]
    WriteFailed { path: String, source: BoxedSource },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed { path: String, source: BoxedSource },
    /// JSON 解析失败
    #[error("JSON解析失败 ({path}): {source}")]
    JsonParseFailed { path: String, source: BoxedSource },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置值无效
    #[error("配置项 {key} 无效: {reason}")]
    InvalidValue { key: String, reason: String },
    /// 未知的打码方式
    #[error("未知的打码方式: {0}")]
    UnknownSolver(String),
}

// ========== 从常见错误类型转换 ==========

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        AppError::Session(SessionError::RequestFailed {
            url,
            source: Box::new(err),
        })
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::File(FileError::JsonParseFailed {
            path: String::new(),
            source: Box::new(err),
        })
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::File(FileError::TomlParseFailed {
            path: String::new(), // TOML错误通常不包含路径信息
            source: Box::new(err),
        })
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::File(FileError::ReadFailed {
            path: String::new(),
            source: Box::new(err),
        })
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建请求失败错误
    pub fn request_failed(
        url: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::Session(SessionError::RequestFailed {
            url: url.into(),
            source: Box::new(source),
        })
    }

    /// 创建打码 API 调用错误
    pub fn solver_api_failed(
        service: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::Solver(SolverError::ApiCallFailed {
            service: service.into(),
            source: Box::new(source),
        })
    }

    /// 创建文件读取错误
    pub fn file_read_failed(
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::File(FileError::ReadFailed {
            path: path.into(),
            source: Box::new(source),
        })
    }

    /// 创建文件写入错误
    pub fn file_write_failed(
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::File(FileError::WriteFailed {
            path: path.into(),
            source: Box::new(source),
        })
    }

    /// 是否是连接被重置/断开一类的错误，可以重建客户端后重试
    pub fn is_connection_reset(&self) -> bool {
        match self {
            AppError::Session(SessionError::RequestFailed { source, .. }) => source
                .downcast_ref::<reqwest::Error>()
                .map(|e| e.is_connect() || e.is_timeout() || e.is_request())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// 请求是否确定没有到达服务器（连接没建立起来），非幂等请求只有这种情况可以重发
    pub fn is_never_sent(&self) -> bool {
        match self {
            AppError::Session(SessionError::RequestFailed { source, .. }) => source
                .downcast_ref::<reqwest::Error>()
                .map(|e| e.is_connect())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// 是否是服务器临时错误 (5xx)
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            AppError::Session(SessionError::BadStatus { status, .. }) if *status >= 500
        )
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
