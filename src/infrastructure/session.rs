//! 会话 - 基础设施层
//!
//! 一个会话就是一个带独立 Cookie 的 HTTP 客户端，只暴露"取页面"的能力

use crate::error::{AppError, AppResult, SessionError};
use reqwest::header::{COOKIE, LOCATION, SET_COOKIE, USER_AGENT};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 5;
/// 每个请求最多尝试的次数
const MAX_ATTEMPTS: usize = 2;
const SERVER_ERROR_BACKOFF: Duration = Duration::from_millis(800);

/// 登录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    LoggedOut,
    LoggingIn,
    LoggedIn,
}

/// Cookie 集合（名称 → 值）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    /// 合并一条 Set-Cookie 头
    pub fn apply_set_cookie(&mut self, header: &str) {
        let Some(pair) = header.split(';').next() else {
            return;
        };
        let Some((name, value)) = pair.split_once('=') else {
            return;
        };
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return;
        }
        let expired = header
            .to_ascii_lowercase()
            .split(';')
            .any(|attr| attr.trim() == "max-age=0");
        if value.is_empty() || value == "deleted" || expired {
            self.cookies.remove(name);
        } else {
            self.cookies.insert(name.to_string(), value.to_string());
        }
    }

    /// 生成 Cookie 请求头
    pub fn header_value(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// 会话
///
/// 职责：
/// - 持有 HTTP 客户端和 Cookie
/// - 维护登录状态机
/// - 连接被重置时用现有 Cookie 重建客户端并重试一次
/// - POST 不是幂等的：只有确定没发出去时才重发，超时和 5xx 不重发
/// - 不认识名单 / 目标
pub struct Session {
    id: usize,
    client: Client,
    timeout: Duration,
    cookies: CookieJar,
    state: LoginState,
}

impl Session {
    /// 创建新的会话
    pub fn new(id: usize) -> AppResult<Self> {
        Self::with_timeout(id, REQUEST_TIMEOUT)
    }

    /// 使用指定的请求超时创建会话
    pub fn with_timeout(id: usize, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            id,
            client: build_client(timeout)?,
            timeout,
            cookies: CookieJar::new(),
            state: LoginState::LoggedOut,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    pub fn set_state(&mut self, state: LoginState) {
        debug!("[会话 {}] 登录状态: {:?} → {:?}", self.id, self.state, state);
        self.state = state;
    }

    pub fn is_logged_in(&self) -> bool {
        self.state == LoginState::LoggedIn
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    /// 替换全部 Cookie
    pub fn replace_cookies(&mut self, cookies: CookieJar) {
        self.cookies = cookies;
    }

    /// GET 页面文本
    pub async fn get(&mut self, url: &str) -> AppResult<String> {
        let response = self.send(Method::GET, url, None).await?;
        Ok(response.text().await?)
    }

    /// GET 二进制内容（验证码图片）
    pub async fn get_bytes(&mut self, url: &str) -> AppResult<Vec<u8>> {
        let response = self.send(Method::GET, url, None).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// POST 表单
    pub async fn post_form(&mut self, url: &str, form: &[(&str, &str)]) -> AppResult<String> {
        let body: Vec<(String, String)> = form
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let response = self.send(Method::POST, url, Some(&body)).await?;
        Ok(response.text().await?)
    }

    /// 发送请求（带重试）
    async fn send(
        &mut self,
        method: Method,
        url: &str,
        form: Option<&[(String, String)]>,
    ) -> AppResult<reqwest::Response> {
        let idempotent = method == Method::GET;
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            // 第一跳收到任何回复后，请求就算已经送达
            let mut delivered = false;
            let result = self
                .send_following_redirects(method.clone(), url, form, &mut delivered)
                .await;
            let resendable = idempotent || (!delivered && result_never_sent(&result));

            match result {
                Ok(response) => return Ok(response),
                Err(e) if !resendable => {
                    if e.is_connection_reset() || e.is_server_error() {
                        warn!(
                            "[会话 {}] {} {} 可能已被服务器处理，不重发: {}",
                            self.id, method, url, e
                        );
                    }
                    return Err(e);
                }
                Err(e) if e.is_connection_reset() => {
                    warn!(
                        "[会话 {}] 连接异常 (尝试 {}/{}), 重建客户端: {}",
                        self.id, attempt, MAX_ATTEMPTS, e
                    );
                    self.client = build_client(self.timeout)?;
                    last_error = Some(e);
                }
                Err(e) if e.is_server_error() => {
                    warn!(
                        "[会话 {}] 服务器错误 (尝试 {}/{}): {}",
                        self.id, attempt, MAX_ATTEMPTS, e
                    );
                    sleep(SERVER_ERROR_BACKOFF * attempt as u32).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::Other(format!("请求 {} 失败", url))))
    }

    /// 手动跟随重定向，确保每一跳的 Set-Cookie 都被记录
    async fn send_following_redirects(
        &mut self,
        mut method: Method,
        url: &str,
        mut form: Option<&[(String, String)]>,
        delivered: &mut bool,
    ) -> AppResult<reqwest::Response> {
        let mut current = reqwest::Url::parse(url).map_err(|e| AppError::request_failed(url, e))?;

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self
                .client
                .request(method.clone(), current.clone())
                .header(USER_AGENT, BROWSER_USER_AGENT);
            if !self.cookies.is_empty() {
                request = request.header(COOKIE, self.cookies.header_value());
            }
            if let Some(body) = form {
                request = request.form(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| AppError::request_failed(current.as_str(), e))?;
            *delivered = true;

            for value in response.headers().get_all(SET_COOKIE) {
                if let Ok(text) = value.to_str() {
                    self.cookies.apply_set_cookie(text);
                }
            }

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                if let Some(location) = location {
                    current = current
                        .join(&location)
                        .map_err(|e| AppError::request_failed(location.clone(), e))?;
                    if status != StatusCode::TEMPORARY_REDIRECT
                        && status != StatusCode::PERMANENT_REDIRECT
                    {
                        method = Method::GET;
                        form = None;
                    }
                    debug!("[会话 {}] 重定向到 {}", self.id, current);
                    continue;
                }
            }

            if status.is_server_error() || status.is_client_error() {
                return Err(SessionError::BadStatus {
                    url: current.to_string(),
                    status: status.as_u16(),
                }
                .into());
            }

            return Ok(response);
        }

        Err(AppError::Other(format!("{} 重定向次数过多", url)))
    }
}

impl Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[会话 {}]", self.id)
    }
}

fn result_never_sent(result: &AppResult<reqwest::Response>) -> bool {
    matches!(result, Err(e) if e.is_never_sent())
}

fn build_client(timeout: Duration) -> AppResult<Client> {
    Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Other(format!("创建 HTTP 客户端失败: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_apply_set_cookie() {
        let mut jar = CookieJar::new();
        jar.apply_set_cookie("PHPSESSID=abc123; path=/; HttpOnly");
        jar.apply_set_cookie("remember=1; Max-Age=3600");
        assert_eq!(jar.get("PHPSESSID"), Some("abc123"));
        assert_eq!(jar.header_value(), "PHPSESSID=abc123; remember=1");

        jar.apply_set_cookie("remember=deleted; expires=Thu, 01 Jan 1970 00:00:01 GMT");
        jar.apply_set_cookie("PHPSESSID=gone; Max-Age=0");
        assert!(jar.is_empty());
    }

    #[tokio::test]
    async fn test_cookies_survive_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login.php"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Set-Cookie", "PHPSESSID=fresh; path=/")
                    .insert_header("Location", "/base.php"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/base.php"))
            .and(header("cookie", "PHPSESSID=fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_string("welcome"))
            .mount(&server)
            .await;

        let mut session = Session::new(1).unwrap();
        let body = session
            .post_form(&format!("{}/login.php", server.uri()), &[("email", "a")])
            .await
            .unwrap();

        assert_eq!(body, "welcome");
        assert_eq!(session.cookies().get("PHPSESSID"), Some("fresh"));
    }

    #[tokio::test]
    async fn test_client_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut session = Session::new(2).unwrap();
        let err = session.get(&format!("{}/missing", server.uri())).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Session(SessionError::BadStatus { status: 404, .. })
        ));
        assert_eq!(received(&server).await, 1);
    }

    async fn received(server: &MockServer) -> usize {
        server.received_requests().await.map(|r| r.len()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_get_retried_once_after_server_error_with_cookies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/base.php"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/base.php"))
            .and(header("cookie", "sid=s3"))
            .respond_with(ResponseTemplate::new(200).set_body_string("base"))
            .mount(&server)
            .await;

        let mut session = Session::new(3).unwrap();
        let mut jar = CookieJar::new();
        jar.insert("sid", "s3");
        session.replace_cookies(jar);

        let body = session.get(&format!("{}/base.php", server.uri())).await.unwrap();
        assert_eq!(body, "base");
        assert_eq!(received(&server).await, 2);
        assert_eq!(session.cookies().get("sid"), Some("s3"));
    }

    #[tokio::test]
    async fn test_get_error_surfaces_after_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let mut session = Session::new(4).unwrap();
        let err = session.get(&format!("{}/base.php", server.uri())).await.unwrap_err();

        assert!(matches!(
            err,
            AppError::Session(SessionError::BadStatus { status: 502, .. })
        ));
        assert_eq!(received(&server).await, 2);
    }

    #[tokio::test]
    async fn test_get_retried_after_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let mut session = Session::with_timeout(5, Duration::from_millis(100)).unwrap();
        let err = session.get(&format!("{}/slow", server.uri())).await.unwrap_err();

        assert!(err.is_connection_reset());
        assert_eq!(received(&server).await, 2);
    }

    #[tokio::test]
    async fn test_action_post_not_resent_after_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/attack.php"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let mut session = Session::with_timeout(6, Duration::from_millis(100)).unwrap();
        let result = session
            .post_form(&format!("{}/attack.php", server.uri()), &[("target", "42")])
            .await;

        assert!(result.is_err());
        assert_eq!(received(&server).await, 1);
    }

    #[tokio::test]
    async fn test_action_post_not_resent_after_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut session = Session::new(7).unwrap();
        let err = session
            .post_form(&format!("{}/attack.php", server.uri()), &[("target", "42")])
            .await
            .unwrap_err();

        assert!(err.is_server_error());
        assert_eq!(received(&server).await, 1);
    }

    #[tokio::test]
    async fn test_post_that_never_connected_is_retried() {
        // 先占一个端口再释放，保证没有人监听
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let mut session = Session::new(8).unwrap();
        let err = session
            .post_form(&format!("http://127.0.0.1:{}/attack.php", port), &[("target", "1")])
            .await
            .unwrap_err();

        assert!(err.is_never_sent());
    }
}
