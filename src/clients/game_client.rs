/// 游戏客户端
///
/// 把"会话取页面"和"解析页面"组合成编排层需要的操作
use crate::error::{AppError, AppResult, CaptchaError};
use crate::infrastructure::{MarkerPageParser, PageKind, PageParser, Session};
use crate::models::{ActionPage, Captcha, CaptchaKind, RosterPage, Target, TypedPage};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// 游戏操作
///
/// 所有操作都在调用方借出的会话上执行
#[async_trait]
pub trait GameClient: Send + Sync {
    /// 探测当前 Cookie 是否处于登录状态
    async fn check_login(&self, session: &mut Session) -> AppResult<bool>;

    /// 使用账号密码登录
    async fn login(&self, session: &mut Session) -> AppResult<bool>;

    /// 获取一个新的验证码（图片验证码会一并下载图片）
    async fn fetch_captcha(&self, session: &mut Session) -> AppResult<Captcha>;

    /// 获取名单的某一页
    async fn roster_page(&self, session: &mut Session, page: u32) -> AppResult<RosterPage>;

    /// 对目标提交一次行动
    async fn submit_action(
        &self,
        session: &mut Session,
        target: &Target,
        captcha: Option<&Captcha>,
    ) -> AppResult<ActionPage>;
}

/// 登录凭据
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

/// 基于 HTTP 的游戏客户端
pub struct RocWebClient {
    base_url: String,
    credentials: Credentials,
    parser: Arc<dyn PageParser>,
}

impl RocWebClient {
    /// 创建新的游戏客户端
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self::with_parser(base_url, credentials, Arc::new(MarkerPageParser::new()))
    }

    /// 使用自定义解析器创建
    pub fn with_parser(
        base_url: impl Into<String>,
        credentials: Credentials,
        parser: Arc<dyn PageParser>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            parser,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn parse(&self, kind: PageKind, raw: &str) -> AppResult<TypedPage> {
        self.parser.parse(kind, raw)
    }

    fn unexpected(kind: PageKind, page: &TypedPage) -> AppError {
        AppError::Other(format!("解析器对 {:?} 返回了 {:?}", kind, page))
    }
}

#[async_trait]
impl GameClient for RocWebClient {
    async fn check_login(&self, session: &mut Session) -> AppResult<bool> {
        let raw = session.get(&self.url("base.php")).await?;
        match self.parse(PageKind::Status, &raw)? {
            TypedPage::Status(status) => Ok(status.logged_in),
            other => Err(Self::unexpected(PageKind::Status, &other)),
        }
    }

    async fn login(&self, session: &mut Session) -> AppResult<bool> {
        let raw = session
            .post_form(
                &self.url("login.php"),
                &[
                    ("email", self.credentials.email.as_str()),
                    ("password", self.credentials.password.as_str()),
                ],
            )
            .await?;
        match self.parse(PageKind::Status, &raw)? {
            TypedPage::Status(status) => Ok(status.logged_in),
            other => Err(Self::unexpected(PageKind::Status, &other)),
        }
    }

    async fn fetch_captcha(&self, session: &mut Session) -> AppResult<Captcha> {
        let raw = session.get(&self.url("attack.php")).await?;
        let page = match self.parse(PageKind::Captcha, &raw)? {
            TypedPage::Captcha(page) => page,
            other => return Err(Self::unexpected(PageKind::Captcha, &other)),
        };
        let captcha = page.captcha.ok_or(CaptchaError::NotPresent)?;

        if captcha.kind() != CaptchaKind::Image {
            return Ok(captcha);
        }

        let image_url = page
            .image_url
            .map(|u| self.url(&u))
            .unwrap_or_else(|| self.url(&format!("imgcap.php?hash={}", captcha.id())));
        let bytes = session.get_bytes(&image_url).await?;
        debug!("{} 下载验证码图片 {} 字节", session, bytes.len());

        Ok(Captcha::with_created_at(
            captcha.id(),
            CaptchaKind::Image,
            Some(bytes),
            captcha.created_at(),
        ))
    }

    async fn roster_page(&self, session: &mut Session, page: u32) -> AppResult<RosterPage> {
        let raw = session
            .get(&self.url(&format!("battlefield.php?page={}", page)))
            .await?;
        let kind = PageKind::Roster { page };
        match self.parse(kind, &raw)? {
            TypedPage::Roster(roster) => Ok(roster),
            other => Err(Self::unexpected(kind, &other)),
        }
    }

    async fn submit_action(
        &self,
        session: &mut Session,
        target: &Target,
        captcha: Option<&Captcha>,
    ) -> AppResult<ActionPage> {
        let defender = target.id.to_string();
        let mut form: Vec<(&str, &str)> = vec![
            ("defender_id", defender.as_str()),
            ("mission_type", "recon"),
            ("reconspies", "1"),
        ];
        if let Some(captcha) = captcha {
            form.push(("captcha", captcha.id()));
            if let Some(answer) = captcha.answer() {
                form.push(("coordinates", answer));
            }
        }

        let raw = session
            .post_form(&self.url(&format!("attack.php?id={}", target.id)), &form)
            .await?;
        match self.parse(PageKind::Action, &raw)? {
            TypedPage::Action(page) => Ok(page),
            other => Err(Self::unexpected(PageKind::Action, &other)),
        }
    }
}
