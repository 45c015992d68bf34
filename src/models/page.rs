//! 页面模型
//!
//! 每种页面一个变体，由解析器产出

use crate::models::{Captcha, Target};

/// 解析后的页面
#[derive(Debug, Clone)]
pub enum TypedPage {
    /// 任意页面上的登录状态
    Status(LoginStatus),
    /// 带验证码的页面
    Captcha(CaptchaPage),
    /// 名单页
    Roster(RosterPage),
    /// 行动结果页
    Action(ActionPage),
}

/// 登录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginStatus {
    pub logged_in: bool,
}

/// 验证码页面
#[derive(Debug, Clone)]
pub struct CaptchaPage {
    /// 页面没有验证码时为 None
    pub captcha: Option<Captcha>,
    /// 验证码图片地址（需要单独下载）
    pub image_url: Option<String>,
}

/// 名单页
#[derive(Debug, Clone, Default)]
pub struct RosterPage {
    pub page: u32,
    /// 页面上标注的总页数
    pub total_pages: Option<u32>,
    pub entries: Vec<Target>,
    /// 页码超出范围或结构异常
    pub out_of_range: bool,
}

/// 行动结果页
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPage {
    pub outcome: ActionOutcome,
    /// 原始提示文本（用于日志）
    pub message: String,
}

/// 服务器对一次行动的回复
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Success,
    Failure,
    WrongCaptcha,
    AdminDetected,
    ActionLimitReached,
    /// 需要重新登录
    LoggedOut,
    /// 无法识别的回复
    Unknown,
}
