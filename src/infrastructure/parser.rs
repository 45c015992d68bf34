//! 页面解析 - 基础设施层
//!
//! 只识别编排需要的少量标记：登录状态、验证码、名单行、行动结果

use crate::error::{AppResult, ScanError};
use crate::models::{
    ActionOutcome, ActionPage, Captcha, CaptchaKind, CaptchaPage, LoginStatus, RosterPage, Target,
    TypedPage,
};
use phf::phf_map;
use regex::Regex;
use std::sync::OnceLock;

/// 要解析的页面类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Status,
    Captcha,
    Roster { page: u32 },
    Action,
}

/// 页面解析器
pub trait PageParser: Send + Sync {
    fn parse(&self, kind: PageKind, raw: &str) -> AppResult<TypedPage>;
}

/// 页面上 `data-captcha-type` 的取值
static CAPTCHA_TYPES: phf::Map<&'static str, CaptchaKind> = phf_map! {
    "img" => CaptchaKind::Image,
    "image" => CaptchaKind::Image,
    "equation" => CaptchaKind::Equation,
    "eq" => CaptchaKind::Equation,
    "cooldown" => CaptchaKind::Cooldown,
    "text" => CaptchaKind::Cooldown,
};

/// 行动结果提示语，按优先级排列（全部小写）
const ACTION_MARKERS: &[(&str, ActionOutcome)] = &[
    ("incorrect number", ActionOutcome::WrongCaptcha),
    ("wrong captcha", ActionOutcome::WrongCaptcha),
    ("administrator", ActionOutcome::AdminDetected),
    ("is an admin", ActionOutcome::AdminDetected),
    ("cannot recon this person", ActionOutcome::ActionLimitReached),
    ("cannot attack this person", ActionOutcome::ActionLimitReached),
    ("maximum number of", ActionOutcome::ActionLimitReached),
    ("recon report", ActionOutcome::Success),
    ("successfully", ActionOutcome::Success),
    ("were caught", ActionOutcome::Failure),
    ("mission failed", ActionOutcome::Failure),
    ("you lost", ActionOutcome::Failure),
];

struct Patterns {
    logout_link: Regex,
    login_form: Regex,
    captcha_type: Regex,
    captcha_hash: Regex,
    captcha_image: Regex,
    equation: Regex,
    total_pages: Regex,
    row: Regex,
    rank: Regex,
    name: Regex,
    alliance: Regex,
    strength: Regex,
    gold: Regex,
    message: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).unwrap_or_else(|e| panic!("内置正则无效 {}: {}", p, e));
        Patterns {
            logout_link: re(r#"href="[^"]*logout\.php"#),
            login_form: re(r#"name="password""#),
            captcha_type: re(r#"data-captcha-type="([a-z]+)""#),
            captcha_hash: re(r#"name="captcha"\s+value="([^"]+)""#),
            captcha_image: re(r#"src="([^"]*imgcap\.php\?hash=([0-9A-Za-z]+)[^"]*)""#),
            equation: re(r#"class="captcha-equation"[^>]*>([^<]+)<"#),
            total_pages: re(r"(?i)page\s+\d+\s+of\s+(\d+)"),
            row: re(r#"(?s)<tr[^>]*data-userid="(\d+)"[^>]*>(.*?)</tr>"#),
            rank: re(r#"class="rank"[^>]*>\s*([\d,]+)"#),
            name: re(r#"stats\.php\?id=\d+"[^>]*>([^<]+)<"#),
            alliance: re(r#"alliance\.php\?id=(\d+)"#),
            strength: re(r#"class="tff"[^>]*>\s*([\d,]+)"#),
            gold: re(r#"class="gold"[^>]*>\s*([\d,]+|\?+)"#),
            message: re(r#"(?s)class="(?:report|message|error)"[^>]*>(.*?)</"#),
        }
    })
}

fn parse_number(text: &str) -> Option<u64> {
    text.replace(',', "").trim().parse().ok()
}

/// 基于标记的解析器
#[derive(Debug, Default, Clone)]
pub struct MarkerPageParser;

impl MarkerPageParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_status(&self, raw: &str) -> LoginStatus {
        let p = patterns();
        LoginStatus {
            logged_in: p.logout_link.is_match(raw) && !p.login_form.is_match(raw),
        }
    }

    fn parse_captcha(&self, raw: &str) -> CaptchaPage {
        let p = patterns();

        let image = p.captcha_image.captures(raw);
        let declared = p
            .captcha_type
            .captures(raw)
            .and_then(|c| CAPTCHA_TYPES.get(&c[1]).copied());
        let kind = match declared {
            Some(kind) => kind,
            None if image.is_some() => CaptchaKind::Image,
            None if p.equation.is_match(raw) => CaptchaKind::Equation,
            None => {
                return CaptchaPage {
                    captcha: None,
                    image_url: None,
                }
            }
        };

        let id = p
            .captcha_hash
            .captures(raw)
            .map(|c| c[1].to_string())
            .or_else(|| image.as_ref().map(|c| c[2].to_string()))
            .unwrap_or_else(|| "cooldown".to_string());

        let payload = match kind {
            CaptchaKind::Equation => p
                .equation
                .captures(raw)
                .map(|c| c[1].trim().as_bytes().to_vec()),
            _ => None,
        };

        CaptchaPage {
            captcha: Some(Captcha::new(id, kind, payload)),
            image_url: image.map(|c| c[1].replace("&amp;", "&")),
        }
    }

    fn parse_roster(&self, page: u32, raw: &str) -> RosterPage {
        let p = patterns();
        let total_pages = p
            .total_pages
            .captures(raw)
            .and_then(|c| c[1].parse().ok());

        let entries: Vec<Target> = p
            .row
            .captures_iter(raw)
            .filter_map(|row| {
                let id = row[1].parse().ok()?;
                let body = &row[2];
                let rank = p
                    .rank
                    .captures(body)
                    .and_then(|c| parse_number(&c[1]))
                    .unwrap_or(0) as u32;
                let name = p
                    .name
                    .captures(body)
                    .map(|c| c[1].trim().to_string())
                    .unwrap_or_default();
                let mut target = Target::new(id, rank, name);
                target.alliance_id = p.alliance.captures(body).and_then(|c| c[1].parse().ok());
                target.strength_estimate = p
                    .strength
                    .captures(body)
                    .and_then(|c| parse_number(&c[1]))
                    .unwrap_or(0);
                // "???" 表示金币未知
                target.gold_estimate = p.gold.captures(body).and_then(|c| parse_number(&c[1]));
                Some(target)
            })
            .collect();

        let out_of_range = entries.is_empty()
            || total_pages.map(|total| page > total).unwrap_or(false);

        RosterPage {
            page,
            total_pages,
            entries,
            out_of_range,
        }
    }

    fn parse_action(&self, raw: &str) -> ActionPage {
        let p = patterns();
        let message = p
            .message
            .captures(raw)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_default();
        let lowered = raw.to_ascii_lowercase();

        let outcome = ACTION_MARKERS
            .iter()
            .find(|(marker, _)| lowered.contains(marker))
            .map(|(_, outcome)| *outcome)
            .unwrap_or_else(|| {
                if self.parse_status(raw).logged_in {
                    ActionOutcome::Unknown
                } else if p.login_form.is_match(raw) {
                    ActionOutcome::LoggedOut
                } else {
                    ActionOutcome::Unknown
                }
            });

        ActionPage { outcome, message }
    }
}

impl PageParser for MarkerPageParser {
    fn parse(&self, kind: PageKind, raw: &str) -> AppResult<TypedPage> {
        Ok(match kind {
            PageKind::Status => TypedPage::Status(self.parse_status(raw)),
            PageKind::Captcha => TypedPage::Captcha(self.parse_captcha(raw)),
            PageKind::Roster { page } => {
                if raw.trim().is_empty() {
                    return Err(ScanError::PageParseFailed {
                        page,
                        reason: "页面为空".to_string(),
                    }
                    .into());
                }
                TypedPage::Roster(self.parse_roster(page, raw))
            }
            PageKind::Action => TypedPage::Action(self.parse_action(raw)),
        })
    }
}
