//! # ROC Automation
//!
//! 浏览器游戏自动化的编排核心：多会话登录、验证码缓存、名单扫描和并发派发
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源（HTTP 会话），只暴露能力
//! - `Session` - Cookie、登录状态、带重试的请求
//! - `PageParser` - 原始页面 → 类型化页面
//! - `CookieStore` - Cookie 持久化
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"
//! - `SessionPool` - 登录与借出会话
//! - `CaptchaCache` / `CacheRefiller` - 验证码缓存与补充
//! - `CaptchaSolver` - 各种打码方式
//! - `TargetFilter` - 目标过滤
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"对一个目标行动一次"的完整流程
//! - `DispatchCtx` - 上下文封装（工人 + 目标 + 第几次）
//! - `DispatchFlow` - 流程编排（取验证码 → 提交 → 归类 → 反馈）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/app` - 阶段推进与终止判定
//! - `orchestrator/roster_scanner` - 并发扫描名单
//! - `orchestrator/dispatcher` - 并发派发与目标状态机
//!
//! ## 模块结构

pub mod browser;
pub mod clients;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use clients::{GameClient, RocWebClient};
pub use config::{Config, SolverKind};
pub use error::{AppError, AppResult};
pub use infrastructure::{CookieStore, Session};
pub use models::{Captcha, CaptchaKind, DispatchResult, Target};
pub use orchestrator::{App, RunSummary};
pub use services::{CaptchaCache, CaptchaSolver, SessionPool};
pub use workflow::{DispatchCtx, DispatchFlow};
