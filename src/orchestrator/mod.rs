//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责并发调度和阶段推进，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `app` - 应用主流程
//! - 管理运行生命周期：会话池 → 缓存预热 → 扫描 → 过滤 → 派发 → 汇总
//! - 判定终止原因（无会话、无目标、缓存饥饿）
//! - 处理停止信号
//!
//! ### `roster_scanner` - 名单扫描器
//! - 页码范围切块，Semaphore 限制并发
//! - 汇总、去重目标
//!
//! ### `dispatcher` - 派发器
//! - 共享队列 + 固定数量的工人
//! - 目标状态机与完成登记
//!
//! ## 层次关系
//!
//! ```text
//! app (阶段推进)
//!     ↓
//! roster_scanner / dispatcher (并发调度)
//!     ↓
//! workflow::DispatchFlow (单次行动)
//!     ↓
//! services (能力层：会话池 / 验证码缓存 / 打码 / 过滤)
//!     ↓
//! infrastructure (基础设施：Session / 解析器 / Cookie 存储)
//! ```

pub mod app;
pub mod dispatcher;
pub mod roster_scanner;

// 重新导出主要类型
pub use app::{App, FatalCause, RunSummary};
pub use dispatcher::{
    CompletionRegistry, DispatchReport, DispatchSettings, DispatchStats, Dispatcher, TargetState,
};
pub use roster_scanner::{RosterScanner, ScanReport, ScanSettings};
