use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// 名单中的目标玩家
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: u64,
    pub rank: u32,
    pub name: String,
    /// 所属联盟，无联盟为 None
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alliance_id: Option<u64>,
    /// 兵力估值
    pub strength_estimate: u64,
    /// 金币估值，None 表示未知（不等于 0）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gold_estimate: Option<u64>,
    /// 已达到行动上限或服务器给出终止信号
    #[serde(default)]
    pub completed: bool,
}

impl Target {
    pub fn new(id: u64, rank: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            rank,
            name: name.into(),
            alliance_id: None,
            strength_estimate: 0,
            gold_estimate: None,
            completed: false,
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[目标 #{} {} (排名 {})]", self.id, self.name, self.rank)
    }
}

/// 单次派发的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Success,
    Failure,
    WrongCaptcha,
    AdminDetected,
    ActionLimitReached,
    Error(String),
}

impl DispatchResult {
    /// 该结果是否让目标直接完成
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchResult::AdminDetected | DispatchResult::ActionLimitReached
        )
    }
}

impl Display for DispatchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchResult::Success => f.write_str("成功"),
            DispatchResult::Failure => f.write_str("失败"),
            DispatchResult::WrongCaptcha => f.write_str("验证码错误"),
            DispatchResult::AdminDetected => f.write_str("管理员账号"),
            DispatchResult::ActionLimitReached => f.write_str("已达行动上限"),
            DispatchResult::Error(reason) => write!(f, "错误: {}", reason),
        }
    }
}
