//! 派发上下文
//!
//! 封装"哪个工人在第几次处理哪个目标"这一信息

use crate::models::Target;
use std::fmt::Display;

/// 派发上下文
#[derive(Debug, Clone)]
pub struct DispatchCtx {
    /// 工人编号（仅用于日志显示）
    pub worker: usize,

    pub target: Target,

    /// 本目标的第几次尝试（从1开始）
    pub attempt: u32,
}

impl DispatchCtx {
    pub fn new(worker: usize, target: Target) -> Self {
        Self {
            worker,
            target,
            attempt: 0,
        }
    }

    /// 进入下一次尝试
    pub fn next_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }
}

impl Display for DispatchCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[工人 {} 目标 #{} 第 {} 次]",
            self.worker, self.target.id, self.attempt
        )
    }
}
