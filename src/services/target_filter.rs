//! 目标过滤
//!
//! 扫描结果在派发前经过这里，配置规则和自定义条件同时满足才保留

use crate::config::Config;
use crate::models::Target;
use std::collections::HashSet;
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&Target) -> bool + Send + Sync>;

/// 目标过滤器
#[derive(Clone, Default)]
pub struct TargetFilter {
    min_gold: Option<u64>,
    max_strength: Option<u64>,
    skip_alliances: HashSet<u64>,
    skip_unknown_gold: bool,
    custom: Option<Predicate>,
}

impl TargetFilter {
    /// 不过滤任何目标
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            min_gold: config.min_gold,
            max_strength: config.max_strength,
            skip_alliances: config.skip_alliances.iter().copied().collect(),
            skip_unknown_gold: config.skip_unknown_gold,
            custom: None,
        }
    }

    /// 追加自定义条件
    pub fn with_predicate(mut self, predicate: impl Fn(&Target) -> bool + Send + Sync + 'static) -> Self {
        self.custom = Some(Arc::new(predicate));
        self
    }

    pub fn accepts(&self, target: &Target) -> bool {
        if let Some(alliance) = target.alliance_id {
            if self.skip_alliances.contains(&alliance) {
                return false;
            }
        }
        if let Some(max) = self.max_strength {
            if target.strength_estimate > max {
                return false;
            }
        }
        // 金币未知时只看 skip_unknown_gold
        match (self.min_gold, target.gold_estimate) {
            (_, None) if self.skip_unknown_gold => return false,
            (Some(min), Some(gold)) if gold < min => return false,
            _ => {}
        }
        self.custom.as_ref().map_or(true, |p| p(target))
    }

    /// 过滤并返回 (保留的, 跳过的数量)
    pub fn apply(&self, targets: Vec<Target>) -> (Vec<Target>, usize) {
        let before = targets.len();
        let kept: Vec<Target> = targets.into_iter().filter(|t| self.accepts(t)).collect();
        let skipped = before - kept.len();
        (kept, skipped)
    }
}
