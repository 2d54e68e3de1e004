//! 同步任务标签、状态机与事件

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sync_meta::EntityType;

/// 任务去重键：同一实体类型、同一所有者同时至多一个任务
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTag {
    pub entity: EntityType,
    pub owner_id: String,
}

impl SyncTag {
    pub fn new(entity: EntityType, owner_id: impl Into<String>) -> Self {
        Self {
            entity,
            owner_id: owner_id.into(),
        }
    }
}

impl fmt::Display for SyncTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync:{}:{}", self.entity, self.owner_id)
    }
}

/// 任务状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
    Enqueued,
    WaitingForNetwork,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl SyncJobStatus {
    /// 是否为终态（成功/失败/已取消）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncJobStatus::Succeeded | SyncJobStatus::Failed | SyncJobStatus::Cancelled
        )
    }

    /// 验证状态转换是否合法
    ///
    /// 合法转换：
    /// - Enqueued → WaitingForNetwork / Running / Cancelled
    /// - WaitingForNetwork → Running / Cancelled
    /// - Running → Succeeded / Retrying / Failed / Cancelled / WaitingForNetwork（运行中断网）
    /// - Retrying → WaitingForNetwork / Running / Cancelled
    /// - 终态 → 不允许转换
    pub fn can_transition_to(&self, target: SyncJobStatus) -> bool {
        if *self == target {
            return true;
        }
        match self {
            SyncJobStatus::Enqueued => matches!(
                target,
                SyncJobStatus::WaitingForNetwork | SyncJobStatus::Running | SyncJobStatus::Cancelled
            ),
            SyncJobStatus::WaitingForNetwork => {
                matches!(target, SyncJobStatus::Running | SyncJobStatus::Cancelled)
            }
            SyncJobStatus::Running => matches!(
                target,
                SyncJobStatus::Succeeded
                    | SyncJobStatus::Retrying
                    | SyncJobStatus::Failed
                    | SyncJobStatus::Cancelled
                    | SyncJobStatus::WaitingForNetwork
            ),
            SyncJobStatus::Retrying => matches!(
                target,
                SyncJobStatus::WaitingForNetwork | SyncJobStatus::Running | SyncJobStatus::Cancelled
            ),
            SyncJobStatus::Succeeded | SyncJobStatus::Failed | SyncJobStatus::Cancelled => false,
        }
    }
}

/// 任务事件（通过 broadcast 推送给订阅者）
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJobEvent {
    pub job_id: String,
    pub tag: SyncTag,
    pub status: SyncJobStatus,
    /// 已开始的运行次数（从 1 开始；排队时为 0）
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// 已存在周期触发器时的处理策略
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExistingPeriodicPolicy {
    /// 保留已有触发器，忽略新请求
    #[default]
    KeepExisting,
    /// 取消已有触发器并以新间隔重建
    Replace,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            SyncJobStatus::Succeeded,
            SyncJobStatus::Failed,
            SyncJobStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(SyncJobStatus::Running));
            assert!(!terminal.can_transition_to(SyncJobStatus::Enqueued));
        }
    }

    #[test]
    fn test_running_transitions() {
        let running = SyncJobStatus::Running;
        assert!(running.can_transition_to(SyncJobStatus::Retrying));
        assert!(running.can_transition_to(SyncJobStatus::WaitingForNetwork));
        assert!(!running.can_transition_to(SyncJobStatus::Enqueued));
        assert!(!SyncJobStatus::Enqueued.can_transition_to(SyncJobStatus::Succeeded));
        assert!(!SyncJobStatus::Retrying.can_transition_to(SyncJobStatus::Succeeded));
    }

    #[test]
    fn test_tag_display() {
        let tag = SyncTag::new(EntityType::Category, "u1");
        assert_eq!(tag.to_string(), "sync:category:u1");
    }
}
