use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastKind {
    Success,
    Error,
    Info,
}

/**
 * \brief 一条临时提示：消息键加可选详情。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub id: u64,
    pub kind: ToastKind,
    pub key: String,
    pub detail: Option<String>,
    pub created_at: Instant,
}

#[derive(Debug, Default)]
struct ToastState {
    next_id: u64,
    toasts: Vec<Toast>,
}

/**
 * \brief 提示容器：多条提示叠加显示，到期自动消失。
 */
#[derive(Debug, Clone)]
pub struct ToastCenter {
    ttl: Duration,
    state: Arc<Mutex<ToastState>>,
}

impl Default for ToastCenter {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

impl ToastCenter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Arc::new(Mutex::new(ToastState::default())),
        }
    }

    pub fn success(&self, key: &str) -> u64 {
        self.push(ToastKind::Success, key, None)
    }

    pub fn info(&self, key: &str, detail: Option<String>) -> u64 {
        self.push(ToastKind::Info, key, detail)
    }

    pub fn error(&self, key: &str, detail: Option<String>) -> u64 {
        self.push(ToastKind::Error, key, detail)
    }

    fn push(&self, kind: ToastKind, key: &str, detail: Option<String>) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.next_id += 1;
        let id = state.next_id;
        state.toasts.push(Toast {
            id,
            kind,
            key: key.to_string(),
            detail,
            created_at: Instant::now(),
        });
        id
    }

    pub fn dismiss(&self, id: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.toasts.retain(|t| t.id != id);
    }

    /**
     * \brief 移除在 `now` 时刻已过期的提示。
     */
    pub fn prune_at(&self, now: Instant) {
        let ttl = self.ttl;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .toasts
            .retain(|t| now.saturating_duration_since(t.created_at) < ttl);
    }

    /**
     * \brief 当前可见的提示，按出现顺序。
     */
    pub fn visible(&self) -> Vec<Toast> {
        self.prune_at(Instant::now());
        self.snapshot()
    }

    pub fn snapshot(&self) -> Vec<Toast> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .toasts
            .clone()
    }

    /**
     * \brief 取出并清空全部提示（CLI 在每条命令后输出）。
     */
    pub fn drain(&self) -> Vec<Toast> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut state.toasts)
    }

    pub fn last_key(&self) -> Option<String> {
        self.snapshot().last().map(|t| t.key.clone())
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.snapshot().iter().any(|t| t.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toasts_stack_and_expire() {
        let center = ToastCenter::new(Duration::from_secs(3));
        let first = center.error("relay_station.create_failed", Some("boom".into()));
        center.success("relay_station.created");
        assert_eq!(center.snapshot().len(), 2);

        let created = center.snapshot()[0].created_at;
        center.prune_at(created + Duration::from_millis(2900));
        assert_eq!(center.snapshot().len(), 2);
        center.prune_at(created + Duration::from_secs(4));
        assert!(center.snapshot().is_empty());

        center.dismiss(first);
        assert!(center.drain().is_empty());
    }

    #[test]
    fn test_dismiss_and_drain() {
        let center = ToastCenter::default();
        let id = center.info("relay_station.synced", None);
        center.error("relay_station.sync_failed", None);
        center.dismiss(id);
        assert_eq!(center.last_key().as_deref(), Some("relay_station.sync_failed"));
        assert_eq!(center.drain().len(), 1);
        assert!(!center.has_key("relay_station.sync_failed"));
    }
}
