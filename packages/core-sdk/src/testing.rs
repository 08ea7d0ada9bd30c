//! 测试替身：按命令脚本化的 `Invoke`、可控延迟的 `Prober` 与内存后端。

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::{
    backend::{settings_file::SettingsFile, store, LocalBackend},
    bridge::Invoke,
    probe::{ProbeOutcome, Prober},
    telemetry::Telemetry,
};

type Responder = Box<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

#[derive(Default)]
pub struct ScriptedInvoke {
    responders: Mutex<HashMap<String, Responder>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedInvoke {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond<F>(&self, command: &str, f: F)
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        self.respond_with(command, move |_| f());
    }

    pub fn respond_with<F>(&self, command: &str, f: F)
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.responders
            .lock()
            .unwrap()
            .insert(command.to_string(), Box::new(f));
    }

    /// 调用方必须 `notify_one()` 后该命令才返回。
    pub fn gate(&self, command: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(command.to_string(), notify.clone());
        notify
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == command)
            .count()
    }
}

#[async_trait]
impl Invoke for ScriptedInvoke {
    async fn invoke(&self, command: &str, payload: Value) -> Result<Value> {
        self.calls
            .lock()
            .unwrap()
            .push((command.to_string(), payload.clone()));
        let gate = self.gates.lock().unwrap().get(command).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let guard = self.responders.lock().unwrap();
        match guard.get(command) {
            Some(f) => f(&payload),
            None => Err(anyhow!("no scripted response for {}", command)),
        }
    }
}

/// 按 URL 配置延迟与结果的探测器；未配置的 URL 视为不可达。
#[derive(Default)]
pub struct ScriptedProber {
    routes: HashMap<String, (Duration, bool)>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, url: &str, delay_ms: u64, reachable: bool) -> Self {
        self.routes
            .insert(url.to_string(), (Duration::from_millis(delay_ms), reachable));
        self
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, url: &str, _timeout: Duration) -> ProbeOutcome {
        match self.routes.get(url) {
            Some((delay, reachable)) => {
                tokio::time::sleep(*delay).await;
                if *reachable {
                    ProbeOutcome::Reachable { status: Some(200) }
                } else {
                    ProbeOutcome::Unreachable("connection refused".to_string())
                }
            }
            None => ProbeOutcome::Unreachable("unknown host".to_string()),
        }
    }
}

/// 内存 SQLite + 临时目录中的 settings.json。
pub fn memory_backend(claude_dir: &Path) -> LocalBackend {
    let conn = rusqlite::Connection::open_in_memory().expect("open in-memory db");
    store::migrate(&conn).expect("migrate");
    LocalBackend::new(
        conn,
        SettingsFile::new(claude_dir.join("settings.json")),
        Arc::new(ScriptedProber::new()),
        Telemetry::disabled(),
    )
    .expect("build backend")
}

pub fn station_json(id: &str, adapter: &str, enabled: bool) -> Value {
    json!({
        "id": id,
        "name": format!("station {}", id),
        "description": null,
        "api_url": "https://relay.example.com",
        "adapter": adapter,
        "auth_method": "bearer_token",
        "system_token": "sk-test-token",
        "user_id": null,
        "adapter_config": null,
        "enabled": enabled,
        "display_order": 0,
        "created_at": 1,
        "updated_at": 1
    })
}
