use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures_util::StreamExt;
use tokio::task::JoinHandle;

use crate::{
    bridge::CommandBridge,
    config::{FailoverPacing, NODE_TEST_TIMEOUT_MS},
    form::StationForm,
    models::{
        Adapter, ConnectionTestResult, CurrentConfig, ImportRelayStationsRequest, ImportResult,
        PackycodeUserQuota, RelayStation, StationInfo, StationUserInfo,
    },
    probe::{probe_stream, select_fastest, NodeCandidate, ProbeBoard, Prober},
    telemetry::Telemetry,
    toast::ToastCenter,
};

/**
 * \brief 等待用户确认的删除目标。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelete {
    pub id: String,
    pub name: String,
}

/**
 * \brief 自动选节点弹窗：测速面板与最终选中的节点。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverView {
    pub open: bool,
    pub board: ProbeBoard,
    pub winner: Option<NodeCandidate>,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    stations: Vec<RelayStation>,
    current_config: CurrentConfig,
    loading: bool,
    toggling: HashSet<String>,
    quotas: HashMap<String, PackycodeUserQuota>,
    quota_loading: HashSet<String>,
    connections: HashMap<String, ConnectionTestResult>,
    create_open: bool,
    editing: Option<String>,
    pending_delete: Option<PendingDelete>,
    failover: FailoverView,
}

fn station_ids(stations: &[RelayStation]) -> HashSet<String> {
    stations.iter().map(|s| s.id.clone()).collect()
}

/** \brief 决定额度归属的字段：PackyCode 中转站的 ID、地址与令牌。 */
fn quota_keys(stations: &[RelayStation]) -> HashSet<(String, String, String)> {
    stations
        .iter()
        .filter(|s| s.adapter == Adapter::Packycode)
        .map(|s| (s.id.clone(), s.api_url.clone(), s.system_token.clone()))
        .collect()
}

/**
 * \brief 中转站协调器。
 * \details 持有后端列表的副本与对话框状态；所有后端失败都转为提示，不向调用方返回错误。
 * 克隆后共享同一份状态，锁不会跨越 await 持有。
 */
#[derive(Clone)]
pub struct StationCoordinator {
    bridge: Arc<dyn CommandBridge>,
    prober: Arc<dyn Prober>,
    toasts: ToastCenter,
    telemetry: Telemetry,
    pacing: FailoverPacing,
    probe_timeout: Duration,
    state: Arc<Mutex<CoordinatorState>>,
}

impl StationCoordinator {
    pub fn new(
        bridge: Arc<dyn CommandBridge>,
        prober: Arc<dyn Prober>,
        toasts: ToastCenter,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            bridge,
            prober,
            toasts,
            telemetry,
            pacing: FailoverPacing::default(),
            probe_timeout: Duration::from_millis(NODE_TEST_TIMEOUT_MS),
            state: Arc::new(Mutex::new(CoordinatorState::default())),
        }
    }

    pub fn with_pacing(mut self, pacing: FailoverPacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn toasts(&self) -> &ToastCenter {
        &self.toasts
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, key: &str, operation: &str, err: anyhow::Error) {
        self.telemetry
            .log_error("station", &format!("{} failed: {:#}", operation, err));
        self.toasts.error(key, Some(err.to_string()));
    }

    pub fn stations(&self) -> Vec<RelayStation> {
        self.state().stations.clone()
    }

    pub fn current_config(&self) -> CurrentConfig {
        self.state().current_config.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state().loading
    }

    pub fn is_toggling(&self, id: &str) -> bool {
        self.state().toggling.contains(id)
    }

    pub fn quota(&self, id: &str) -> Option<PackycodeUserQuota> {
        self.state().quotas.get(id).cloned()
    }

    pub fn is_quota_loading(&self, id: &str) -> bool {
        self.state().quota_loading.contains(id)
    }

    pub fn connection(&self, id: &str) -> Option<ConnectionTestResult> {
        self.state().connections.get(id).cloned()
    }

    pub fn failover_view(&self) -> FailoverView {
        self.state().failover.clone()
    }

    pub fn is_create_open(&self) -> bool {
        self.state().create_open
    }

    pub fn editing(&self) -> Option<String> {
        self.state().editing.clone()
    }

    pub fn pending_delete(&self) -> Option<PendingDelete> {
        self.state().pending_delete.clone()
    }

    pub fn open_create(&self) -> StationForm {
        self.state().create_open = true;
        StationForm::new(Adapter::Packycode)
    }

    pub fn close_create(&self) {
        self.state().create_open = false;
    }

    /**
     * \brief 打开编辑对话框，返回以该中转站填充的表单。
     */
    pub fn open_edit(&self, id: &str) -> Option<StationForm> {
        let mut state = self.state();
        let form = state
            .stations
            .iter()
            .find(|s| s.id == id)
            .map(StationForm::from_station)?;
        state.editing = Some(id.to_string());
        Some(form)
    }

    pub fn close_edit(&self) {
        self.state().editing = None;
    }

    /**
     * \brief 拉取中转站列表；失败时保留旧列表。
     * \details ID 集合变化，或任一 PackyCode 中转站的地址、令牌、适配器变化时，
     * 为每个 PackyCode 中转站后台刷新额度。已删除或账户变化的中转站的额度缓存会被丢弃。
     */
    pub async fn list(&self) -> bool {
        self.state().loading = true;
        let result = self.bridge.list_stations().await;
        let changed = {
            let mut state = self.state();
            state.loading = false;
            match &result {
                Ok(stations) => {
                    let before_ids = station_ids(&state.stations);
                    let after_ids = station_ids(stations);
                    let before_keys = quota_keys(&state.stations);
                    let after_keys = quota_keys(stations);

                    let unchanged: HashSet<&str> = after_keys
                        .intersection(&before_keys)
                        .map(|(id, _, _)| id.as_str())
                        .collect();
                    state.quotas.retain(|id, _| unchanged.contains(id.as_str()));
                    state.quota_loading.retain(|id| after_ids.contains(id));
                    state.connections.retain(|id, _| after_ids.contains(id));

                    state.stations = stations.clone();
                    before_ids != after_ids || before_keys != after_keys
                }
                Err(_) => false,
            }
        };
        match result {
            Ok(_) => {
                if changed {
                    self.refresh_all_quotas();
                }
                true
            }
            Err(err) => {
                self.fail("relay_station.list_failed", "list stations", err);
                false
            }
        }
    }

    pub async fn create(&self, form: &StationForm) -> bool {
        if let Err(err) = form.validate() {
            self.toasts.error(err.key(), None);
            return false;
        }
        match self.bridge.create_station(&form.to_create_request()).await {
            Ok(station) => {
                self.telemetry.log_event(
                    "station",
                    &format!("created id={} adapter={}", station.id, station.adapter),
                );
                self.toasts.success("relay_station.created");
                self.close_create();
                self.list().await;
                true
            }
            Err(err) => {
                self.fail("relay_station.create_failed", "create station", err);
                false
            }
        }
    }

    /**
     * \brief 保存当前编辑目标；校验不通过时不会调用后端。
     */
    pub async fn update(&self, form: &StationForm) -> bool {
        if let Err(err) = form.validate() {
            self.toasts.error(err.key(), None);
            return false;
        }
        let Some(id) = self.editing() else {
            self.toasts.error("relay_station.update_failed", None);
            return false;
        };
        match self.bridge.update_station(&form.to_update_request(&id)).await {
            Ok(_) => {
                self.telemetry
                    .log_event("station", &format!("updated id={}", id));
                self.toasts.success("relay_station.updated");
                self.close_edit();
                self.list().await;
                true
            }
            Err(err) => {
                self.fail("relay_station.update_failed", "update station", err);
                false
            }
        }
    }

    /**
     * \brief 打开删除确认；未知中转站返回 false。
     */
    pub fn request_delete(&self, id: &str) -> bool {
        let mut state = self.state();
        let target = state
            .stations
            .iter()
            .find(|s| s.id == id)
            .map(|s| PendingDelete {
                id: s.id.clone(),
                name: s.name.clone(),
            });
        let found = target.is_some();
        if found {
            state.pending_delete = target;
        }
        found
    }

    pub fn cancel_delete(&self) {
        self.state().pending_delete = None;
    }

    /**
     * \brief 执行已确认的删除；没有待确认目标时什么也不做。
     */
    pub async fn confirm_delete(&self) -> bool {
        let Some(target) = self.state().pending_delete.take() else {
            return false;
        };
        match self.bridge.delete_station(&target.id).await {
            Ok(_) => {
                self.telemetry
                    .log_event("station", &format!("deleted id={}", target.id));
                self.toasts.success("relay_station.deleted");
                self.list().await;
                true
            }
            Err(err) => {
                self.fail("relay_station.delete_failed", "delete station", err);
                false
            }
        }
    }

    /**
     * \brief 启用或停用中转站；同一中转站的切换在完成前不可重复提交。
     */
    pub async fn toggle_enable(&self, id: &str, enabled: bool) -> bool {
        if !self.state().toggling.insert(id.to_string()) {
            return false;
        }
        let result = self.bridge.toggle_station(id, enabled).await;
        self.state().toggling.remove(id);
        match result {
            Ok(message) => {
                self.telemetry.log_event(
                    "station",
                    &format!("toggle id={} enabled={}: {}", id, enabled, message),
                );
                self.toasts.success(if enabled {
                    "relay_station.enabled"
                } else {
                    "relay_station.disabled"
                });
                self.list().await;
                self.load_current_config().await;
                true
            }
            Err(err) => {
                self.fail("relay_station.toggle_failed", "toggle station", err);
                false
            }
        }
    }

    pub async fn sync_config(&self) -> bool {
        match self.bridge.sync_config().await {
            Ok(message) => {
                self.toasts.info("relay_station.synced", Some(message));
                self.load_current_config().await;
                true
            }
            Err(err) => {
                self.fail("relay_station.sync_failed", "sync config", err);
                false
            }
        }
    }

    pub async fn restore_config(&self) -> bool {
        match self.bridge.restore_config().await {
            Ok(message) => {
                self.toasts.info("relay_station.restored", Some(message));
                self.load_current_config().await;
                true
            }
            Err(err) => {
                self.fail("relay_station.restore_failed", "restore config", err);
                false
            }
        }
    }

    pub async fn load_current_config(&self) -> bool {
        match self.bridge.current_config().await {
            Ok(config) => {
                self.state().current_config = config;
                true
            }
            Err(err) => {
                self.fail("relay_station.config_load_failed", "load current config", err);
                false
            }
        }
    }

    /**
     * \brief 将中转站移动到列表中的新位置并持久化顺序。
     */
    pub async fn move_station(&self, id: &str, index: usize) -> bool {
        let order = {
            let state = self.state();
            let mut ids: Vec<String> = state.stations.iter().map(|s| s.id.clone()).collect();
            let Some(from) = ids.iter().position(|s| s == id) else {
                return false;
            };
            let moved = ids.remove(from);
            ids.insert(index.min(ids.len()), moved);
            ids
        };
        match self.bridge.update_station_order(&order).await {
            Ok(()) => {
                self.list().await;
                true
            }
            Err(err) => {
                self.fail("relay_station.reorder_failed", "reorder stations", err);
                false
            }
        }
    }

    pub async fn export(&self) -> Option<Vec<RelayStation>> {
        match self.bridge.export_stations().await {
            Ok(stations) => Some(stations),
            Err(err) => {
                self.fail("relay_station.export_failed", "export stations", err);
                None
            }
        }
    }

    pub async fn import(&self, request: &ImportRelayStationsRequest) -> Option<ImportResult> {
        match self.bridge.import_stations(request).await {
            Ok(result) => {
                self.toasts
                    .info("relay_station.imported", Some(result.message.clone()));
                self.list().await;
                Some(result)
            }
            Err(err) => {
                self.fail("relay_station.import_failed", "import stations", err);
                None
            }
        }
    }

    /**
     * \brief 手动刷新单个中转站的额度。
     */
    pub async fn refresh_quota(&self, id: &str) -> bool {
        match self.fetch_quota(id).await {
            Ok(()) => true,
            Err(err) => {
                self.fail("relay_station.quota_failed", "fetch quota", err);
                false
            }
        }
    }

    /**
     * \brief 为列表中每个 PackyCode 中转站独立刷新额度，失败只记日志。
     */
    pub fn refresh_all_quotas(&self) -> Vec<JoinHandle<()>> {
        let ids: Vec<String> = self
            .state()
            .stations
            .iter()
            .filter(|s| s.adapter == Adapter::Packycode)
            .map(|s| s.id.clone())
            .collect();
        ids.into_iter()
            .map(|id| {
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = this.fetch_quota(&id).await {
                        this.telemetry
                            .log_error("quota", &format!("station {}: {:#}", id, err));
                    }
                })
            })
            .collect()
    }

    /**
     * \brief 测试中转站连通性并记录结果；连接失败以错误提示呈现。
     */
    pub async fn test_connection(&self, id: &str) -> Option<ConnectionTestResult> {
        match self.bridge.test_connection(id).await {
            Ok(result) => {
                self.state()
                    .connections
                    .insert(id.to_string(), result.clone());
                if result.success {
                    self.toasts.success("relay_station.connection_ok");
                } else {
                    self.toasts.error(
                        "relay_station.connection_failed",
                        Some(result.message.clone()),
                    );
                }
                Some(result)
            }
            Err(err) => {
                self.fail("relay_station.connection_test_failed", "test connection", err);
                None
            }
        }
    }

    pub async fn station_info(&self, id: &str) -> Option<StationInfo> {
        match self.bridge.station_info(id).await {
            Ok(info) => Some(info),
            Err(err) => {
                self.fail("relay_station.info_failed", "get station info", err);
                None
            }
        }
    }

    pub async fn station_user_info(&self, id: &str, user_id: &str) -> Option<StationUserInfo> {
        match self.bridge.station_user_info(id, user_id).await {
            Ok(info) => Some(info),
            Err(err) => {
                self.fail("relay_station.user_info_failed", "get user info", err);
                None
            }
        }
    }

    async fn fetch_quota(&self, id: &str) -> anyhow::Result<()> {
        self.state().quota_loading.insert(id.to_string());
        let result = self.bridge.packycode_quota(id).await;
        let mut state = self.state();
        state.quota_loading.remove(id);
        let quota = result?;
        state.quotas.insert(id.to_string(), quota);
        Ok(())
    }

    /**
     * \brief 对表单当前档位的内置节点测速，并应用最快者。
     */
    pub async fn auto_select_node(&self, form: &mut StationForm) -> Option<NodeCandidate> {
        let candidates = form.tier_candidates();
        self.probe_and_apply(form, candidates).await
    }

    /**
     * \brief 并发测速候选节点，停留展示结果后把最快节点写入表单。
     * \details 全部失败时保留第一个候选；候选为空时不做任何事。
     */
    pub async fn probe_and_apply(
        &self,
        form: &mut StationForm,
        candidates: Vec<NodeCandidate>,
    ) -> Option<NodeCandidate> {
        if candidates.is_empty() {
            return None;
        }
        self.state().failover = FailoverView {
            open: true,
            board: ProbeBoard::new(&candidates),
            winner: None,
        };

        let stream = probe_stream(self.prober.clone(), candidates.clone(), self.probe_timeout);
        futures_util::pin_mut!(stream);
        while let Some(result) = stream.next().await {
            self.state().failover.board.apply(result);
        }

        let winner = {
            let mut state = self.state();
            let winner = select_fastest(&candidates, state.failover.board.results()).cloned();
            state.failover.winner = winner.clone();
            winner
        };

        tokio::time::sleep(self.pacing.dwell).await;
        if let Some(node) = &winner {
            form.select_node_url(&node.url);
            self.telemetry.log_event(
                "failover",
                &format!("selected {} ({})", node.name, node.url),
            );
        }
        tokio::time::sleep(self.pacing.dismiss).await;
        self.state().failover.open = false;
        winner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bridge::{commands, InvokeBridge},
        packycode::ServiceType,
        probe::ProbeStatus,
        testing::{memory_backend, station_json, ScriptedInvoke, ScriptedProber},
    };
    use anyhow::anyhow;
    use serde_json::{json, Value};

    fn scripted(invoke: &Arc<ScriptedInvoke>) -> StationCoordinator {
        StationCoordinator::new(
            Arc::new(InvokeBridge::new(invoke.clone())),
            Arc::new(ScriptedProber::new()),
            ToastCenter::default(),
            Telemetry::disabled(),
        )
        .with_pacing(FailoverPacing::immediate())
    }

    fn quota_json() -> Value {
        json!({
            "daily_budget_usd": 10.0,
            "daily_spent_usd": 1.5,
            "monthly_budget_usd": 100.0,
            "monthly_spent_usd": 20.0,
            "balance_usd": 80.0,
            "total_spent_usd": 20.0,
            "plan_type": "pro",
            "plan_expires_at": null,
            "username": "rider",
            "email": null,
            "opus_enabled": true
        })
    }

    fn filled(adapter: Adapter) -> StationForm {
        let mut form = StationForm::new(adapter);
        form.system_token = "sk-abc".into();
        form
    }

    #[tokio::test]
    async fn test_validation_gate_never_reaches_backend() {
        let invoke = Arc::new(ScriptedInvoke::new());
        let coordinator = scripted(&invoke);

        let mut form = filled(Adapter::Deepseek);
        form.system_token = "   ".into();
        assert!(!coordinator.create(&form).await);
        assert_eq!(
            coordinator.toasts().last_key().as_deref(),
            Some("relay_station.token_required")
        );

        let mut form = filled(Adapter::Glm);
        form.api_url = "\t".into();
        assert!(!coordinator.create(&form).await);
        assert!(!coordinator.update(&form).await);

        let mut form = filled(Adapter::Custom);
        form.api_url = "https://relay.example.com".into();
        form.name = " ".into();
        assert!(!coordinator.create(&form).await);
        assert_eq!(
            coordinator.toasts().last_key().as_deref(),
            Some("relay_station.name_required")
        );

        assert!(invoke.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_without_name_adds_one_station() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(memory_backend(dir.path()));
        let coordinator = StationCoordinator::new(
            Arc::new(InvokeBridge::new(backend)),
            Arc::new(ScriptedProber::new()),
            ToastCenter::default(),
            Telemetry::disabled(),
        );
        assert!(coordinator.list().await);
        let before = coordinator.stations().len();

        coordinator.open_create();
        let mut form = StationForm::new(Adapter::Deepseek);
        form.name.clear();
        form.api_url = "https://api.deepseek.com/anthropic".into();
        form.system_token = "sk-abc".into();
        assert!(coordinator.create(&form).await);

        let stations = coordinator.stations();
        assert_eq!(stations.len(), before + 1);
        assert_eq!(stations[0].name, "DeepSeek");
        assert!(!coordinator.is_create_open());
        assert!(coordinator.toasts().has_key("relay_station.created"));
    }

    #[tokio::test]
    async fn test_toggle_keeps_at_most_one_enabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(memory_backend(dir.path()));
        let coordinator = StationCoordinator::new(
            Arc::new(InvokeBridge::new(backend)),
            Arc::new(ScriptedProber::new()),
            ToastCenter::default(),
            Telemetry::disabled(),
        );
        for adapter in [Adapter::Deepseek, Adapter::Glm, Adapter::Kimi] {
            assert!(coordinator.create(&filled(adapter)).await);
        }
        let ids: Vec<String> = coordinator.stations().iter().map(|s| s.id.clone()).collect();

        let sequence = [
            (0, true),
            (1, true),
            (2, true),
            (2, false),
            (0, true),
            (0, true),
            (1, false),
        ];
        for (idx, enabled) in sequence {
            assert!(coordinator.toggle_enable(&ids[idx], enabled).await);
            let on = coordinator.stations().iter().filter(|s| s.enabled).count();
            assert!(on <= 1, "{} stations enabled", on);
        }
        let enabled: Vec<_> = coordinator
            .stations()
            .into_iter()
            .filter(|s| s.enabled)
            .collect();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, ids[0]);
        assert!(coordinator.current_config().api_token.is_some());
    }

    #[tokio::test]
    async fn test_delete_requires_confirmation() {
        let invoke = Arc::new(ScriptedInvoke::new());
        invoke.respond(commands::RELAY_STATIONS_LIST, || {
            Ok(json!([station_json("a", "deepseek", false)]))
        });
        invoke.respond(commands::RELAY_STATION_DELETE, || Ok(json!("deleted")));
        let coordinator = scripted(&invoke);
        coordinator.list().await;

        assert!(!coordinator.confirm_delete().await);
        assert!(!coordinator.request_delete("missing"));
        assert!(coordinator.request_delete("a"));
        assert_eq!(coordinator.pending_delete().unwrap().name, "station a");
        coordinator.cancel_delete();
        assert!(!coordinator.confirm_delete().await);
        assert_eq!(invoke.count(commands::RELAY_STATION_DELETE), 0);

        assert!(coordinator.request_delete("a"));
        assert!(coordinator.confirm_delete().await);
        assert_eq!(invoke.count(commands::RELAY_STATION_DELETE), 1);
        assert!(coordinator.pending_delete().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_toggle_rejected_while_in_flight() {
        let invoke = Arc::new(ScriptedInvoke::new());
        invoke.respond(commands::RELAY_STATIONS_LIST, || Ok(json!([])));
        invoke.respond(commands::RELAY_STATION_TOGGLE_ENABLE, || Ok(json!("ok")));
        invoke.respond(commands::RELAY_STATION_GET_CURRENT_CONFIG, || {
            Ok(json!({"api_url": null, "api_token": null}))
        });
        let gate = invoke.gate(commands::RELAY_STATION_TOGGLE_ENABLE);
        let coordinator = scripted(&invoke);

        let first = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.toggle_enable("a", true).await })
        };
        tokio::task::yield_now().await;
        assert!(coordinator.is_toggling("a"));
        assert!(!coordinator.toggle_enable("a", true).await);

        gate.notify_one();
        assert!(first.await.expect("join"));
        assert!(!coordinator.is_toggling("a"));
        assert_eq!(invoke.count(commands::RELAY_STATION_TOGGLE_ENABLE), 1);
        assert_eq!(invoke.count(commands::RELAY_STATION_GET_CURRENT_CONFIG), 1);
    }

    #[tokio::test]
    async fn test_list_failure_keeps_previous_stations() {
        let invoke = Arc::new(ScriptedInvoke::new());
        invoke.respond(commands::RELAY_STATIONS_LIST, || {
            Ok(json!([station_json("a", "glm", true)]))
        });
        let coordinator = scripted(&invoke);
        assert!(coordinator.list().await);

        invoke.respond(commands::RELAY_STATIONS_LIST, || Err(anyhow!("backend down")));
        assert!(!coordinator.list().await);
        assert_eq!(coordinator.stations().len(), 1);
        assert!(!coordinator.is_loading());
        assert!(coordinator.toasts().has_key("relay_station.list_failed"));
    }

    #[tokio::test]
    async fn test_quota_refreshes_only_when_station_set_changes() {
        let invoke = Arc::new(ScriptedInvoke::new());
        invoke.respond(commands::RELAY_STATIONS_LIST, || {
            Ok(json!([
                station_json("p1", "packycode", true),
                station_json("d1", "deepseek", false)
            ]))
        });
        invoke.respond(commands::PACKYCODE_GET_USER_QUOTA, || Ok(quota_json()));
        let coordinator = scripted(&invoke);

        coordinator.list().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(invoke.count(commands::PACKYCODE_GET_USER_QUOTA), 1);
        assert_eq!(coordinator.quota("p1").unwrap().plan_type, "pro");
        assert!(coordinator.quota("d1").is_none());

        coordinator.list().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(invoke.count(commands::PACKYCODE_GET_USER_QUOTA), 1);
    }

    #[tokio::test]
    async fn test_quota_refreshes_when_station_becomes_packycode() {
        let invoke = Arc::new(ScriptedInvoke::new());
        invoke.respond(commands::RELAY_STATIONS_LIST, || {
            Ok(json!([station_json("s1", "deepseek", false)]))
        });
        invoke.respond(commands::PACKYCODE_GET_USER_QUOTA, || Ok(quota_json()));
        let coordinator = scripted(&invoke);

        coordinator.list().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(invoke.count(commands::PACKYCODE_GET_USER_QUOTA), 0);

        invoke.respond(commands::RELAY_STATIONS_LIST, || {
            Ok(json!([station_json("s1", "packycode", false)]))
        });
        coordinator.list().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(invoke.count(commands::PACKYCODE_GET_USER_QUOTA), 1);
        assert!(coordinator.quota("s1").is_some());
    }

    #[tokio::test]
    async fn test_token_change_drops_cached_quota_and_refetches() {
        let invoke = Arc::new(ScriptedInvoke::new());
        invoke.respond(commands::RELAY_STATIONS_LIST, || {
            Ok(json!([station_json("p1", "packycode", false)]))
        });
        invoke.respond(commands::PACKYCODE_GET_USER_QUOTA, || Ok(quota_json()));
        let coordinator = scripted(&invoke);
        coordinator.list().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coordinator.quota("p1").is_some());

        invoke.respond(commands::RELAY_STATIONS_LIST, || {
            let mut station = station_json("p1", "packycode", false);
            station["system_token"] = json!("sk-other-account");
            Ok(json!([station]))
        });
        invoke.respond(commands::PACKYCODE_GET_USER_QUOTA, || Err(anyhow!("401")));
        coordinator.list().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(invoke.count(commands::PACKYCODE_GET_USER_QUOTA), 2);
        assert!(coordinator.quota("p1").is_none());
    }

    #[tokio::test]
    async fn test_removed_stations_lose_cached_quota() {
        let invoke = Arc::new(ScriptedInvoke::new());
        invoke.respond(commands::RELAY_STATIONS_LIST, || {
            Ok(json!([
                station_json("p1", "packycode", false),
                station_json("p2", "packycode", false)
            ]))
        });
        invoke.respond(commands::PACKYCODE_GET_USER_QUOTA, || Ok(quota_json()));
        let coordinator = scripted(&invoke);
        coordinator.list().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coordinator.quota("p2").is_some());

        invoke.respond(commands::RELAY_STATIONS_LIST, || {
            Ok(json!([station_json("p1", "packycode", false)]))
        });
        coordinator.list().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coordinator.quota("p2").is_none());
        assert!(coordinator.quota("p1").is_some());
    }

    #[tokio::test]
    async fn test_quota_failures_are_silent_in_background() {
        let invoke = Arc::new(ScriptedInvoke::new());
        invoke.respond(commands::RELAY_STATIONS_LIST, || {
            Ok(json!([station_json("p1", "packycode", false)]))
        });
        invoke.respond(commands::PACKYCODE_GET_USER_QUOTA, || Err(anyhow!("401")));
        let coordinator = scripted(&invoke);
        coordinator.list().await;
        for handle in coordinator.refresh_all_quotas() {
            handle.await.expect("join");
        }
        assert!(coordinator.toasts().snapshot().iter().all(|t| !t.key.contains("quota")));
        assert!(!coordinator.is_quota_loading("p1"));

        assert!(!coordinator.refresh_quota("p1").await);
        assert!(coordinator.toasts().has_key("relay_station.quota_failed"));
    }

    #[tokio::test]
    async fn test_connection_results_are_kept_and_failures_toasted() {
        let invoke = Arc::new(ScriptedInvoke::new());
        invoke.respond_with(commands::RELAY_STATION_TEST_CONNECTION, |payload| {
            match payload["stationId"].as_str() {
                Some("up") => Ok(json!({
                    "success": true,
                    "response_time": 32,
                    "message": "up - 连接成功",
                    "details": null
                })),
                Some("down") => Ok(json!({
                    "success": false,
                    "response_time": 5000,
                    "message": "连接失败: timed out",
                    "details": null
                })),
                _ => Err(anyhow!("中转站不存在")),
            }
        });
        let coordinator = scripted(&invoke);

        let up = coordinator.test_connection("up").await.expect("up");
        assert_eq!(up.response_time, 32);
        assert!(coordinator.toasts().has_key("relay_station.connection_ok"));

        let down = coordinator.test_connection("down").await.expect("down");
        assert!(!down.success);
        assert_eq!(coordinator.connection("down"), Some(down));
        assert!(coordinator.toasts().has_key("relay_station.connection_failed"));

        assert!(coordinator.test_connection("gone").await.is_none());
        assert!(coordinator
            .toasts()
            .has_key("relay_station.connection_test_failed"));
        assert!(coordinator.connection("gone").is_none());
        assert_eq!(invoke.calls()[0].1, json!({"stationId": "up"}));
    }

    #[tokio::test]
    async fn test_move_station_sends_new_order() {
        let invoke = Arc::new(ScriptedInvoke::new());
        invoke.respond(commands::RELAY_STATIONS_LIST, || {
            Ok(json!([
                station_json("a", "glm", false),
                station_json("b", "kimi", false),
                station_json("c", "qwen", false)
            ]))
        });
        invoke.respond(commands::RELAY_STATION_UPDATE_ORDER, || Ok(Value::Null));
        let coordinator = scripted(&invoke);
        coordinator.list().await;

        assert!(coordinator.move_station("c", 0).await);
        assert!(!coordinator.move_station("zz", 0).await);
        let calls = invoke.calls();
        let order = calls
            .iter()
            .find(|(c, _)| c == commands::RELAY_STATION_UPDATE_ORDER)
            .map(|(_, p)| p.clone())
            .unwrap();
        assert_eq!(order, json!({"stationIds": ["c", "a", "b"]}));
    }

    fn bus_prober() -> ScriptedProber {
        ScriptedProber::new()
            .route("https://api.packycode.com", 120, true)
            .route("https://api-hk-cn2.packycode.com", 45, true)
            .route("https://api-hk-g.packycode.com", 60, false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_applies_fastest_after_dwell() {
        let coordinator = StationCoordinator::new(
            Arc::new(InvokeBridge::new(ScriptedInvoke::new())),
            Arc::new(bus_prober()),
            ToastCenter::default(),
            Telemetry::disabled(),
        );
        let form = StationForm::new(Adapter::Packycode);
        let task = {
            let c = coordinator.clone();
            tokio::spawn(async move {
                let mut form = form;
                let winner = c.auto_select_node(&mut form).await;
                (form, winner)
            })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        let view = coordinator.failover_view();
        assert!(view.open);
        assert!(view.board.is_settled());
        assert_eq!(
            view.winner.as_ref().map(|w| w.url.as_str()),
            Some("https://api-hk-cn2.packycode.com")
        );
        let statuses: Vec<_> = view.board.results().iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ProbeStatus::Success,
                ProbeStatus::Success,
                ProbeStatus::Failed,
                ProbeStatus::Failed,
                ProbeStatus::Failed
            ]
        );

        let (form, winner) = task.await.expect("join");
        assert_eq!(form.api_url, "https://api-hk-cn2.packycode.com");
        assert_eq!(winner.unwrap().name, "公交车 HK-CN2");
        assert!(!coordinator.failover_view().open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_keeps_first_candidate_when_all_fail() {
        let coordinator = StationCoordinator::new(
            Arc::new(InvokeBridge::new(ScriptedInvoke::new())),
            Arc::new(ScriptedProber::new()),
            ToastCenter::default(),
            Telemetry::disabled(),
        )
        .with_pacing(FailoverPacing::immediate());
        let mut form = StationForm::new(Adapter::Packycode);
        form.select_service_type(ServiceType::Taxi);
        form.select_node_url("https://share-api-hk-g.packycode.com");

        let winner = coordinator.auto_select_node(&mut form).await.expect("fallback");
        assert_eq!(winner.url, "https://share-api.packycode.com");
        assert_eq!(form.api_url, "https://share-api.packycode.com");
        assert!(coordinator.toasts().snapshot().is_empty());

        let mut custom = StationForm::new(Adapter::Custom);
        assert!(coordinator.auto_select_node(&mut custom).await.is_none());
    }
}
