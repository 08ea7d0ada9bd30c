use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    bridge::CommandBridge,
    config::NODE_TEST_TIMEOUT_MS,
    models::{Adapter, ApiNode, CreateApiNodeRequest, UpdateApiNodeRequest},
    probe::{NodeCandidate, NodeTestResult},
    telemetry::Telemetry,
    toast::ToastCenter,
};

/**
 * \brief 节点行内的操作按钮。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    Test,
    Edit,
    Delete,
}

/**
 * \brief 节点行上的点击位置：行本身或操作按钮区。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickTarget {
    Row,
    Action(NodeAction),
}

#[derive(Debug, Default)]
struct NodeManagerState {
    open: bool,
    adapter: Option<Adapter>,
    enabled_only: bool,
    loading: bool,
    nodes: Vec<ApiNode>,
    results: HashMap<String, NodeTestResult>,
}

/**
 * \brief API 节点管理器，兼作节点选择器。
 * \details 创建和更新后重新拉取列表；删除成功后只在本地移除，不重新拉取。
 */
#[derive(Clone)]
pub struct NodeManager {
    bridge: Arc<dyn CommandBridge>,
    toasts: ToastCenter,
    telemetry: Telemetry,
    timeout_ms: u64,
    state: Arc<Mutex<NodeManagerState>>,
}

impl NodeManager {
    pub fn new(bridge: Arc<dyn CommandBridge>, toasts: ToastCenter, telemetry: Telemetry) -> Self {
        Self {
            bridge,
            toasts,
            telemetry,
            timeout_ms: NODE_TEST_TIMEOUT_MS,
            state: Arc::new(Mutex::new(NodeManagerState::default())),
        }
    }

    pub fn toasts(&self) -> &ToastCenter {
        &self.toasts
    }

    fn state(&self) -> MutexGuard<'_, NodeManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, key: &str, operation: &str, err: anyhow::Error) {
        self.telemetry
            .log_error("node", &format!("{} failed: {:#}", operation, err));
        self.toasts.error(key, Some(err.to_string()));
    }

    pub fn nodes(&self) -> Vec<ApiNode> {
        self.state().nodes.clone()
    }

    pub fn result(&self, node_id: &str) -> Option<NodeTestResult> {
        self.state().results.get(node_id).cloned()
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    pub fn is_loading(&self) -> bool {
        self.state().loading
    }

    pub fn enabled_only(&self) -> bool {
        self.state().enabled_only
    }

    /**
     * \brief 打开管理器并按适配器过滤加载节点。
     */
    pub async fn open(&self, adapter: Option<Adapter>) -> bool {
        {
            let mut state = self.state();
            state.open = true;
            state.adapter = adapter;
        }
        self.load().await
    }

    pub fn close(&self) {
        self.state().open = false;
    }

    pub async fn load(&self) -> bool {
        let (adapter, enabled_only) = {
            let mut state = self.state();
            state.loading = true;
            (state.adapter, state.enabled_only)
        };
        let result = self.bridge.list_nodes(adapter, Some(enabled_only)).await;
        self.state().loading = false;
        match result {
            Ok(nodes) => {
                self.state().nodes = nodes;
                true
            }
            Err(err) => {
                self.fail("api_node.load_failed", "list nodes", err);
                false
            }
        }
    }

    pub async fn set_enabled_only(&self, enabled_only: bool) -> bool {
        self.state().enabled_only = enabled_only;
        self.load().await
    }

    pub async fn create(&self, request: &CreateApiNodeRequest) -> Option<ApiNode> {
        match self.bridge.create_node(request).await {
            Ok(node) => {
                self.toasts.success("api_node.created");
                self.load().await;
                Some(node)
            }
            Err(err) => {
                self.fail("api_node.create_failed", "create node", err);
                None
            }
        }
    }

    pub async fn update(&self, id: &str, request: &UpdateApiNodeRequest) -> Option<ApiNode> {
        match self.bridge.update_node(id, request).await {
            Ok(node) => {
                self.toasts.success("api_node.updated");
                self.load().await;
                Some(node)
            }
            Err(err) => {
                self.fail("api_node.update_failed", "update node", err);
                None
            }
        }
    }

    pub async fn delete(&self, id: &str) -> bool {
        match self.bridge.delete_node(id).await {
            Ok(()) => {
                let mut state = self.state();
                state.nodes.retain(|n| n.id != id);
                state.results.remove(id);
                drop(state);
                self.toasts.success("api_node.deleted");
                true
            }
            Err(err) => {
                self.fail("api_node.delete_failed", "delete node", err);
                false
            }
        }
    }

    /**
     * \brief 测试单个节点；等待结果前先标记为测试中。
     */
    pub async fn test_one(&self, node_id: &str) -> Option<NodeTestResult> {
        let candidate = {
            let mut state = self.state();
            let candidate = state
                .nodes
                .iter()
                .find(|n| n.id == node_id)
                .map(NodeCandidate::from)?;
            state
                .results
                .insert(candidate.id.clone(), NodeTestResult::testing(&candidate));
            candidate
        };
        let result = match self.bridge.test_node(&candidate.url, self.timeout_ms).await {
            Ok(report) => NodeTestResult::from_report(&candidate, &report),
            Err(err) => NodeTestResult::failed(&candidate, err.to_string()),
        };
        self.state()
            .results
            .insert(candidate.id.clone(), result.clone());
        Some(result)
    }

    /**
     * \brief 批量测试当前列表中的节点，结果按节点 ID（缺失时按 URL）归并。
     */
    pub async fn test_all(&self) -> Vec<NodeTestResult> {
        let (adapter, candidates) = {
            let mut state = self.state();
            let candidates: Vec<NodeCandidate> =
                state.nodes.iter().map(NodeCandidate::from).collect();
            for candidate in &candidates {
                state
                    .results
                    .insert(candidate.id.clone(), NodeTestResult::testing(candidate));
            }
            (state.adapter, candidates)
        };
        if candidates.is_empty() {
            return Vec::new();
        }

        let reports = match self.bridge.test_all_nodes(adapter, self.timeout_ms).await {
            Ok(reports) => reports,
            Err(err) => {
                let message = err.to_string();
                self.fail("api_node.test_failed", "test all nodes", err);
                let failed: Vec<NodeTestResult> = candidates
                    .iter()
                    .map(|c| NodeTestResult::failed(c, message.clone()))
                    .collect();
                let mut state = self.state();
                for result in &failed {
                    state.results.insert(result.node_id.clone(), result.clone());
                }
                return failed;
            }
        };

        let merged: Vec<NodeTestResult> = candidates
            .iter()
            .map(|candidate| {
                reports
                    .iter()
                    .find(|r| r.node_id.as_deref() == Some(candidate.id.as_str()))
                    .or_else(|| reports.iter().find(|r| r.url == candidate.url))
                    .map(|report| NodeTestResult::from_report(candidate, report))
                    .unwrap_or_else(|| {
                        NodeTestResult::failed(candidate, "节点未参与测试".to_string())
                    })
            })
            .collect();
        let mut state = self.state();
        for result in &merged {
            state.results.insert(result.node_id.clone(), result.clone());
        }
        merged
    }

    /**
     * \brief 选择器模式下的行点击：点在行上返回节点 URL 并关闭管理器，点在操作按钮上不做选择。
     */
    pub fn click_row(&self, node_id: &str, target: ClickTarget) -> Option<String> {
        match target {
            ClickTarget::Action(_) => None,
            ClickTarget::Row => {
                let mut state = self.state();
                let url = state
                    .nodes
                    .iter()
                    .find(|n| n.id == node_id)
                    .map(|n| n.url.clone())?;
                state.open = false;
                Some(url)
            }
        }
    }

    pub async fn seed_defaults(&self) -> bool {
        match self.bridge.init_default_nodes().await {
            Ok(()) => {
                self.toasts.success("api_node.defaults_seeded");
                self.load().await;
                true
            }
            Err(err) => {
                self.fail("api_node.seed_failed", "init default nodes", err);
                false
            }
        }
    }

    pub async fn flush_dns(&self) -> bool {
        match self.bridge.flush_dns().await {
            Ok(message) => {
                self.telemetry.log_event("node", &format!("flush dns: {}", message));
                self.toasts.info("api_node.dns_flushed", Some(message));
                true
            }
            Err(err) => {
                self.fail("api_node.dns_flush_failed", "flush dns", err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bridge::{commands, InvokeBridge},
        probe::ProbeStatus,
        testing::ScriptedInvoke,
    };
    use serde_json::{json, Value};

    fn node_json(id: &str, url: &str) -> Value {
        json!({
            "id": id,
            "name": format!("node {}", id),
            "url": url,
            "adapter": "glm",
            "description": null,
            "enabled": true,
            "is_default": false
        })
    }

    fn manager(invoke: &Arc<ScriptedInvoke>) -> NodeManager {
        invoke.respond(commands::LIST_API_NODES, || {
            Ok(json!([
                node_json("n1", "https://a.example.com"),
                node_json("n2", "https://b.example.com"),
                node_json("n3", "https://c.example.com")
            ]))
        });
        NodeManager::new(
            Arc::new(InvokeBridge::new(invoke.clone())),
            ToastCenter::default(),
            Telemetry::disabled(),
        )
    }

    #[tokio::test]
    async fn test_one_marks_testing_before_result_arrives() {
        let invoke = Arc::new(ScriptedInvoke::new());
        invoke.respond(commands::TEST_API_NODE, || {
            Ok(json!({
                "url": "https://a.example.com",
                "status": "success",
                "response_time_ms": 88,
                "message": "连接成功 (HTTP 200)"
            }))
        });
        let gate = invoke.gate(commands::TEST_API_NODE);
        let nodes = manager(&invoke);
        nodes.open(Some(Adapter::Glm)).await;

        let task = {
            let nodes = nodes.clone();
            tokio::spawn(async move { nodes.test_one("n1").await })
        };
        tokio::task::yield_now().await;
        assert_eq!(nodes.result("n1").unwrap().status, ProbeStatus::Testing);

        gate.notify_one();
        let result = task.await.expect("join").expect("result");
        assert_eq!(result.response_time, Some(88));
        assert_eq!(nodes.result("n1").unwrap().status, ProbeStatus::Success);
        assert_eq!(
            invoke.calls().last().unwrap().1,
            json!({"url": "https://a.example.com", "timeoutMs": 5000})
        );
    }

    #[tokio::test]
    async fn test_all_merges_reports_by_key() {
        let invoke = Arc::new(ScriptedInvoke::new());
        invoke.respond(commands::TEST_ALL_API_NODES, || {
            Ok(json!([
                {"node_id": "n3", "url": "https://c.example.com", "status": "timeout",
                 "response_time_ms": 5000, "message": "连接超时"},
                {"url": "https://a.example.com", "status": "success",
                 "response_time_ms": 30, "message": "ok"},
                {"node_id": "n2", "url": "https://b.example.com", "status": "success",
                 "response_time_ms": 12, "message": "ok"}
            ]))
        });
        let nodes = manager(&invoke);
        nodes.open(Some(Adapter::Glm)).await;

        let results = nodes.test_all().await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].response_time, Some(30));
        assert_eq!(results[1].response_time, Some(12));
        assert_eq!(results[2].status, ProbeStatus::Failed);
        assert_eq!(nodes.result("n3").unwrap().response_time, None);
        assert_eq!(
            invoke.calls().last().unwrap().1,
            json!({"adapter": "glm", "timeoutMs": 5000})
        );
    }

    #[tokio::test]
    async fn test_action_clicks_never_select() {
        let invoke = Arc::new(ScriptedInvoke::new());
        let nodes = manager(&invoke);
        nodes.open(None).await;

        for action in [NodeAction::Test, NodeAction::Edit, NodeAction::Delete] {
            assert_eq!(nodes.click_row("n2", ClickTarget::Action(action)), None);
            assert!(nodes.is_open());
        }
        assert_eq!(
            nodes.click_row("n2", ClickTarget::Row).as_deref(),
            Some("https://b.example.com")
        );
        assert!(!nodes.is_open());
    }

    #[tokio::test]
    async fn test_delete_mutates_locally_without_refetch() {
        let invoke = Arc::new(ScriptedInvoke::new());
        invoke.respond(commands::DELETE_API_NODE, || Ok(Value::Null));
        invoke.respond(commands::CREATE_API_NODE, || {
            Ok(node_json("n4", "https://d.example.com"))
        });
        let nodes = manager(&invoke);
        nodes.open(None).await;
        assert_eq!(invoke.count(commands::LIST_API_NODES), 1);

        assert!(nodes.delete("n2").await);
        assert_eq!(nodes.nodes().len(), 2);
        assert_eq!(invoke.count(commands::LIST_API_NODES), 1);

        let request = CreateApiNodeRequest {
            name: "d".into(),
            url: "https://d.example.com".into(),
            adapter: Adapter::Glm,
            description: None,
        };
        assert!(nodes.create(&request).await.is_some());
        assert_eq!(invoke.count(commands::LIST_API_NODES), 2);
    }

    #[tokio::test]
    async fn test_enabled_only_toggle_reloads_with_filter() {
        let invoke = Arc::new(ScriptedInvoke::new());
        let nodes = manager(&invoke);
        nodes.open(Some(Adapter::Kimi)).await;
        assert!(nodes.set_enabled_only(true).await);
        assert_eq!(
            invoke.calls().last().unwrap().1,
            json!({"adapter": "kimi", "enabledOnly": true})
        );
    }
}
