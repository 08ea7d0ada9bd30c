use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::models::{
    Adapter, ApiNode, ConnectionTestResult, CreateApiNodeRequest, CreateRelayStationRequest,
    CurrentConfig, ImportRelayStationsRequest, ImportResult, NodeTestReport, PackycodeUserQuota,
    RelayStation, StationInfo, StationUserInfo, UpdateApiNodeRequest, UpdateRelayStationRequest,
};

/**
 * \brief 后端命令名，线上契约，逐字节保持不变。
 */
pub mod commands {
    pub const RELAY_STATIONS_LIST: &str = "relay_stations_list";
    pub const RELAY_STATION_GET: &str = "relay_station_get";
    pub const RELAY_STATION_CREATE: &str = "relay_station_create";
    pub const RELAY_STATION_UPDATE: &str = "relay_station_update";
    pub const RELAY_STATION_DELETE: &str = "relay_station_delete";
    pub const RELAY_STATION_TOGGLE_ENABLE: &str = "relay_station_toggle_enable";
    pub const RELAY_STATION_UPDATE_ORDER: &str = "relay_station_update_order";
    pub const RELAY_STATION_SYNC_CONFIG: &str = "relay_station_sync_config";
    pub const RELAY_STATION_RESTORE_CONFIG: &str = "relay_station_restore_config";
    pub const RELAY_STATION_GET_CURRENT_CONFIG: &str = "relay_station_get_current_config";
    pub const RELAY_STATIONS_EXPORT: &str = "relay_stations_export";
    pub const RELAY_STATIONS_IMPORT: &str = "relay_stations_import";
    pub const GET_CLAUDE_SETTINGS: &str = "get_claude_settings";
    pub const SAVE_CLAUDE_SETTINGS: &str = "save_claude_settings";
    pub const PACKYCODE_GET_USER_QUOTA: &str = "packycode_get_user_quota";
    pub const RELAY_STATION_GET_INFO: &str = "relay_station_get_info";
    pub const RELAY_STATION_GET_USER_INFO: &str = "relay_station_get_user_info";
    pub const RELAY_STATION_TEST_CONNECTION: &str = "relay_station_test_connection";
    pub const LIST_API_NODES: &str = "list_api_nodes";
    pub const CREATE_API_NODE: &str = "create_api_node";
    pub const UPDATE_API_NODE: &str = "update_api_node";
    pub const DELETE_API_NODE: &str = "delete_api_node";
    pub const INIT_DEFAULT_NODES: &str = "init_default_nodes";
    pub const TEST_API_NODE: &str = "test_api_node";
    pub const TEST_ALL_API_NODES: &str = "test_all_api_nodes";
    pub const FLUSH_DNS: &str = "flush_dns";
}

/**
 * \brief 原始命令调用通道：`invoke(commandName, payload)`。
 */
#[async_trait]
pub trait Invoke: Send + Sync {
    async fn invoke(&self, command: &str, payload: Value) -> Result<Value>;
}

#[async_trait]
impl<T: Invoke + ?Sized> Invoke for Arc<T> {
    async fn invoke(&self, command: &str, payload: Value) -> Result<Value> {
        (**self).invoke(command, payload).await
    }
}

/**
 * \brief 类型化的后端端口，每个命令对应一个方法。
 */
#[async_trait]
pub trait CommandBridge: Send + Sync {
    async fn list_stations(&self) -> Result<Vec<RelayStation>>;
    async fn get_station(&self, id: &str) -> Result<RelayStation>;
    async fn create_station(&self, request: &CreateRelayStationRequest) -> Result<RelayStation>;
    async fn update_station(&self, request: &UpdateRelayStationRequest) -> Result<RelayStation>;
    async fn delete_station(&self, id: &str) -> Result<String>;
    async fn toggle_station(&self, id: &str, enabled: bool) -> Result<String>;
    async fn update_station_order(&self, station_ids: &[String]) -> Result<()>;
    async fn sync_config(&self) -> Result<String>;
    async fn restore_config(&self) -> Result<String>;
    async fn current_config(&self) -> Result<CurrentConfig>;
    async fn export_stations(&self) -> Result<Vec<RelayStation>>;
    async fn import_stations(&self, request: &ImportRelayStationsRequest) -> Result<ImportResult>;
    async fn get_settings(&self) -> Result<Value>;
    async fn save_settings(&self, settings: &Value) -> Result<String>;
    async fn packycode_quota(&self, station_id: &str) -> Result<PackycodeUserQuota>;
    async fn station_info(&self, station_id: &str) -> Result<StationInfo>;
    async fn station_user_info(&self, station_id: &str, user_id: &str) -> Result<StationUserInfo>;
    async fn test_connection(&self, station_id: &str) -> Result<ConnectionTestResult>;
    async fn list_nodes(
        &self,
        adapter: Option<Adapter>,
        enabled_only: Option<bool>,
    ) -> Result<Vec<ApiNode>>;
    async fn create_node(&self, request: &CreateApiNodeRequest) -> Result<ApiNode>;
    async fn update_node(&self, id: &str, request: &UpdateApiNodeRequest) -> Result<ApiNode>;
    async fn delete_node(&self, id: &str) -> Result<()>;
    async fn init_default_nodes(&self) -> Result<()>;
    async fn test_node(&self, url: &str, timeout_ms: u64) -> Result<NodeTestReport>;
    async fn test_all_nodes(
        &self,
        adapter: Option<Adapter>,
        timeout_ms: u64,
    ) -> Result<Vec<NodeTestReport>>;
    async fn flush_dns(&self) -> Result<String>;
}

/**
 * \brief 基于 `Invoke` 通道的端口实现：负责命令名与负载键的编码。
 */
pub struct InvokeBridge<I> {
    inner: I,
}

impl<I: Invoke> InvokeBridge<I> {
    pub fn new(inner: I) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }

    async fn call<T: DeserializeOwned>(&self, command: &str, payload: Value) -> Result<T> {
        let value = self.inner.invoke(command, payload).await?;
        serde_json::from_value(value).with_context(|| format!("decode {} result", command))
    }
}

#[async_trait]
impl<I: Invoke> CommandBridge for InvokeBridge<I> {
    async fn list_stations(&self) -> Result<Vec<RelayStation>> {
        self.call(commands::RELAY_STATIONS_LIST, json!({})).await
    }

    async fn get_station(&self, id: &str) -> Result<RelayStation> {
        self.call(commands::RELAY_STATION_GET, json!({ "id": id }))
            .await
    }

    async fn create_station(&self, request: &CreateRelayStationRequest) -> Result<RelayStation> {
        self.call(commands::RELAY_STATION_CREATE, json!({ "request": request }))
            .await
    }

    async fn update_station(&self, request: &UpdateRelayStationRequest) -> Result<RelayStation> {
        self.call(commands::RELAY_STATION_UPDATE, json!({ "request": request }))
            .await
    }

    async fn delete_station(&self, id: &str) -> Result<String> {
        self.call(commands::RELAY_STATION_DELETE, json!({ "id": id }))
            .await
    }

    async fn toggle_station(&self, id: &str, enabled: bool) -> Result<String> {
        self.call(
            commands::RELAY_STATION_TOGGLE_ENABLE,
            json!({ "id": id, "enabled": enabled }),
        )
        .await
    }

    async fn update_station_order(&self, station_ids: &[String]) -> Result<()> {
        self.call(
            commands::RELAY_STATION_UPDATE_ORDER,
            json!({ "stationIds": station_ids }),
        )
        .await
    }

    async fn sync_config(&self) -> Result<String> {
        self.call(commands::RELAY_STATION_SYNC_CONFIG, json!({}))
            .await
    }

    async fn restore_config(&self) -> Result<String> {
        self.call(commands::RELAY_STATION_RESTORE_CONFIG, json!({}))
            .await
    }

    async fn current_config(&self) -> Result<CurrentConfig> {
        self.call(commands::RELAY_STATION_GET_CURRENT_CONFIG, json!({}))
            .await
    }

    async fn export_stations(&self) -> Result<Vec<RelayStation>> {
        self.call(commands::RELAY_STATIONS_EXPORT, json!({})).await
    }

    async fn import_stations(&self, request: &ImportRelayStationsRequest) -> Result<ImportResult> {
        self.call(commands::RELAY_STATIONS_IMPORT, json!({ "request": request }))
            .await
    }

    async fn get_settings(&self) -> Result<Value> {
        self.call(commands::GET_CLAUDE_SETTINGS, json!({})).await
    }

    async fn save_settings(&self, settings: &Value) -> Result<String> {
        self.call(commands::SAVE_CLAUDE_SETTINGS, json!({ "settings": settings }))
            .await
    }

    async fn packycode_quota(&self, station_id: &str) -> Result<PackycodeUserQuota> {
        self.call(
            commands::PACKYCODE_GET_USER_QUOTA,
            json!({ "stationId": station_id }),
        )
        .await
    }

    async fn station_info(&self, station_id: &str) -> Result<StationInfo> {
        self.call(
            commands::RELAY_STATION_GET_INFO,
            json!({ "stationId": station_id }),
        )
        .await
    }

    async fn station_user_info(&self, station_id: &str, user_id: &str) -> Result<StationUserInfo> {
        self.call(
            commands::RELAY_STATION_GET_USER_INFO,
            json!({ "stationId": station_id, "userId": user_id }),
        )
        .await
    }

    async fn test_connection(&self, station_id: &str) -> Result<ConnectionTestResult> {
        self.call(
            commands::RELAY_STATION_TEST_CONNECTION,
            json!({ "stationId": station_id }),
        )
        .await
    }

    async fn list_nodes(
        &self,
        adapter: Option<Adapter>,
        enabled_only: Option<bool>,
    ) -> Result<Vec<ApiNode>> {
        self.call(
            commands::LIST_API_NODES,
            json!({ "adapter": adapter, "enabledOnly": enabled_only }),
        )
        .await
    }

    async fn create_node(&self, request: &CreateApiNodeRequest) -> Result<ApiNode> {
        self.call(commands::CREATE_API_NODE, json!({ "request": request }))
            .await
    }

    async fn update_node(&self, id: &str, request: &UpdateApiNodeRequest) -> Result<ApiNode> {
        self.call(
            commands::UPDATE_API_NODE,
            json!({ "id": id, "request": request }),
        )
        .await
    }

    async fn delete_node(&self, id: &str) -> Result<()> {
        self.call(commands::DELETE_API_NODE, json!({ "id": id }))
            .await
    }

    async fn init_default_nodes(&self) -> Result<()> {
        self.call(commands::INIT_DEFAULT_NODES, json!({})).await
    }

    async fn test_node(&self, url: &str, timeout_ms: u64) -> Result<NodeTestReport> {
        self.call(
            commands::TEST_API_NODE,
            json!({ "url": url, "timeoutMs": timeout_ms }),
        )
        .await
    }

    async fn test_all_nodes(
        &self,
        adapter: Option<Adapter>,
        timeout_ms: u64,
    ) -> Result<Vec<NodeTestReport>> {
        self.call(
            commands::TEST_ALL_API_NODES,
            json!({ "adapter": adapter, "timeoutMs": timeout_ms }),
        )
        .await
    }

    async fn flush_dns(&self) -> Result<String> {
        self.call(commands::FLUSH_DNS, json!({})).await
    }
}

/**
 * \brief 通过本地 HTTP 服务 `POST /api/invoke/{command}` 调用远端后端。
 */
pub struct HttpInvoke {
    base: String,
    client: reqwest::Client,
}

impl HttpInvoke {
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self {
            base: base.into(),
            client,
        })
    }
}

#[async_trait]
impl Invoke for HttpInvoke {
    async fn invoke(&self, command: &str, payload: Value) -> Result<Value> {
        let url = format!("{}/api/invoke/{}", self.base.trim_end_matches('/'), command);
        let resp = self.client.post(url).json(&payload).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("{} failed: {} -> {}", command, status, text));
        }
        Ok(resp.json().await?)
    }
}
