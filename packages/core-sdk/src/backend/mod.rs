//! 本地参考后端：SQLite 持久化中转站与节点，读写 Claude `settings.json`，并实现 `Invoke` 命令分发。

pub mod adapters;
pub mod quota;
pub mod settings_file;
pub mod store;
pub mod system;

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use rusqlite::Connection;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::{
    bridge::{commands, Invoke},
    config::{AppConfig, NODE_TEST_TIMEOUT_MS},
    models::{
        Adapter, ApiNode, ConnectionTestResult, CreateApiNodeRequest, CreateRelayStationRequest,
        CurrentConfig, ImportRelayStationsRequest, ImportResult, NodeTestReport,
        PackycodeUserQuota, RelayStation, StationInfo, StationUserInfo, UpdateApiNodeRequest,
        UpdateRelayStationRequest,
    },
    probe::{HttpProber, ProbeOutcome, Prober},
    settings::mask_token,
    telemetry::Telemetry,
};

use settings_file::SettingsFile;

/**
 * \brief 校验中转站的名称、地址与令牌。
 * \details 非本地地址必须使用 HTTPS；令牌不得包含空白或控制字符。
 */
pub fn validate_station(name: &str, api_url: &str, system_token: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("中转站名称不能为空");
    }
    if api_url.trim().is_empty() {
        bail!("API 地址不能为空");
    }
    let parsed = reqwest::Url::parse(api_url.trim()).map_err(|_| anyhow!("API 地址格式无效"))?;
    let is_local = parsed
        .host_str()
        .map(|host| {
            matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "::1")
                || host.starts_with("192.168.")
                || host.starts_with("10.")
        })
        .unwrap_or(false);
    if !is_local && parsed.scheme() != "https" {
        bail!("非本地地址必须使用 HTTPS");
    }
    if system_token.trim().is_empty() {
        bail!("系统令牌不能为空");
    }
    if system_token
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        bail!("系统令牌包含非法字符");
    }
    Ok(())
}

fn validate_create(request: &CreateRelayStationRequest) -> Result<()> {
    validate_station(&request.name, &request.api_url, &request.system_token)
}

/**
 * \brief 本地后端。
 * \details 连接由互斥锁保护，锁只在同步数据库调用期间持有。
 */
pub struct LocalBackend {
    conn: Mutex<Connection>,
    settings: SettingsFile,
    prober: Arc<dyn Prober>,
    client: reqwest::Client,
    telemetry: Telemetry,
}

impl LocalBackend {
    pub fn new(
        conn: Connection,
        settings: SettingsFile,
        prober: Arc<dyn Prober>,
        telemetry: Telemetry,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .no_proxy()
            .build()?;
        Ok(Self {
            conn: Mutex::new(conn),
            settings,
            prober,
            client,
            telemetry,
        })
    }

    /**
     * \brief 按运行配置打开数据库、执行迁移并恢复遥测开关。
     */
    pub fn open(config: &AppConfig) -> Result<Self> {
        let conn = store::open_db(&config.db_path).context("open database failed")?;
        store::migrate(&conn).context("apply migrations failed")?;
        let telemetry_enabled = store::get_telemetry_enabled(&conn).unwrap_or(false);
        let telemetry = Telemetry::new(config.log_dir(), telemetry_enabled);
        Self::new(
            conn,
            SettingsFile::new(config.settings_path()),
            Arc::new(HttpProber::new()?),
            telemetry,
        )
    }

    fn db(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn settings_file(&self) -> &SettingsFile {
        &self.settings
    }

    pub fn prober(&self) -> Arc<dyn Prober> {
        self.prober.clone()
    }

    /**
     * \brief 持久化遥测开关并立即生效。
     */
    pub fn set_telemetry_enabled(&self, enabled: bool) -> Result<()> {
        store::set_telemetry_enabled(&self.db(), enabled)?;
        self.telemetry.set_enabled(enabled);
        Ok(())
    }

    pub fn list_stations(&self) -> Result<Vec<RelayStation>> {
        store::list_stations(&self.db())
    }

    pub fn get_station(&self, id: &str) -> Result<RelayStation> {
        store::get_station(&self.db(), id)?.ok_or_else(|| anyhow!("中转站不存在"))
    }

    /**
     * \brief 创建中转站；以启用状态创建时同时写入 Claude 设置。
     */
    pub fn create_station(&self, request: &CreateRelayStationRequest) -> Result<RelayStation> {
        validate_create(request)?;
        let station = store::insert_station(&self.db(), request)?;
        if station.enabled {
            self.settings
                .apply_station(&station)
                .map_err(|e| anyhow!("配置文件写入失败: {}", e))?;
        }
        self.telemetry
            .log_event("relay_station", &format!("created {}", station.id));
        Ok(station)
    }

    pub fn update_station(&self, request: &UpdateRelayStationRequest) -> Result<RelayStation> {
        validate_station(&request.name, &request.api_url, &request.system_token)?;
        let station = store::update_station(&self.db(), request)?;
        if station.enabled {
            self.settings
                .apply_station(&station)
                .map_err(|e| anyhow!("配置文件写入失败: {}", e))?;
        }
        self.telemetry
            .log_event("relay_station", &format!("updated {}", station.id));
        Ok(station)
    }

    /**
     * \brief 删除中转站；若删除的是启用中的中转站，同时清除其写入的设置。
     */
    pub fn delete_station(&self, id: &str) -> Result<String> {
        let was_enabled = {
            let conn = self.db();
            let station = store::get_station(&conn, id)?.ok_or_else(|| anyhow!("中转站不存在"))?;
            store::delete_station(&conn, id)?;
            station.enabled
        };
        if was_enabled {
            if let Err(e) = self.settings.clear_station() {
                self.telemetry
                    .log_error("relay_station", &format!("clear settings failed: {:#}", e));
            }
        }
        self.telemetry
            .log_event("relay_station", &format!("deleted {}", id));
        Ok("中转站已删除".to_string())
    }

    /**
     * \brief 切换启用状态。
     * \details 启用时先写入设置，写入失败则不改数据库；停用时清除设置失败只记录日志。
     */
    pub fn toggle_station(&self, id: &str, enabled: bool) -> Result<String> {
        let station = self.get_station(id)?;
        if enabled {
            self.settings
                .apply_station(&station)
                .map_err(|e| anyhow!("配置文件写入失败: {}", e))?;
        } else if let Err(e) = self.settings.clear_station() {
            self.telemetry
                .log_error("relay_station", &format!("clear settings failed: {:#}", e));
        }
        store::set_station_enabled(&self.db(), id, enabled)?;
        self.telemetry.log_event(
            "relay_station",
            &format!("toggled {} enabled={}", id, enabled),
        );
        Ok(if enabled {
            "中转站已启用".to_string()
        } else {
            "中转站已禁用".to_string()
        })
    }

    pub fn update_station_order(&self, station_ids: &[String]) -> Result<()> {
        store::update_station_order(&self.db(), station_ids)
    }

    /**
     * \brief 将当前启用的中转站重新写入设置；没有启用项时清除设置。
     */
    pub fn sync_config(&self) -> Result<String> {
        let enabled = store::get_enabled_station(&self.db())?;
        match enabled {
            Some(station) => {
                self.settings
                    .apply_station(&station)
                    .map_err(|e| anyhow!("配置同步失败: {}", e))?;
                Ok(format!("已同步中转站 {} 的配置到 Claude 设置", station.name))
            }
            None => {
                self.settings
                    .clear_station()
                    .map_err(|e| anyhow!("清除配置失败: {}", e))?;
                Ok("已清除 Claude 设置中的中转站配置".to_string())
            }
        }
    }

    pub fn restore_config(&self) -> Result<String> {
        self.settings
            .restore()
            .map_err(|e| anyhow!("恢复配置失败: {}", e))?;
        self.telemetry
            .log_event("settings", "restored settings from backup");
        Ok("已从备份恢复 Claude 配置".to_string())
    }

    /**
     * \brief 当前设置中的地址与脱敏令牌；读取失败按缺失处理。
     */
    pub fn current_config(&self) -> CurrentConfig {
        CurrentConfig {
            api_url: self.settings.current_api_url().unwrap_or(None),
            api_token: self
                .settings
                .current_api_token()
                .unwrap_or(None)
                .map(|t| mask_token(&t)),
        }
    }

    pub fn export_stations(&self) -> Result<Vec<RelayStation>> {
        self.list_stations()
    }

    pub fn import_stations(&self, request: &ImportRelayStationsRequest) -> Result<ImportResult> {
        let result = store::import_stations(&self.db(), request, validate_create)?;
        self.telemetry.log_event("relay_station", &result.message);
        Ok(result)
    }

    pub fn get_settings(&self) -> Result<Value> {
        self.settings.read()
    }

    pub fn save_settings(&self, settings: &Value) -> Result<String> {
        self.settings.write(settings)?;
        Ok("Claude 设置已保存".to_string())
    }

    pub async fn packycode_quota(&self, station_id: &str) -> Result<PackycodeUserQuota> {
        let station = self.get_station(station_id)?;
        quota::fetch_quota(&self.client, &station)
            .await
            .inspect_err(|e| {
                self.telemetry
                    .log_error("quota", &format!("{}: {:#}", station_id, e))
            })
    }

    /**
     * \brief 通过中转站对应的适配器查询站点信息。
     */
    pub async fn station_info(&self, station_id: &str) -> Result<StationInfo> {
        let station = self.get_station(station_id)?;
        adapters::adapter_for(station.adapter, self.client.clone())
            .station_info(&station)
            .await
            .map_err(|e| {
                self.telemetry
                    .log_error("relay_adapter", &format!("get info {}: {:#}", station_id, e));
                anyhow!("获取中转站信息失败: {}", e)
            })
    }

    pub async fn station_user_info(
        &self,
        station_id: &str,
        user_id: &str,
    ) -> Result<StationUserInfo> {
        let station = self.get_station(station_id)?;
        adapters::adapter_for(station.adapter, self.client.clone())
            .user_info(&station, user_id)
            .await
            .map_err(|e| {
                self.telemetry.log_error(
                    "relay_adapter",
                    &format!("get user info {}: {:#}", station_id, e),
                );
                anyhow!("获取用户信息失败: {}", e)
            })
    }

    /**
     * \brief 测试中转站连通性；只有中转站不存在时返回错误。
     */
    pub async fn test_connection(&self, station_id: &str) -> Result<ConnectionTestResult> {
        let station = self.get_station(station_id)?;
        let result = adapters::adapter_for(station.adapter, self.client.clone())
            .test_connection(&station)
            .await;
        self.telemetry.log_event(
            "relay_adapter",
            &format!(
                "test connection {} success={} {}ms",
                station_id, result.success, result.response_time
            ),
        );
        Ok(result)
    }

    pub fn list_nodes(&self, adapter: Option<Adapter>, enabled_only: bool) -> Result<Vec<ApiNode>> {
        store::list_nodes(&self.db(), adapter, enabled_only)
    }

    pub fn create_node(&self, request: &CreateApiNodeRequest) -> Result<ApiNode> {
        store::insert_node(&self.db(), request)
    }

    pub fn update_node(&self, id: &str, request: &UpdateApiNodeRequest) -> Result<ApiNode> {
        store::update_node(&self.db(), id, request)
    }

    pub fn delete_node(&self, id: &str) -> Result<()> {
        store::delete_node(&self.db(), id)
    }

    pub fn init_default_nodes(&self) -> Result<usize> {
        let inserted = store::seed_default_nodes(&self.db())?;
        self.telemetry
            .log_event("api_node", &format!("seeded {} default nodes", inserted));
        Ok(inserted)
    }

    /**
     * \brief 单节点连通性测试。
     * \details 任何 HTTP 响应（含 4xx）都视为可达，5xx 视为失败，超过时限记为超时。
     */
    pub async fn test_node(&self, url: &str, timeout_ms: u64) -> NodeTestReport {
        let timeout = Duration::from_millis(timeout_ms);
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.prober.probe(url, timeout)).await;
        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Err(_) => NodeTestReport::timeout(url, timeout_ms),
            Ok(ProbeOutcome::Reachable { status: Some(code) }) if code >= 500 => {
                NodeTestReport::failure(url, Some(elapsed), format!("服务器错误 (HTTP {})", code))
            }
            Ok(ProbeOutcome::Reachable { status: Some(code) }) => {
                NodeTestReport::success(url, elapsed, format!("连接成功 (HTTP {})", code))
            }
            Ok(ProbeOutcome::Reachable { status: None }) => {
                NodeTestReport::success(url, elapsed, "连接成功".to_string())
            }
            Ok(ProbeOutcome::Unreachable(err)) => NodeTestReport::failure(url, Some(elapsed), err),
        }
    }

    /**
     * \brief 并发测试某适配器下所有启用节点，报告带节点 ID 与名称。
     */
    pub async fn test_all_nodes(
        &self,
        adapter: Option<Adapter>,
        timeout_ms: u64,
    ) -> Result<Vec<NodeTestReport>> {
        let nodes = self.list_nodes(adapter, true)?;
        let reports = join_all(nodes.iter().map(|node| async move {
            let mut report = self.test_node(&node.url, timeout_ms).await;
            report.node_id = Some(node.id.clone());
            report.node_name = Some(node.name.clone());
            report
        }))
        .await;
        Ok(reports)
    }

    pub async fn flush_dns(&self) -> Result<String> {
        system::flush_dns().await
    }
}

#[derive(Deserialize)]
struct IdArgs {
    id: String,
}

#[derive(Deserialize)]
struct ToggleArgs {
    id: String,
    enabled: bool,
}

#[derive(Deserialize)]
struct RequestArgs<T> {
    request: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderArgs {
    station_ids: Vec<String>,
}

#[derive(Deserialize)]
struct SettingsArgs {
    settings: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StationIdArgs {
    station_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserInfoArgs {
    station_id: String,
    user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListNodesArgs {
    #[serde(default)]
    adapter: Option<Adapter>,
    #[serde(default)]
    enabled_only: Option<bool>,
}

#[derive(Deserialize)]
struct UpdateNodeArgs {
    id: String,
    request: UpdateApiNodeRequest,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestNodeArgs {
    url: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestAllArgs {
    #[serde(default)]
    adapter: Option<Adapter>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn args<T: DeserializeOwned>(command: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload).with_context(|| format!("invalid arguments for {}", command))
}

fn reply<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

#[async_trait]
impl Invoke for LocalBackend {
    async fn invoke(&self, command: &str, payload: Value) -> Result<Value> {
        match command {
            commands::RELAY_STATIONS_LIST => reply(self.list_stations()?),
            commands::RELAY_STATION_GET => {
                let a: IdArgs = args(command, payload)?;
                reply(self.get_station(&a.id)?)
            }
            commands::RELAY_STATION_CREATE => {
                let a: RequestArgs<CreateRelayStationRequest> = args(command, payload)?;
                reply(self.create_station(&a.request)?)
            }
            commands::RELAY_STATION_UPDATE => {
                let a: RequestArgs<UpdateRelayStationRequest> = args(command, payload)?;
                reply(self.update_station(&a.request)?)
            }
            commands::RELAY_STATION_DELETE => {
                let a: IdArgs = args(command, payload)?;
                reply(self.delete_station(&a.id)?)
            }
            commands::RELAY_STATION_TOGGLE_ENABLE => {
                let a: ToggleArgs = args(command, payload)?;
                reply(self.toggle_station(&a.id, a.enabled)?)
            }
            commands::RELAY_STATION_UPDATE_ORDER => {
                let a: OrderArgs = args(command, payload)?;
                reply(self.update_station_order(&a.station_ids)?)
            }
            commands::RELAY_STATION_SYNC_CONFIG => reply(self.sync_config()?),
            commands::RELAY_STATION_RESTORE_CONFIG => reply(self.restore_config()?),
            commands::RELAY_STATION_GET_CURRENT_CONFIG => reply(self.current_config()),
            commands::RELAY_STATIONS_EXPORT => reply(self.export_stations()?),
            commands::RELAY_STATIONS_IMPORT => {
                let a: RequestArgs<ImportRelayStationsRequest> = args(command, payload)?;
                reply(self.import_stations(&a.request)?)
            }
            commands::GET_CLAUDE_SETTINGS => reply(self.get_settings()?),
            commands::SAVE_CLAUDE_SETTINGS => {
                let a: SettingsArgs = args(command, payload)?;
                reply(self.save_settings(&a.settings)?)
            }
            commands::PACKYCODE_GET_USER_QUOTA => {
                let a: StationIdArgs = args(command, payload)?;
                reply(self.packycode_quota(&a.station_id).await?)
            }
            commands::RELAY_STATION_GET_INFO => {
                let a: StationIdArgs = args(command, payload)?;
                reply(self.station_info(&a.station_id).await?)
            }
            commands::RELAY_STATION_GET_USER_INFO => {
                let a: UserInfoArgs = args(command, payload)?;
                reply(self.station_user_info(&a.station_id, &a.user_id).await?)
            }
            commands::RELAY_STATION_TEST_CONNECTION => {
                let a: StationIdArgs = args(command, payload)?;
                reply(self.test_connection(&a.station_id).await?)
            }
            commands::LIST_API_NODES => {
                let a: ListNodesArgs = args(command, payload)?;
                reply(self.list_nodes(a.adapter, a.enabled_only.unwrap_or(false))?)
            }
            commands::CREATE_API_NODE => {
                let a: RequestArgs<CreateApiNodeRequest> = args(command, payload)?;
                reply(self.create_node(&a.request)?)
            }
            commands::UPDATE_API_NODE => {
                let a: UpdateNodeArgs = args(command, payload)?;
                reply(self.update_node(&a.id, &a.request)?)
            }
            commands::DELETE_API_NODE => {
                let a: IdArgs = args(command, payload)?;
                reply(self.delete_node(&a.id)?)
            }
            commands::INIT_DEFAULT_NODES => {
                self.init_default_nodes()?;
                Ok(Value::Null)
            }
            commands::TEST_API_NODE => {
                let a: TestNodeArgs = args(command, payload)?;
                let timeout = a.timeout_ms.unwrap_or(NODE_TEST_TIMEOUT_MS);
                reply(self.test_node(&a.url, timeout).await)
            }
            commands::TEST_ALL_API_NODES => {
                let a: TestAllArgs = args(command, payload)?;
                let timeout = a.timeout_ms.unwrap_or(NODE_TEST_TIMEOUT_MS);
                reply(self.test_all_nodes(a.adapter, timeout).await?)
            }
            commands::FLUSH_DNS => reply(self.flush_dns().await?),
            other => Err(anyhow!("unknown command: {}", other)),
        }
    }
}
