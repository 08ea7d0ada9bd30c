use std::{fmt, str::FromStr};

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/**
 * \brief 中转站适配器类型（封闭集合）。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Adapter {
    Packycode,
    Deepseek,
    Glm,
    Qwen,
    Kimi,
    Custom,
}

impl Adapter {
    pub const ALL: [Adapter; 6] = [
        Adapter::Packycode,
        Adapter::Deepseek,
        Adapter::Glm,
        Adapter::Qwen,
        Adapter::Kimi,
        Adapter::Custom,
    ];

    /**
     * \brief 线上传输使用的标识字符串。
     */
    pub fn as_str(&self) -> &'static str {
        match self {
            Adapter::Packycode => "packycode",
            Adapter::Deepseek => "deepseek",
            Adapter::Glm => "glm",
            Adapter::Qwen => "qwen",
            Adapter::Kimi => "kimi",
            Adapter::Custom => "custom",
        }
    }

    /**
     * \brief 非自定义适配器的展示名称，用于自动派生中转站名称。
     */
    pub fn display_name(&self) -> &'static str {
        match self {
            Adapter::Packycode => "PackyCode",
            Adapter::Deepseek => "DeepSeek",
            Adapter::Glm => "GLM",
            Adapter::Qwen => "Qwen",
            Adapter::Kimi => "Kimi",
            Adapter::Custom => "Custom",
        }
    }

    /**
     * \brief 适配器的官方默认 API 地址；自定义适配器没有默认值。
     */
    pub fn default_api_url(&self) -> &'static str {
        match self {
            Adapter::Packycode => "https://api.packycode.com",
            Adapter::Deepseek => "https://api.deepseek.com/anthropic",
            Adapter::Glm => "https://open.bigmodel.cn/api/anthropic",
            Adapter::Qwen => "https://dashscope.aliyuncs.com/api/v2/apps/claude-code-proxy",
            Adapter::Kimi => "https://api.moonshot.cn/anthropic",
            Adapter::Custom => "",
        }
    }
}

impl fmt::Display for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Adapter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Adapter::ALL
            .into_iter()
            .find(|a| a.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| anyhow!("unknown adapter: {}", s))
    }
}

/**
 * \brief 认证方式。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    #[default]
    BearerToken,
    ApiKey,
    Custom,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::BearerToken => "bearer_token",
            AuthMethod::ApiKey => "api_key",
            AuthMethod::Custom => "custom",
        }
    }
}

impl FromStr for AuthMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "bearer_token" => Ok(AuthMethod::BearerToken),
            "api_key" => Ok(AuthMethod::ApiKey),
            "custom" => Ok(AuthMethod::Custom),
            other => Err(anyhow!("unknown auth method: {}", other)),
        }
    }
}

/**
 * \brief 中转站配置。
 * \details 后端为唯一事实来源，前端只持有可能过期的副本。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayStation {
    /** \brief UUID 主键 */
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /** \brief API 基础地址 */
    pub api_url: String,
    pub adapter: Adapter,
    pub auth_method: AuthMethod,
    /** \brief 系统令牌，写入 ANTHROPIC_AUTH_TOKEN */
    pub system_token: String,
    pub user_id: Option<String>,
    pub adapter_config: Option<Map<String, Value>>,
    /** \brief 全局最多一个中转站处于启用状态 */
    pub enabled: bool,
    #[serde(default)]
    pub display_order: i32,
    /** \brief Unix 秒 */
    pub created_at: i64,
    pub updated_at: i64,
}

/**
 * \brief 创建中转站请求（不含自动生成字段）。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRelayStationRequest {
    pub name: String,
    pub description: Option<String>,
    pub api_url: String,
    pub adapter: Adapter,
    pub auth_method: AuthMethod,
    pub system_token: String,
    pub user_id: Option<String>,
    pub adapter_config: Option<Map<String, Value>>,
    pub enabled: bool,
}

/**
 * \brief 更新中转站请求。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRelayStationRequest {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub api_url: String,
    pub adapter: Adapter,
    pub auth_method: AuthMethod,
    pub system_token: String,
    pub user_id: Option<String>,
    pub adapter_config: Option<Map<String, Value>>,
    pub enabled: bool,
}

/**
 * \brief 批量导入请求。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRelayStationsRequest {
    pub stations: Vec<CreateRelayStationRequest>,
    /** \brief 是否先清空现有中转站 */
    pub clear_existing: bool,
}

/**
 * \brief 导入结果统计。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    pub total: usize,
    pub imported: usize,
    /** \brief 与现有中转站 api_url + system_token 完全重复而跳过的数量 */
    pub skipped: usize,
    pub failed: usize,
    pub message: String,
}

/**
 * \brief 当前 Claude 配置中的 API 信息快照，令牌已脱敏。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentConfig {
    pub api_url: Option<String>,
    pub api_token: Option<String>,
}

/**
 * \brief API 节点：某个适配器的候选端点。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiNode {
    pub id: String,
    pub name: String,
    pub url: String,
    pub adapter: Adapter,
    pub description: Option<String>,
    pub enabled: bool,
    /** \brief 内置预设节点 */
    pub is_default: bool,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateApiNodeRequest {
    pub name: String,
    pub url: String,
    pub adapter: Adapter,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateApiNodeRequest {
    pub name: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
}

/**
 * \brief 后端节点测试状态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Failure,
    Timeout,
}

/**
 * \brief `test_api_node` / `test_all_api_nodes` 返回的测试报告。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTestReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    pub url: String,
    pub status: ReportStatus,
    /** \brief 响应时间（毫秒） */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

impl NodeTestReport {
    pub fn success(url: &str, response_time: u64, message: String) -> Self {
        Self {
            node_id: None,
            node_name: None,
            url: url.to_string(),
            status: ReportStatus::Success,
            response_time_ms: Some(response_time),
            message,
            error_details: None,
        }
    }

    pub fn failure(url: &str, response_time: Option<u64>, error: String) -> Self {
        Self {
            node_id: None,
            node_name: None,
            url: url.to_string(),
            status: ReportStatus::Failure,
            response_time_ms: response_time,
            message: "连接失败".to_string(),
            error_details: Some(error),
        }
    }

    pub fn timeout(url: &str, timeout_ms: u64) -> Self {
        Self {
            node_id: None,
            node_name: None,
            url: url.to_string(),
            status: ReportStatus::Timeout,
            response_time_ms: Some(timeout_ms),
            message: "连接超时".to_string(),
            error_details: Some(format!("请求超过 {} 毫秒未响应", timeout_ms)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Success
    }
}

/**
 * \brief PackyCode 用户额度快照，仅缓存在内存中。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackycodeUserQuota {
    pub daily_budget_usd: f64,
    pub daily_spent_usd: f64,
    pub monthly_budget_usd: f64,
    pub monthly_spent_usd: f64,
    pub balance_usd: f64,
    pub total_spent_usd: f64,
    /** \brief 计划类型（pro、basic 等） */
    pub plan_type: String,
    pub plan_expires_at: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub opus_enabled: Option<bool>,
}

/**
 * \brief 适配器查询到的中转站概况。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationInfo {
    pub name: String,
    pub announcement: Option<String>,
    pub api_url: String,
    pub version: Option<String>,
    /** \brief 适配器类型与支持的功能等附加信息 */
    pub metadata: Option<Map<String, Value>>,
    pub quota_per_unit: Option<i64>,
}

/**
 * \brief 中转站账户信息，额度单位由中转站决定。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationUserInfo {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
    pub group: String,
    pub status: String,
}

/**
 * \brief 中转站连通性测试结果；连接失败同样以结果返回而非错误。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    /** \brief 响应时间（毫秒） */
    pub response_time: u64,
    pub message: String,
    pub details: Option<String>,
}
