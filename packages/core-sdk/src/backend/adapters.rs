use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use crate::{
    config::NODE_TEST_TIMEOUT_MS,
    models::{Adapter, ConnectionTestResult, RelayStation, StationInfo, StationUserInfo},
};

const INFO_TIMEOUT: Duration = Duration::from_secs(10);

/**
 * \brief 中转站适配器：按服务商查询站点信息、账户信息并测试连通性。
 */
#[async_trait]
pub trait StationAdapter: Send + Sync {
    async fn station_info(&self, station: &RelayStation) -> Result<StationInfo>;

    async fn user_info(&self, station: &RelayStation, user_id: &str) -> Result<StationUserInfo>;

    /**
     * \brief 测试连通性；网络失败记录在结果里，不作为错误返回。
     */
    async fn test_connection(&self, station: &RelayStation) -> ConnectionTestResult;
}

/**
 * \brief 按适配器类型选择实现；DeepSeek、GLM、Qwen、Kimi 与自定义共用通用实现。
 */
pub fn adapter_for(adapter: Adapter, client: reqwest::Client) -> Box<dyn StationAdapter> {
    match adapter {
        Adapter::Packycode => Box::new(PackycodeAdapter { client }),
        Adapter::Deepseek | Adapter::Glm | Adapter::Qwen | Adapter::Kimi | Adapter::Custom => {
            Box::new(CustomAdapter { client })
        }
    }
}

fn endpoint(station: &RelayStation, path: &str) -> String {
    format!("{}{}", station.api_url.trim_end_matches('/'), path)
}

fn metadata(adapter: &str, features: &[&str]) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("adapter_type".to_string(), json!(adapter));
    if !features.is_empty() {
        map.insert("support_features".to_string(), json!(features));
    }
    map
}

/**
 * \brief PackyCode：`/health` 判断服务状态，`/user/info` 读取账户，使用 `X-API-Key` 认证。
 */
pub struct PackycodeAdapter {
    client: reqwest::Client,
}

#[async_trait]
impl StationAdapter for PackycodeAdapter {
    async fn station_info(&self, station: &RelayStation) -> Result<StationInfo> {
        let resp = self
            .client
            .get(endpoint(station, "/health"))
            .header("X-API-Key", &station.system_token)
            .timeout(INFO_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(anyhow!("PackyCode 服务不可用 (HTTP {})", resp.status().as_u16()));
        }
        Ok(StationInfo {
            name: station.name.clone(),
            announcement: Some("PackyCode 服务运行正常".to_string()),
            api_url: station.api_url.clone(),
            version: Some("PackyCode v1.0".to_string()),
            metadata: Some(metadata("packycode", &["quota_query", "usage_stats"])),
            quota_per_unit: Some(1),
        })
    }

    async fn user_info(&self, station: &RelayStation, _user_id: &str) -> Result<StationUserInfo> {
        let resp = self
            .client
            .get(endpoint(station, "/user/info"))
            .header("X-API-Key", &station.system_token)
            .timeout(INFO_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(anyhow!("获取用户信息失败 (HTTP {})", resp.status().as_u16()));
        }
        let data: Value = resp
            .json()
            .await
            .map_err(|e| anyhow!("解析响应失败: {}", e))?;
        Ok(parse_packycode_user(&data))
    }

    async fn test_connection(&self, station: &RelayStation) -> ConnectionTestResult {
        let started = Instant::now();
        let info = self.station_info(station).await;
        let response_time = started.elapsed().as_millis() as u64;
        match info {
            Ok(info) => ConnectionTestResult {
                success: true,
                response_time,
                message: format!("{} - 连接成功", info.name),
                details: Some(format!(
                    "服务版本: {}",
                    info.version.unwrap_or_else(|| "Unknown".to_string())
                )),
            },
            Err(e) => ConnectionTestResult {
                success: false,
                response_time,
                message: format!("连接失败: {}", e),
                details: None,
            },
        }
    }
}

/**
 * \brief 账户字段缺失时按 0 或默认名称处理。
 */
pub fn parse_packycode_user(data: &Value) -> StationUserInfo {
    let int = |key: &str| data.get(key).and_then(Value::as_i64).unwrap_or(0);
    StationUserInfo {
        id: "packycode_user".to_string(),
        username: data
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or("PackyCode用户")
            .to_string(),
        display_name: Some("PackyCode用户".to_string()),
        email: data.get("email").and_then(Value::as_str).map(str::to_string),
        quota: int("quota"),
        used_quota: int("used_quota"),
        request_count: int("request_count"),
        group: "default".to_string(),
        status: "active".to_string(),
    }
}

/**
 * \brief 通用实现：站点信息取自本地配置，连通性用带 Bearer 令牌的 GET 判断。
 */
pub struct CustomAdapter {
    client: reqwest::Client,
}

#[async_trait]
impl StationAdapter for CustomAdapter {
    async fn station_info(&self, station: &RelayStation) -> Result<StationInfo> {
        Ok(StationInfo {
            name: station.name.clone(),
            announcement: None,
            api_url: station.api_url.clone(),
            version: Some("Custom".to_string()),
            metadata: Some(metadata(station.adapter.as_str(), &[])),
            quota_per_unit: None,
        })
    }

    async fn user_info(&self, _station: &RelayStation, user_id: &str) -> Result<StationUserInfo> {
        Ok(StationUserInfo {
            id: user_id.to_string(),
            username: "自定义用户".to_string(),
            display_name: Some("自定义适配器用户".to_string()),
            email: None,
            quota: 0,
            used_quota: 0,
            request_count: 0,
            group: "custom".to_string(),
            status: "active".to_string(),
        })
    }

    async fn test_connection(&self, station: &RelayStation) -> ConnectionTestResult {
        let started = Instant::now();
        let resp = self
            .client
            .get(&station.api_url)
            .bearer_auth(&station.system_token)
            .timeout(Duration::from_millis(NODE_TEST_TIMEOUT_MS))
            .send()
            .await;
        let response_time = started.elapsed().as_millis() as u64;
        match resp {
            Ok(resp) => {
                let status = resp.status();
                ConnectionTestResult {
                    success: status.is_success(),
                    response_time,
                    message: if status.is_success() {
                        format!("{} - 连接成功", station.name)
                    } else {
                        format!("HTTP {}: 服务器响应错误", status.as_u16())
                    },
                    details: Some(format!("响应状态: {}", status)),
                }
            }
            Err(e) => ConnectionTestResult {
                success: false,
                response_time,
                message: format!("连接失败: {}", e),
                details: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuthMethod;
    use axum::{http::StatusCode, routing::get, Json, Router};

    fn station(adapter: Adapter, api_url: &str) -> RelayStation {
        RelayStation {
            id: "s1".into(),
            name: "测试站".into(),
            description: None,
            api_url: api_url.into(),
            adapter,
            auth_method: AuthMethod::BearerToken,
            system_token: "sk-test-token".into(),
            user_id: None,
            adapter_config: None,
            enabled: false,
            display_order: 0,
            created_at: 1,
            updated_at: 1,
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[test]
    fn test_packycode_user_fields_default_when_missing() {
        let user = parse_packycode_user(&json!({"username": "rider", "quota": 500}));
        assert_eq!(user.username, "rider");
        assert_eq!(user.quota, 500);
        assert_eq!(user.used_quota, 0);
        assert_eq!(user.email, None);

        let empty = parse_packycode_user(&json!({}));
        assert_eq!(empty.username, "PackyCode用户");
    }

    #[tokio::test]
    async fn test_packycode_connection_follows_health_endpoint() {
        let base = serve(
            Router::new()
                .route("/health", get(|| async { "ok" }))
                .route(
                    "/user/info",
                    get(|| async { Json(json!({"username": "rider", "used_quota": 7})) }),
                ),
        )
        .await;
        let adapter = adapter_for(Adapter::Packycode, client());
        let packy = station(Adapter::Packycode, &base);

        let result = adapter.test_connection(&packy).await;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.message, "测试站 - 连接成功");

        let user = adapter.user_info(&packy, "ignored").await.unwrap();
        assert_eq!(user.username, "rider");
        assert_eq!(user.used_quota, 7);

        let info = adapter.station_info(&packy).await.unwrap();
        assert_eq!(info.metadata.unwrap()["adapter_type"], "packycode");
    }

    #[tokio::test]
    async fn test_custom_connection_reports_server_errors_as_failed() {
        let base = serve(Router::new().route(
            "/",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        ))
        .await;
        let adapter = adapter_for(Adapter::Kimi, client());
        let result = adapter
            .test_connection(&station(Adapter::Kimi, &format!("{}/", base)))
            .await;
        assert!(!result.success);
        assert!(result.message.starts_with("HTTP 503"));

        let unreachable = adapter
            .test_connection(&station(Adapter::Kimi, "http://127.0.0.1:1"))
            .await;
        assert!(!unreachable.success);
        assert!(unreachable.message.starts_with("连接失败"));
    }

    #[tokio::test]
    async fn test_custom_info_comes_from_local_config() {
        let adapter = adapter_for(Adapter::Custom, client());
        let info = adapter
            .station_info(&station(Adapter::Custom, "https://relay.example.com"))
            .await
            .unwrap();
        assert_eq!(info.version.as_deref(), Some("Custom"));
        assert_eq!(info.quota_per_unit, None);
        let user = adapter
            .user_info(&station(Adapter::Custom, "https://relay.example.com"), "u-9")
            .await
            .unwrap();
        assert_eq!(user.id, "u-9");
    }
}
