use anyhow::{anyhow, bail, Result};
use serde_json::Value;

use crate::{
    models::{Adapter, PackycodeUserQuota, RelayStation},
    packycode::quota_endpoint,
};

/**
 * \brief 查询 PackyCode 用户额度，按中转站地址选择公交车或滴滴车账户接口。
 */
pub async fn fetch_quota(
    client: &reqwest::Client,
    station: &RelayStation,
) -> Result<PackycodeUserQuota> {
    if station.adapter != Adapter::Packycode {
        bail!("此功能仅支持 PackyCode 中转站");
    }
    let url = quota_endpoint(&station.api_url);
    let resp = client
        .get(url)
        .bearer_auth(&station.system_token)
        .header("Accept", "*/*")
        .send()
        .await
        .map_err(|e| {
            if e.is_connect() {
                anyhow!("网络连接失败: {}", e)
            } else if e.is_timeout() {
                anyhow!("请求超时: {}", e)
            } else {
                anyhow!("请求失败: {}", e)
            }
        })?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(match status.as_u16() {
            401 => anyhow!("Token 无效或已过期"),
            403 => anyhow!("权限不足"),
            400 => anyhow!("请求参数错误: {}", text),
            _ => anyhow!("请求失败 ({}): {}", status, text),
        });
    }
    let data: Value = resp
        .json()
        .await
        .map_err(|e| anyhow!("解析响应失败: {}", e))?;
    Ok(parse_quota(&data))
}

/**
 * \brief 宽松解析账户信息：金额字段可能是数字或字符串，缺失按 0 处理。
 */
pub fn parse_quota(data: &Value) -> PackycodeUserQuota {
    let text = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);
    PackycodeUserQuota {
        daily_budget_usd: to_f64(data.get("daily_budget_usd")),
        daily_spent_usd: to_f64(data.get("daily_spent_usd")),
        monthly_budget_usd: to_f64(data.get("monthly_budget_usd")),
        monthly_spent_usd: to_f64(data.get("monthly_spent_usd")),
        balance_usd: to_f64(data.get("balance_usd")),
        total_spent_usd: to_f64(data.get("total_spent_usd")),
        plan_type: text("plan_type").unwrap_or_else(|| "basic".to_string()),
        plan_expires_at: text("plan_expires_at"),
        username: text("username"),
        email: text("email"),
        opus_enabled: data.get("opus_enabled").and_then(Value::as_bool),
    }
}

fn to_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}
