use std::{convert::Infallible, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, get_service, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::services::ServeDir;

use crate::{
    backend::LocalBackend,
    bridge::Invoke,
    config::NODE_TEST_TIMEOUT_MS,
    models::Adapter,
    packycode::ServiceType,
    probe::{probe_stream, select_fastest, NodeCandidate, NodeTestResult},
};

type AppState = Arc<LocalBackend>;

/**
 * \brief 构建路由：命令调用、节点测速 SSE 与健康检查。
 */
pub fn router(backend: AppState) -> Router {
    Router::new()
        .route("/api/invoke/{command}", post(invoke_command))
        .route("/api/nodes/probe/sse", get(probe_sse))
        .route("/api/health", get(health_check))
        .with_state(backend)
}

/**
 * \brief 启动本地 HTTP 服务，提供静态前端与 API。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 * \param ui_dir 静态前端目录，缺省时使用 "web"
 */
pub async fn run(addr: &str, backend: AppState, ui_dir: Option<PathBuf>) -> Result<()> {
    let ui_root = ui_dir.unwrap_or_else(|| PathBuf::from("web"));
    let static_service = get_service(ServeDir::new(ui_root).append_index_html_on_directories(true));
    let app = router(backend).fallback_service(static_service);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief 通用命令入口：POST /api/invoke/{command}，请求体即命令负载。
 */
async fn invoke_command(
    State(backend): State<AppState>,
    Path(command): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, String)> {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        serde_json::from_slice(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    };
    match backend.invoke(&command, payload).await {
        Ok(value) => Ok(Json(value)),
        Err(e) => {
            backend
                .telemetry()
                .log_error("server.invoke", &format!("{} failed: {:#}", command, e));
            Err(internal_err(e))
        }
    }
}

#[derive(Deserialize, Debug)]
struct ProbeQuery {
    /** \brief 适配器，缺省为 packycode */
    adapter: Option<Adapter>,
    /** \brief PackyCode 服务类型；提供时测试内置节点池，否则测试数据库中的启用节点 */
    service_type: Option<ServiceType>,
    timeout_ms: Option<u64>,
}

/**
 * \brief 节点测速 SSE：GET /api/nodes/probe/sse?adapter=...&service_type=...
 * \details 每完成一个节点推送一条 `result`，全部结束后推送 `best`（可能为 null）与 `done`。
 */
async fn probe_sse(
    State(backend): State<AppState>,
    Query(q): Query<ProbeQuery>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>,
    (StatusCode, String),
> {
    let adapter = q.adapter.unwrap_or(Adapter::Packycode);
    let candidates: Vec<NodeCandidate> = match (adapter, q.service_type) {
        (Adapter::Packycode, Some(service_type)) => service_type.candidates(),
        _ => backend
            .list_nodes(Some(adapter), true)
            .map_err(internal_err)?
            .iter()
            .map(NodeCandidate::from)
            .collect(),
    };
    let timeout = Duration::from_millis(q.timeout_ms.unwrap_or(NODE_TEST_TIMEOUT_MS));
    backend.telemetry().log_event(
        "server.probe",
        &format!("adapter={} candidates={}", adapter, candidates.len()),
    );

    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let _ = tx.send(Ok(Event::default()
        .event("meta")
        .data(json!({ "adapter": adapter, "total": candidates.len() }).to_string())));

    let prober = backend.prober();
    tokio::spawn(async move {
        let mut results: Vec<NodeTestResult> = Vec::with_capacity(candidates.len());
        let mut stream = Box::pin(probe_stream(prober, candidates.clone(), timeout));
        while let Some(result) = stream.next().await {
            if let Ok(data) = serde_json::to_string(&result) {
                let _ = tx.send(Ok(Event::default().event("result").data(data)));
            }
            results.push(result);
        }
        let best = select_fastest(&candidates, &results);
        let _ = tx.send(Ok(Event::default()
            .event("best")
            .data(json!(best).to_string())));
        let _ = tx.send(Ok(Event::default().event("done").data("")));
    });

    let stream = UnboundedReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}

/**
 * \brief 健康检查：返回中转站数量与当前启用项。
 */
async fn health_check(
    State(backend): State<AppState>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let stations = backend.list_stations().map_err(internal_err)?;
    let enabled = stations.iter().find(|s| s.enabled).map(|s| s.name.clone());
    Ok(Json(json!({
        "ok": true,
        "stations": stations.len(),
        "enabled": enabled,
        "telemetry": backend.telemetry().is_enabled()
    })))
}

fn internal_err<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bridge::{CommandBridge, HttpInvoke, InvokeBridge},
        models::{AuthMethod, CreateRelayStationRequest},
        testing::memory_backend,
    };

    #[tokio::test]
    async fn test_http_bridge_round_trips_through_router() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(memory_backend(dir.path()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(backend)).await;
        });

        let bridge = InvokeBridge::new(HttpInvoke::new(format!("http://{}", addr)).unwrap());
        let created = bridge
            .create_station(&CreateRelayStationRequest {
                name: "Kimi".into(),
                description: None,
                api_url: "https://api.moonshot.cn/anthropic".into(),
                adapter: Adapter::Kimi,
                auth_method: AuthMethod::BearerToken,
                system_token: "sk-kimi-000111".into(),
                user_id: None,
                adapter_config: None,
                enabled: false,
            })
            .await
            .expect("create over http");
        let stations = bridge.list_stations().await.expect("list over http");
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].id, created.id);

        let err = bridge.delete_station("missing").await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
