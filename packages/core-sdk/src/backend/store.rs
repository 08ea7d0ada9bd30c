use anyhow::{bail, Result};
use rusqlite::{params, params_from_iter, types::Type, Connection, ErrorCode, OptionalExtension};
use serde_json::{Map, Value};
use std::{path::Path, thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use crate::models::{
    Adapter, ApiNode, CreateApiNodeRequest, CreateRelayStationRequest, ImportRelayStationsRequest,
    ImportResult, RelayStation, UpdateApiNodeRequest, UpdateRelayStationRequest,
};

const STATION_COLUMNS: &str = "id, name, description, api_url, adapter, auth_method, system_token, \
     user_id, adapter_config, enabled, display_order, created_at, updated_at";

const NODE_COLUMNS: &str =
    "id, name, url, adapter, description, enabled, is_default, created_at, updated_at";

/**
 * \brief 内置预设节点：名称、URL、适配器、描述。
 */
const DEFAULT_NODES: &[(&str, &str, Adapter, &str)] = &[
    ("🚌 默认节点", "https://www.packyapi.com", Adapter::Packycode, "PackyCode 默认节点"),
    ("⚖️ 负载均衡", "https://api-slb.packyapi.com", Adapter::Packycode, "PackyCode 负载均衡节点"),
    ("默认节点", "https://api.deepseek.com/anthropic", Adapter::Deepseek, "DeepSeek 官方节点"),
    ("默认节点", "https://open.bigmodel.cn/api/anthropic", Adapter::Glm, "智谱 GLM 官方节点"),
    (
        "默认节点",
        "https://dashscope.aliyuncs.com/api/v2/apps/claude-code-proxy",
        Adapter::Qwen,
        "通义千问官方节点",
    ),
    ("默认节点", "https://api.moonshot.cn/anthropic", Adapter::Kimi, "Moonshot Kimi 官方节点"),
];

/**
 * \brief 打开指定路径的数据库文件，必要时创建父目录。
 */
pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS relay_stations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            api_url TEXT NOT NULL,
            adapter TEXT NOT NULL,
            auth_method TEXT NOT NULL,
            system_token TEXT NOT NULL,
            user_id TEXT,
            adapter_config TEXT,
            enabled INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS api_nodes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            url TEXT NOT NULL UNIQUE,
            adapter TEXT NOT NULL,
            description TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            is_default INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_api_nodes_adapter ON api_nodes(adapter);

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;

    ensure_display_order_column(conn)?;
    Ok(())
}

fn ensure_display_order_column(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(relay_stations)")?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == "display_order" {
            has = true;
            break;
        }
    }
    if !has {
        retry_on_locked(|| {
            conn.execute(
                "ALTER TABLE relay_stations ADD COLUMN display_order INTEGER NOT NULL DEFAULT 0",
                [],
            )
        })?;
    }
    Ok(())
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, if value { "1" } else { "0" }],
        )
    })?;
    Ok(())
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val.map(|s| s == "1").unwrap_or(default))
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, "telemetry_enabled", enabled)
}

fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn map_station(row: &rusqlite::Row<'_>) -> rusqlite::Result<RelayStation> {
    let adapter: String = row.get(4)?;
    let auth_method: String = row.get(5)?;
    let adapter_config: Option<String> = row.get(8)?;
    let adapter_config = adapter_config
        .filter(|s| !s.trim().is_empty())
        .map(|s| serde_json::from_str::<Map<String, Value>>(&s))
        .transpose()
        .map_err(|e| conversion_err(8, e))?;
    Ok(RelayStation {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        api_url: row.get(3)?,
        adapter: adapter.parse().map_err(|e: anyhow::Error| conversion_err(4, e))?,
        auth_method: auth_method
            .parse()
            .map_err(|e: anyhow::Error| conversion_err(5, e))?,
        system_token: row.get(6)?,
        user_id: row.get(7)?,
        adapter_config,
        enabled: row.get::<_, i64>(9)? != 0,
        display_order: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn config_text(config: &Option<Map<String, Value>>) -> Result<Option<String>> {
    Ok(config.as_ref().map(serde_json::to_string).transpose()?)
}

fn now_secs() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn now_rfc3339() -> Result<String> {
    Ok(OffsetDateTime::now_utc().format(&Rfc3339)?)
}

/**
 * \brief 列出所有中转站，按显示顺序与创建时间排序。
 */
pub fn list_stations(conn: &Connection) -> Result<Vec<RelayStation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM relay_stations ORDER BY display_order ASC, created_at DESC",
        STATION_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], map_station)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 按 ID 获取中转站。
 */
pub fn get_station(conn: &Connection, id: &str) -> Result<Option<RelayStation>> {
    conn.query_row(
        &format!("SELECT {} FROM relay_stations WHERE id=?1", STATION_COLUMNS),
        params![id],
        map_station,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 当前启用的中转站（至多一个）。
 */
pub fn get_enabled_station(conn: &Connection) -> Result<Option<RelayStation>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM relay_stations WHERE enabled=1 LIMIT 1",
            STATION_COLUMNS
        ),
        [],
        map_station,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 新增中转站；若请求为启用状态，先停用其余中转站。
 */
pub fn insert_station(
    conn: &Connection,
    request: &CreateRelayStationRequest,
) -> Result<RelayStation> {
    let id = Uuid::new_v4().to_string();
    let now = now_secs();
    let config = config_text(&request.adapter_config)?;
    let tx = conn.unchecked_transaction()?;
    if request.enabled {
        retry_on_locked(|| {
            tx.execute(
                "UPDATE relay_stations SET enabled=0, updated_at=?1 WHERE enabled=1",
                params![now],
            )
        })?;
    }
    retry_on_locked(|| {
        tx.execute(
            "INSERT INTO relay_stations (id, name, description, api_url, adapter, auth_method, system_token, user_id, adapter_config, enabled, display_order, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)",
            params![
                id,
                request.name,
                request.description,
                request.api_url,
                request.adapter.as_str(),
                request.auth_method.as_str(),
                request.system_token,
                request.user_id,
                config,
                request.enabled,
                now
            ],
        )
    })?;
    tx.commit()?;
    get_station(conn, &id)?
        .ok_or_else(|| anyhow::anyhow!("relay station {} vanished after insert", id))
}

/**
 * \brief 更新中转站，保留原显示顺序与创建时间。
 */
pub fn update_station(
    conn: &Connection,
    request: &UpdateRelayStationRequest,
) -> Result<RelayStation> {
    let now = now_secs();
    let config = config_text(&request.adapter_config)?;
    let tx = conn.unchecked_transaction()?;
    if request.enabled {
        retry_on_locked(|| {
            tx.execute(
                "UPDATE relay_stations SET enabled=0, updated_at=?1 WHERE enabled=1 AND id!=?2",
                params![now, request.id],
            )
        })?;
    }
    let rows = retry_on_locked(|| {
        tx.execute(
            "UPDATE relay_stations SET name=?1, description=?2, api_url=?3, adapter=?4, auth_method=?5,
                system_token=?6, user_id=?7, adapter_config=?8, enabled=?9, updated_at=?10
             WHERE id=?11",
            params![
                request.name,
                request.description,
                request.api_url,
                request.adapter.as_str(),
                request.auth_method.as_str(),
                request.system_token,
                request.user_id,
                config,
                request.enabled,
                now,
                request.id
            ],
        )
    })?;
    if rows == 0 {
        bail!("relay station id {} not found", request.id);
    }
    tx.commit()?;
    get_station(conn, &request.id)?
        .ok_or_else(|| anyhow::anyhow!("relay station id {} not found", request.id))
}

/**
 * \brief 删除中转站。
 */
pub fn delete_station(conn: &Connection, id: &str) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute("DELETE FROM relay_stations WHERE id=?1", params![id])
    })?;
    if rows == 0 {
        bail!("relay station id {} not found", id);
    }
    Ok(())
}

/**
 * \brief 切换启用状态；启用时在同一事务中停用其余所有中转站。
 */
pub fn set_station_enabled(conn: &Connection, id: &str, enabled: bool) -> Result<()> {
    let now = now_secs();
    let tx = conn.unchecked_transaction()?;
    if enabled {
        retry_on_locked(|| {
            tx.execute(
                "UPDATE relay_stations SET enabled=0, updated_at=?1 WHERE id!=?2",
                params![now, id],
            )
        })?;
    }
    let rows = retry_on_locked(|| {
        tx.execute(
            "UPDATE relay_stations SET enabled=?1, updated_at=?2 WHERE id=?3",
            params![enabled, now, id],
        )
    })?;
    if rows == 0 {
        bail!("relay station id {} not found", id);
    }
    tx.commit()?;
    Ok(())
}

/**
 * \brief 按给定 ID 顺序写入 display_order。
 */
pub fn update_station_order(conn: &Connection, station_ids: &[String]) -> Result<()> {
    let now = now_secs();
    let tx = conn.unchecked_transaction()?;
    for (index, id) in station_ids.iter().enumerate() {
        retry_on_locked(|| {
            tx.execute(
                "UPDATE relay_stations SET display_order=?1, updated_at=?2 WHERE id=?3",
                params![index as i64, now, id],
            )
        })?;
    }
    tx.commit()?;
    Ok(())
}

/**
 * \brief 批量导入中转站。
 * \details 校验失败计入失败数；api_url 与 system_token 均与现有记录相同则跳过。
 */
pub fn import_stations<F>(
    conn: &Connection,
    request: &ImportRelayStationsRequest,
    validate: F,
) -> Result<ImportResult>
where
    F: Fn(&CreateRelayStationRequest) -> Result<()>,
{
    let tx = conn.unchecked_transaction()?;
    if request.clear_existing {
        retry_on_locked(|| tx.execute("DELETE FROM relay_stations", []))?;
    }
    let mut existing: Vec<(String, String)> = {
        let mut stmt = tx.prepare("SELECT api_url, system_token FROM relay_stations")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    let total = request.stations.len();
    let (mut imported, mut skipped, mut failed) = (0, 0, 0);
    let now = now_secs();
    for station in &request.stations {
        if validate(station).is_err() {
            failed += 1;
            continue;
        }
        if existing
            .iter()
            .any(|(url, token)| url == &station.api_url && token == &station.system_token)
        {
            skipped += 1;
            continue;
        }
        let config = match config_text(&station.adapter_config) {
            Ok(config) => config,
            Err(_) => {
                failed += 1;
                continue;
            }
        };
        let inserted = retry_on_locked(|| {
            tx.execute(
                "INSERT INTO relay_stations (id, name, description, api_url, adapter, auth_method, system_token, user_id, adapter_config, enabled, display_order, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, ?10, ?10)",
                params![
                    Uuid::new_v4().to_string(),
                    station.name,
                    station.description,
                    station.api_url,
                    station.adapter.as_str(),
                    station.auth_method.as_str(),
                    station.system_token,
                    station.user_id,
                    config,
                    now
                ],
            )
        });
        match inserted {
            Ok(_) => {
                imported += 1;
                existing.push((station.api_url.clone(), station.system_token.clone()));
            }
            Err(_) => failed += 1,
        }
    }
    tx.commit()?;

    let message = format!(
        "导入完成：总计 {} 个，成功 {} 个，跳过 {} 个（重复），失败 {} 个",
        total, imported, skipped, failed
    );
    Ok(ImportResult {
        total,
        imported,
        skipped,
        failed,
        message,
    })
}

fn map_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiNode> {
    let adapter: String = row.get(3)?;
    Ok(ApiNode {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        adapter: adapter.parse().map_err(|e: anyhow::Error| conversion_err(3, e))?,
        description: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        is_default: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/**
 * \brief 列出节点，可按适配器与启用状态过滤；预设节点在前。
 */
pub fn list_nodes(
    conn: &Connection,
    adapter: Option<Adapter>,
    enabled_only: bool,
) -> Result<Vec<ApiNode>> {
    let mut sql = format!("SELECT {} FROM api_nodes WHERE 1=1", NODE_COLUMNS);
    let mut args: Vec<&str> = Vec::new();
    if let Some(adapter) = adapter {
        sql.push_str(" AND adapter=?");
        args.push(adapter.as_str());
    }
    if enabled_only {
        sql.push_str(" AND enabled=1");
    }
    sql.push_str(" ORDER BY is_default DESC, created_at ASC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), map_node)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_node(conn: &Connection, id: &str) -> Result<Option<ApiNode>> {
    conn.query_row(
        &format!("SELECT {} FROM api_nodes WHERE id=?1", NODE_COLUMNS),
        params![id],
        map_node,
    )
    .optional()
    .map_err(Into::into)
}

fn node_url_exists(conn: &Connection, url: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT COUNT(*) > 0 FROM api_nodes WHERE url=?1",
        params![url],
        |row| row.get(0),
    )?)
}

/**
 * \brief 新增用户节点；URL 必须唯一。
 */
pub fn insert_node(conn: &Connection, request: &CreateApiNodeRequest) -> Result<ApiNode> {
    if node_url_exists(conn, &request.url)? {
        bail!("节点 URL 已存在");
    }
    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339()?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO api_nodes (id, name, url, adapter, description, enabled, is_default, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, 0, ?6, ?6)",
            params![
                id,
                request.name,
                request.url,
                request.adapter.as_str(),
                request.description,
                now
            ],
        )
    })?;
    Ok(ApiNode {
        id,
        name: request.name.clone(),
        url: request.url.clone(),
        adapter: request.adapter,
        description: request.description.clone(),
        enabled: true,
        is_default: false,
        created_at: now.clone(),
        updated_at: now,
    })
}

/**
 * \brief 部分更新节点，未提供的字段保持不变。
 */
pub fn update_node(conn: &Connection, id: &str, request: &UpdateApiNodeRequest) -> Result<ApiNode> {
    if get_node(conn, id)?.is_none() {
        bail!("节点不存在");
    }
    let now = now_rfc3339()?;
    retry_on_locked(|| {
        conn.execute(
            "UPDATE api_nodes SET name=COALESCE(?1, name), url=COALESCE(?2, url),
                description=COALESCE(?3, description), enabled=COALESCE(?4, enabled), updated_at=?5
             WHERE id=?6",
            params![
                request.name,
                request.url,
                request.description,
                request.enabled,
                now,
                id
            ],
        )
    })?;
    get_node(conn, id)?.ok_or_else(|| anyhow::anyhow!("节点不存在"))
}

pub fn delete_node(conn: &Connection, id: &str) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM api_nodes WHERE id=?1", params![id]))?;
    Ok(())
}

/**
 * \brief 写入内置预设节点，已存在的 URL 跳过；返回新插入数量。
 */
pub fn seed_default_nodes(conn: &Connection) -> Result<usize> {
    let now = now_rfc3339()?;
    let mut inserted = 0;
    for (name, url, adapter, description) in DEFAULT_NODES {
        if node_url_exists(conn, url)? {
            continue;
        }
        retry_on_locked(|| {
            conn.execute(
                "INSERT INTO api_nodes (id, name, url, adapter, description, enabled, is_default, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, 1, ?6, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    name,
                    url,
                    adapter.as_str(),
                    description,
                    now
                ],
            )
        })?;
        inserted += 1;
    }
    Ok(inserted)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行指数退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}
