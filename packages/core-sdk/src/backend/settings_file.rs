use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    models::RelayStation,
    settings::{ENV_AUTH_TOKEN, ENV_BASE_URL},
};

const API_KEY_HELPER: &str = "apiKeyHelper";

/**
 * \brief Claude `settings.json` 文件访问层。
 * \details 写入前先落盘到临时文件再重命名；应用中转站配置前自动备份到同目录的 `settings.backup.json`。
 */
#[derive(Debug, Clone)]
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        self.path.with_file_name("settings.backup.json")
    }

    /**
     * \brief 读取设置文档；文件不存在时返回空对象，并保证存在 `env` 对象。
     */
    pub fn read(&self) -> Result<Value> {
        let mut document = read_object(&self.path)?;
        ensure_env(&mut document);
        Ok(document)
    }

    pub fn write(&self, document: &Value) -> Result<()> {
        if !document.is_object() {
            bail!("settings must be a JSON object");
        }
        write_atomic(&self.path, document)
    }

    /**
     * \brief 将当前设置复制到备份文件；设置文件不存在时跳过。
     */
    pub fn backup(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let document = read_object(&self.path)?;
        write_atomic(&self.backup_path(), &document)
    }

    /**
     * \brief 用备份覆盖当前设置。
     */
    pub fn restore(&self) -> Result<()> {
        let backup = self.backup_path();
        if !backup.exists() {
            bail!("备份文件不存在");
        }
        let document = read_object(&backup)?;
        write_atomic(&self.path, &document)
    }

    /**
     * \brief 把中转站的地址与令牌写入 env，并设置 `apiKeyHelper`。
     */
    pub fn apply_station(&self, station: &RelayStation) -> Result<()> {
        self.backup()?;
        let mut document = self.read()?;
        if let Some(env) = env_mut(&mut document) {
            env.insert(ENV_BASE_URL.into(), Value::String(station.api_url.clone()));
            env.insert(
                ENV_AUTH_TOKEN.into(),
                Value::String(station.system_token.clone()),
            );
        }
        if let Some(root) = document.as_object_mut() {
            root.insert(
                API_KEY_HELPER.into(),
                Value::String(format!("echo '{}'", station.system_token)),
            );
        }
        self.write(&document)
    }

    /**
     * \brief 清除中转站写入的键。
     * \details 有备份时从备份恢复 `apiKeyHelper` 与令牌；没有备份时直接删除 `apiKeyHelper`。
     */
    pub fn clear_station(&self) -> Result<()> {
        let mut document = self.read()?;
        let backup_path = self.backup_path();
        let backup = if backup_path.exists() {
            Some(read_object(&backup_path)?)
        } else {
            None
        };

        if let Some(env) = env_mut(&mut document) {
            env.remove(ENV_BASE_URL);
            env.remove(ENV_AUTH_TOKEN);
            let saved_token = backup
                .as_ref()
                .and_then(|b| b.get("env"))
                .and_then(|e| e.get(ENV_AUTH_TOKEN))
                .cloned();
            if let Some(token) = saved_token {
                env.insert(ENV_AUTH_TOKEN.into(), token);
            }
        }
        if let Some(root) = document.as_object_mut() {
            match backup.as_ref().and_then(|b| b.get(API_KEY_HELPER)) {
                Some(helper) => {
                    root.insert(API_KEY_HELPER.into(), helper.clone());
                }
                None => {
                    root.remove(API_KEY_HELPER);
                }
            }
        }
        self.write(&document)
    }

    pub fn current_api_url(&self) -> Result<Option<String>> {
        Ok(crate::settings::env_value(&self.read()?, ENV_BASE_URL))
    }

    pub fn current_api_token(&self) -> Result<Option<String>> {
        Ok(crate::settings::env_value(&self.read()?, ENV_AUTH_TOKEN))
    }
}

fn read_object(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(Value::Object(Map::new()));
    }
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    let value: Value =
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    if !value.is_object() {
        bail!("{} is not a JSON object", path.display());
    }
    Ok(value)
}

fn ensure_env(document: &mut Value) {
    if let Some(root) = document.as_object_mut() {
        let env = root
            .entry("env")
            .or_insert_with(|| Value::Object(Map::new()));
        if !env.is_object() {
            *env = Value::Object(Map::new());
        }
    }
}

fn env_mut(document: &mut Value) -> Option<&mut Map<String, Value>> {
    ensure_env(document);
    document.get_mut("env").and_then(Value::as_object_mut)
}

fn write_atomic(path: &Path, document: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("settings.json");
    let tmp = path.with_file_name(format!("{}.tmp", file_name));
    let text = serde_json::to_string_pretty(document)?;
    fs::write(&tmp, text).with_context(|| format!("write {}", tmp.display()))?;
    if let Err(err) = fs::rename(&tmp, path) {
        if path.exists() {
            fs::remove_file(path)?;
            fs::rename(&tmp, path)?;
        } else {
            return Err(err.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Adapter, AuthMethod};
    use serde_json::json;

    fn station(url: &str, token: &str) -> RelayStation {
        RelayStation {
            id: "s1".into(),
            name: "relay".into(),
            description: None,
            api_url: url.into(),
            adapter: Adapter::Custom,
            auth_method: AuthMethod::BearerToken,
            system_token: token.into(),
            user_id: None,
            adapter_config: None,
            enabled: true,
            display_order: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_missing_file_reads_as_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let file = SettingsFile::new(dir.path().join("settings.json"));
        assert_eq!(file.read().unwrap(), json!({"env": {}}));
        assert!(file.restore().unwrap_err().to_string().contains("备份文件不存在"));
    }

    #[test]
    fn test_apply_then_clear_restores_previous_helper() {
        let dir = tempfile::tempdir().unwrap();
        let file = SettingsFile::new(dir.path().join("settings.json"));
        file.write(&json!({
            "model": "opus",
            "apiKeyHelper": "echo 'old'",
            "env": {"ANTHROPIC_AUTH_TOKEN": "old-token", "OTHER": "1"}
        }))
        .unwrap();

        file.apply_station(&station("https://relay.example.com", "sk-new"))
            .unwrap();
        let applied = file.read().unwrap();
        assert_eq!(applied["model"], "opus");
        assert_eq!(applied["env"]["ANTHROPIC_BASE_URL"], "https://relay.example.com");
        assert_eq!(applied["env"]["ANTHROPIC_AUTH_TOKEN"], "sk-new");
        assert_eq!(applied["apiKeyHelper"], "echo 'sk-new'");
        assert!(file.backup_path().exists());

        file.clear_station().unwrap();
        let cleared = file.read().unwrap();
        assert!(cleared["env"].get("ANTHROPIC_BASE_URL").is_none());
        assert_eq!(cleared["env"]["ANTHROPIC_AUTH_TOKEN"], "old-token");
        assert_eq!(cleared["env"]["OTHER"], "1");
        assert_eq!(cleared["apiKeyHelper"], "echo 'old'");
    }

    #[test]
    fn test_clear_without_backup_drops_helper() {
        let dir = tempfile::tempdir().unwrap();
        let file = SettingsFile::new(dir.path().join("settings.json"));
        file.write(&json!({"apiKeyHelper": "echo 'x'", "env": {"ANTHROPIC_BASE_URL": "https://a"}}))
            .unwrap();
        file.clear_station().unwrap();
        let cleared = file.read().unwrap();
        assert!(cleared.get("apiKeyHelper").is_none());
        assert_eq!(file.current_api_url().unwrap(), None);
    }

    #[test]
    fn test_non_object_documents_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "[1]").unwrap();
        let file = SettingsFile::new(&path);
        assert!(file.read().is_err());
        assert!(file.write(&json!("text")).is_err());
    }
}
