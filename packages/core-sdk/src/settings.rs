use std::sync::Arc;

use serde_json::{Map, Value};

use crate::{bridge::CommandBridge, telemetry::Telemetry, toast::ToastCenter};

pub const ENV_BASE_URL: &str = "ANTHROPIC_BASE_URL";
pub const ENV_AUTH_TOKEN: &str = "ANTHROPIC_AUTH_TOKEN";

/**
 * \brief 令牌脱敏：长于 8 个字符时保留首尾各 4 个字符。
 */
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/**
 * \brief 读取 `env.<key>` 字符串值。
 */
pub fn env_value(document: &Value, key: &str) -> Option<String> {
    document
        .get("env")
        .and_then(|env| env.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/**
 * \brief Claude 设置文档编辑器。
 * \details 文档整体视为不透明 JSON，只读写 env 中的键；原始 JSON 模式下解析失败时保持文档不变。
 */
pub struct SettingsEditor {
    bridge: Arc<dyn CommandBridge>,
    toasts: ToastCenter,
    telemetry: Telemetry,
    document: Value,
    raw: Option<String>,
    dirty: bool,
}

impl SettingsEditor {
    pub fn new(bridge: Arc<dyn CommandBridge>, toasts: ToastCenter, telemetry: Telemetry) -> Self {
        Self {
            bridge,
            toasts,
            telemetry,
            document: Value::Object(Map::new()),
            raw: None,
            dirty: false,
        }
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_raw_mode(&self) -> bool {
        self.raw.is_some()
    }

    pub async fn load(&mut self) -> bool {
        match self.bridge.get_settings().await {
            Ok(document) => {
                self.document = if document.is_object() {
                    document
                } else {
                    Value::Object(Map::new())
                };
                self.raw = None;
                self.dirty = false;
                true
            }
            Err(err) => {
                self.telemetry
                    .log_error("settings", &format!("load failed: {:#}", err));
                self.toasts
                    .error("settings.load_failed", Some(err.to_string()));
                false
            }
        }
    }

    pub fn base_url(&self) -> Option<String> {
        env_value(&self.document, ENV_BASE_URL)
    }

    pub fn masked_token(&self) -> Option<String> {
        env_value(&self.document, ENV_AUTH_TOKEN).map(|t| mask_token(&t))
    }

    /**
     * \brief 设置或删除（`None`）一个 env 键。
     */
    pub fn set_env(&mut self, key: &str, value: Option<&str>) {
        let Some(root) = self.document.as_object_mut() else {
            return;
        };
        let env = root
            .entry("env")
            .or_insert_with(|| Value::Object(Map::new()));
        if !env.is_object() {
            *env = Value::Object(Map::new());
        }
        if let Some(env) = env.as_object_mut() {
            match value {
                Some(v) => {
                    env.insert(key.to_string(), Value::String(v.to_string()));
                }
                None => {
                    env.remove(key);
                }
            }
        }
        self.dirty = true;
    }

    /**
     * \brief 进入原始 JSON 编辑模式，返回格式化后的文本。
     */
    pub fn enter_raw(&mut self) -> String {
        let text = serde_json::to_string_pretty(&self.document).unwrap_or_else(|_| "{}".into());
        self.raw = Some(text.clone());
        text
    }

    pub fn update_raw(&mut self, text: &str) {
        self.raw = Some(text.to_string());
    }

    pub fn cancel_raw(&mut self) {
        self.raw = None;
    }

    /**
     * \brief 解析原始文本并替换文档；非法 JSON 或非对象时提示且不修改文档。
     */
    pub fn apply_raw(&mut self) -> bool {
        let Some(text) = self.raw.as_deref() else {
            return true;
        };
        match serde_json::from_str::<Value>(text) {
            Ok(value) if value.is_object() => {
                self.document = value;
                self.raw = None;
                self.dirty = true;
                true
            }
            Ok(_) => {
                self.toasts.error(
                    "settings.invalid_json",
                    Some("settings must be a JSON object".to_string()),
                );
                false
            }
            Err(err) => {
                self.toasts
                    .error("settings.invalid_json", Some(err.to_string()));
                false
            }
        }
    }

    pub async fn save(&mut self) -> bool {
        if !self.apply_raw() {
            return false;
        }
        match self.bridge.save_settings(&self.document).await {
            Ok(_) => {
                self.dirty = false;
                self.toasts.success("settings.saved");
                true
            }
            Err(err) => {
                self.telemetry
                    .log_error("settings", &format!("save failed: {:#}", err));
                self.toasts
                    .error("settings.save_failed", Some(err.to_string()));
                false
            }
        }
    }
}
