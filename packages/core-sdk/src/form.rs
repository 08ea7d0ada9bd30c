use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    models::{
        Adapter, AuthMethod, CreateRelayStationRequest, RelayStation, UpdateRelayStationRequest,
    },
    packycode::ServiceType,
    probe::NodeCandidate,
};

/**
 * \brief 提交前的表单校验错误，每个变体对应一个提示键。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("自定义中转站必须填写名称")]
    NameRequired,
    #[error("API 地址不能为空")]
    ApiUrlRequired,
    #[error("系统令牌不能为空")]
    TokenRequired,
}

impl ValidationError {
    pub fn key(&self) -> &'static str {
        match self {
            ValidationError::NameRequired => "relay_station.name_required",
            ValidationError::ApiUrlRequired => "relay_station.api_url_required",
            ValidationError::TokenRequired => "relay_station.token_required",
        }
    }
}

/**
 * \brief 中转站创建/编辑表单的草稿状态。
 * \details PackyCode 的两个档位各自记住最后选中的节点，切换档位时互不覆盖。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct StationForm {
    pub name: String,
    pub description: String,
    pub api_url: String,
    pub adapter: Adapter,
    pub auth_method: AuthMethod,
    pub system_token: String,
    pub user_id: String,
    pub enabled: bool,
    service_type: ServiceType,
    bus_node: String,
    taxi_node: String,
}

impl StationForm {
    pub fn new(adapter: Adapter) -> Self {
        let mut form = Self {
            name: String::new(),
            description: String::new(),
            api_url: String::new(),
            adapter,
            auth_method: AuthMethod::default(),
            system_token: String::new(),
            user_id: String::new(),
            enabled: false,
            service_type: ServiceType::Bus,
            bus_node: ServiceType::Bus.default_url().to_string(),
            taxi_node: ServiceType::Taxi.default_url().to_string(),
        };
        form.set_adapter(adapter);
        form
    }

    /**
     * \brief 以已有中转站填充编辑表单。
     */
    pub fn from_station(station: &RelayStation) -> Self {
        let service_type = station
            .adapter_config
            .as_ref()
            .and_then(|cfg| cfg.get("service_type"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| ServiceType::detect(&station.api_url));
        let mut form = Self {
            name: station.name.clone(),
            description: station.description.clone().unwrap_or_default(),
            api_url: station.api_url.clone(),
            adapter: station.adapter,
            auth_method: station.auth_method,
            system_token: station.system_token.clone(),
            user_id: station.user_id.clone().unwrap_or_default(),
            enabled: station.enabled,
            service_type,
            bus_node: ServiceType::Bus.default_url().to_string(),
            taxi_node: ServiceType::Taxi.default_url().to_string(),
        };
        if station.adapter == Adapter::Packycode {
            *form.pool_slot_mut() = station.api_url.clone();
        }
        form
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    /**
     * \brief 切换适配器：重置为该适配器的默认地址，并重新派生名称。
     */
    pub fn set_adapter(&mut self, adapter: Adapter) {
        self.adapter = adapter;
        self.api_url = match adapter {
            Adapter::Packycode => self.pool_slot().clone(),
            other => other.default_api_url().to_string(),
        };
        if adapter != Adapter::Custom {
            self.name = self.derived_name();
        }
    }

    /**
     * \brief 切换 PackyCode 档位，恢复该档位上次选中的节点。
     * \details 档位只对 PackyCode 适配器生效，自定义适配器不会被改名。
     */
    pub fn select_service_type(&mut self, service_type: ServiceType) {
        if self.adapter != Adapter::Packycode {
            return;
        }
        self.service_type = service_type;
        self.api_url = self.pool_slot().clone();
        self.name = self.derived_name();
    }

    /**
     * \brief 选中节点：写入 api_url，并记入当前档位的节点池。
     */
    pub fn select_node_url(&mut self, url: &str) {
        if self.adapter == Adapter::Packycode {
            *self.pool_slot_mut() = url.to_string();
        }
        self.api_url = url.to_string();
    }

    /**
     * \brief 当前档位的内置候选节点；非 PackyCode 适配器为空。
     */
    pub fn tier_candidates(&self) -> Vec<NodeCandidate> {
        match self.adapter {
            Adapter::Packycode => self.service_type.candidates(),
            _ => Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.adapter == Adapter::Custom && self.name.trim().is_empty() {
            return Err(ValidationError::NameRequired);
        }
        if self.api_url.trim().is_empty() {
            return Err(ValidationError::ApiUrlRequired);
        }
        if self.system_token.trim().is_empty() {
            return Err(ValidationError::TokenRequired);
        }
        Ok(())
    }

    /**
     * \brief 提交用名称：留空时按适配器派生。
     */
    pub fn effective_name(&self) -> String {
        let name = self.name.trim();
        if name.is_empty() {
            self.derived_name()
        } else {
            name.to_string()
        }
    }

    pub fn to_create_request(&self) -> CreateRelayStationRequest {
        CreateRelayStationRequest {
            name: self.effective_name(),
            description: non_blank(&self.description),
            api_url: self.api_url.trim().to_string(),
            adapter: self.adapter,
            auth_method: self.auth_method,
            system_token: self.system_token.trim().to_string(),
            user_id: non_blank(&self.user_id),
            adapter_config: self.adapter_config(),
            enabled: self.enabled,
        }
    }

    pub fn to_update_request(&self, id: &str) -> UpdateRelayStationRequest {
        let create = self.to_create_request();
        UpdateRelayStationRequest {
            id: id.to_string(),
            name: create.name,
            description: create.description,
            api_url: create.api_url,
            adapter: create.adapter,
            auth_method: create.auth_method,
            system_token: create.system_token,
            user_id: create.user_id,
            adapter_config: create.adapter_config,
            enabled: create.enabled,
        }
    }

    fn derived_name(&self) -> String {
        match self.adapter {
            Adapter::Packycode => format!("PackyCode {}", self.service_type.label()),
            Adapter::Custom => String::new(),
            other => other.display_name().to_string(),
        }
    }

    fn adapter_config(&self) -> Option<Map<String, Value>> {
        match self.adapter {
            Adapter::Packycode => {
                let mut cfg = Map::new();
                cfg.insert(
                    "service_type".to_string(),
                    Value::String(self.service_type.as_str().to_string()),
                );
                Some(cfg)
            }
            _ => None,
        }
    }

    fn pool_slot(&self) -> &String {
        match self.service_type {
            ServiceType::Bus => &self.bus_node,
            ServiceType::Taxi => &self.taxi_node,
        }
    }

    fn pool_slot_mut(&mut self) -> &mut String {
        match self.service_type {
            ServiceType::Bus => &mut self.bus_node,
            ServiceType::Taxi => &mut self.taxi_node,
        }
    }
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
