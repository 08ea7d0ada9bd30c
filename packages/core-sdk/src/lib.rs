pub mod backend;
pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod form;
pub mod models;
pub mod node_manager;
pub mod packycode;
pub mod probe;
pub mod server;
pub mod settings;
pub mod telemetry;
pub mod toast;

#[cfg(test)]
pub(crate) mod testing;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::backend::LocalBackend;
    pub use crate::bridge::{CommandBridge, HttpInvoke, Invoke, InvokeBridge};
    pub use crate::config::AppConfig;
    pub use crate::coordinator::StationCoordinator;
    pub use crate::form::StationForm;
    pub use crate::models;
    pub use crate::node_manager::NodeManager;
    pub use crate::settings::SettingsEditor;
    pub use crate::telemetry::Telemetry;
    pub use crate::toast::ToastCenter;
}
