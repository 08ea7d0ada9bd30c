use std::{path::PathBuf, time::Duration};

/** \brief 单节点与批量测试的默认超时（毫秒）。 */
pub const NODE_TEST_TIMEOUT_MS: u64 = 5000;

/**
 * \brief 自动选节点弹窗的展示节奏。
 * \details 纯表现层延时，测试中使用 `FailoverPacing::immediate()`。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverPacing {
    /** \brief 全部探测结束后结果保持可见的时长 */
    pub dwell: Duration,
    /** \brief 应用最优节点后到关闭弹窗的时长 */
    pub dismiss: Duration,
}

impl Default for FailoverPacing {
    fn default() -> Self {
        Self {
            dwell: Duration::from_millis(2000),
            dismiss: Duration::from_millis(1000),
        }
    }
}

impl FailoverPacing {
    pub fn immediate() -> Self {
        Self {
            dwell: Duration::ZERO,
            dismiss: Duration::ZERO,
        }
    }
}

/**
 * \brief 应用运行配置，来源于环境变量并带默认值。
 */
#[derive(Debug, Clone)]
pub struct AppConfig {
    /** \brief 数据目录，默认 ~/.relaydesk */
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /** \brief Claude 配置目录，settings.json 所在位置 */
    pub claude_dir: PathBuf,
    pub ui_dir: Option<PathBuf>,
    pub probe_timeout: Duration,
    pub pacing: FailoverPacing,
    pub toast_ttl: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let home = home_dir();
        let data_dir = env_path("RELAYDESK_HOME").unwrap_or_else(|| home.join(".relaydesk"));
        let db_path = env_path("RELAYDESK_DB").unwrap_or_else(|| data_dir.join("relaydesk.db"));
        let claude_dir = env_path("RELAYDESK_CLAUDE_DIR").unwrap_or_else(|| home.join(".claude"));
        let defaults = FailoverPacing::default();
        Self {
            data_dir,
            db_path,
            claude_dir,
            ui_dir: env_path("RELAYDESK_UI_DIR"),
            probe_timeout: env_millis("RELAYDESK_PROBE_TIMEOUT_MS")
                .unwrap_or(Duration::from_millis(NODE_TEST_TIMEOUT_MS)),
            pacing: FailoverPacing {
                dwell: env_millis("RELAYDESK_FAILOVER_DWELL_MS").unwrap_or(defaults.dwell),
                dismiss: env_millis("RELAYDESK_FAILOVER_DISMISS_MS").unwrap_or(defaults.dismiss),
            },
            toast_ttl: Duration::from_secs(3),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.claude_dir.join("settings.json")
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("USERPROFILE").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}
