use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Result;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/**
 * \brief 遥测日志服务。
 * \details 应用启动时显式构造并注入各组件；克隆后共享同一开关。
 */
#[derive(Debug, Clone)]
pub struct Telemetry {
    enabled: Arc<AtomicBool>,
    log_dir: PathBuf,
}

impl Telemetry {
    pub fn new(log_dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
            log_dir: log_dir.into(),
        }
    }

    /**
     * \brief 关闭状态的实例，测试与一次性命令使用。
     */
    pub fn disabled() -> Self {
        Self::new("logs", false)
    }

    /**
     * \brief 更新遥测开关状态。
     */
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /**
     * \brief 查询当前遥测开关状态。
     */
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /**
     * \brief 记录常规事件。
     */
    pub fn log_event(&self, category: &str, message: &str) {
        if !self.is_enabled() {
            return;
        }
        if let Err(err) = self.write_line("INFO", category, message) {
            eprintln!("telemetry write failed: {}", err);
        }
    }

    /**
     * \brief 记录错误事件。
     */
    pub fn log_error(&self, category: &str, message: &str) {
        if !self.is_enabled() {
            return;
        }
        if let Err(err) = self.write_line("ERROR", category, message) {
            eprintln!("telemetry write failed: {}", err);
        }
    }

    fn write_line(&self, level: &str, category: &str, message: &str) -> Result<()> {
        if !self.log_dir.exists() {
            std::fs::create_dir_all(&self.log_dir)?;
        }
        let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_dir.join("relaydesk.log"))?;
        writeln!(file, "{} [{}] {} - {}", timestamp, level, category, message)?;
        Ok(())
    }
}
