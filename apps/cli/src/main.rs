use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use relaydesk_core_sdk::{
    backend::LocalBackend,
    bridge::{CommandBridge, HttpInvoke, InvokeBridge},
    config::AppConfig,
    coordinator::StationCoordinator,
    form::StationForm,
    models::{
        Adapter, CreateApiNodeRequest, CreateRelayStationRequest, ImportRelayStationsRequest,
        RelayStation, UpdateApiNodeRequest,
    },
    node_manager::NodeManager,
    packycode::ServiceType,
    probe::{
        probe_all, select_fastest, sort_by_response_time, HttpProber, NodeCandidate,
        NodeTestResult, ProbeStatus, Prober,
    },
    server,
    settings::SettingsEditor,
    telemetry::Telemetry,
    toast::{ToastCenter, ToastKind},
};

/**
 * \brief CLI 程序入口：管理中转站、API 节点与 Claude 设置。
 */
#[derive(Parser, Debug)]
#[command(name = "relaydesk", version, about = "RelayDesk relay station manager")]
struct Cli {
    /** \brief 通过 HTTP 桥连接远端后端，如 http://127.0.0.1:5173 */
    #[arg(long, global = true)]
    remote: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /** \brief 中转站管理 */
    Stations {
        #[command(subcommand)]
        command: StationCommands,
    },
    /** \brief API 节点管理 */
    Nodes {
        #[command(subcommand)]
        command: NodeCommands,
    },
    /** \brief Claude settings.json 编辑 */
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
    /** \brief 开关本地遥测日志 */
    Telemetry {
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum StationCommands {
    List,
    /**
     * \brief 新增中转站。
     * \param adapter 适配器：packycode/deepseek/glm/qwen/kimi/custom
     */
    Add {
        #[arg(long)]
        adapter: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        token: String,
        #[arg(long)]
        description: Option<String>,
        /** \brief PackyCode 档位：bus / taxi */
        #[arg(long)]
        service_type: Option<String>,
        /** \brief 测速后自动选择最快节点（仅 PackyCode） */
        #[arg(long, default_value_t = false)]
        auto_node: bool,
        #[arg(long, default_value_t = false)]
        enable: bool,
    },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /** \brief 删除中转站，未带 --yes 时交互确认 */
    Remove {
        id: String,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    Enable {
        id: String,
    },
    Disable {
        id: String,
    },
    Sync,
    Restore,
    Current,
    /** \brief 把中转站移动到指定位置（从 0 开始） */
    Order {
        id: String,
        index: usize,
    },
    Export {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Import {
        file: PathBuf,
        #[arg(long, default_value_t = false)]
        clear: bool,
    },
    Quota {
        id: String,
    },
    /** \brief 通过适配器测试中转站连通性 */
    Test {
        id: String,
    },
    /** \brief 查看中转站信息；带 --user 时同时查询账户信息 */
    Info {
        id: String,
        #[arg(long)]
        user: Option<String>,
    },
    /**
     * \brief 对 PackyCode 某档位的内置节点测速。
     * \details 提供 --url 时改为测速给定地址，不修改任何中转站。
     */
    Probe {
        #[arg(long, default_value = "bus")]
        service_type: String,
        #[arg(long = "url")]
        urls: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum NodeCommands {
    List {
        #[arg(long)]
        adapter: Option<String>,
        #[arg(long, default_value_t = false)]
        enabled_only: bool,
    },
    Add {
        #[arg(long)]
        adapter: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        description: Option<String>,
    },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        enabled: Option<bool>,
    },
    Remove {
        id: String,
    },
    Test {
        id: String,
    },
    TestAll {
        #[arg(long)]
        adapter: Option<String>,
    },
    Seed,
    FlushDns,
}

#[derive(Subcommand, Debug)]
enum SettingsCommands {
    Show,
    /** \brief 设置 env 键；省略 value 时删除该键 */
    SetEnv {
        key: String,
        value: Option<String>,
    },
    /** \brief 用 JSON 文件整体替换设置文档 */
    Apply {
        file: PathBuf,
    },
}

/**
 * \brief 运行期组件：桥接端口、探测器与可选的本地后端。
 */
struct Runtime {
    config: AppConfig,
    bridge: Arc<dyn CommandBridge>,
    prober: Arc<dyn Prober>,
    local: Option<Arc<LocalBackend>>,
    telemetry: Telemetry,
    toasts: ToastCenter,
}

impl Runtime {
    fn connect(remote: Option<String>) -> Result<Self> {
        let config = AppConfig::from_env();
        let toasts = ToastCenter::new(config.toast_ttl);
        let runtime = match remote {
            Some(url) => {
                let invoke = HttpInvoke::new(url).context("create http bridge failed")?;
                Self {
                    bridge: Arc::new(InvokeBridge::new(invoke)),
                    prober: Arc::new(HttpProber::new().context("create prober failed")?),
                    local: None,
                    telemetry: Telemetry::new(config.log_dir(), false),
                    toasts,
                    config,
                }
            }
            None => {
                let backend =
                    Arc::new(LocalBackend::open(&config).context("open local backend failed")?);
                Self {
                    bridge: Arc::new(InvokeBridge::new(backend.clone())),
                    prober: backend.prober(),
                    telemetry: backend.telemetry().clone(),
                    local: Some(backend),
                    toasts,
                    config,
                }
            }
        };
        Ok(runtime)
    }

    fn coordinator(&self) -> StationCoordinator {
        StationCoordinator::new(
            self.bridge.clone(),
            self.prober.clone(),
            self.toasts.clone(),
            self.telemetry.clone(),
        )
        .with_pacing(self.config.pacing)
        .with_probe_timeout(self.config.probe_timeout)
    }

    fn node_manager(&self) -> NodeManager {
        NodeManager::new(
            self.bridge.clone(),
            self.toasts.clone(),
            self.telemetry.clone(),
        )
    }

    fn settings_editor(&self) -> SettingsEditor {
        SettingsEditor::new(
            self.bridge.clone(),
            self.toasts.clone(),
            self.telemetry.clone(),
        )
    }

    fn local(&self, what: &str) -> Result<Arc<LocalBackend>> {
        match &self.local {
            Some(backend) => Ok(backend.clone()),
            None => bail!("{} 仅支持本地后端，请去掉 --remote", what),
        }
    }

    /**
     * \brief 输出并清空累计的提示；操作失败时返回错误以便设置退出码。
     */
    fn finish(&self, ok: bool) -> Result<()> {
        for toast in self.toasts.drain() {
            let detail = toast
                .detail
                .map(|d| format!(": {}", d))
                .unwrap_or_default();
            match toast.kind {
                ToastKind::Error => eprintln!("[error] {}{}", toast.key, detail),
                ToastKind::Success => println!("[ok] {}{}", toast.key, detail),
                ToastKind::Info => println!("[info] {}{}", toast.key, detail),
            }
        }
        if ok {
            Ok(())
        } else {
            bail!("操作失败")
        }
    }
}

fn parse_adapter(value: &str) -> Result<Adapter> {
    value.parse().context("invalid --adapter")
}

fn print_station(station: &RelayStation) {
    println!(
        "{} {}  {} [{}] {}",
        if station.enabled { "*" } else { " " },
        station.id,
        station.name,
        station.adapter,
        station.api_url
    );
}

fn print_result(result: &NodeTestResult) {
    let status = match result.status {
        ProbeStatus::Testing => "testing",
        ProbeStatus::Success => "ok",
        ProbeStatus::Failed => "failed",
    };
    let timing = result
        .response_time
        .map(|ms| format!("{}ms", ms))
        .unwrap_or_else(|| "-".to_string());
    let error = result.error.as_deref().unwrap_or("");
    println!(
        "{:<7} {:>7}  {}  {} {}",
        status, timing, result.name, result.url, error
    );
}

fn confirm(prompt: &str) -> Result<bool> {
    use std::io::Write;
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("read confirmation failed")?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

async fn run_stations(rt: &Runtime, command: StationCommands) -> Result<()> {
    let coordinator = rt.coordinator();
    match command {
        StationCommands::List => {
            let ok = coordinator.list().await;
            for station in coordinator.stations() {
                print_station(&station);
            }
            rt.finish(ok)
        }
        StationCommands::Add {
            adapter,
            name,
            url,
            token,
            description,
            service_type,
            auto_node,
            enable,
        } => {
            let mut form = coordinator.open_create();
            form.set_adapter(parse_adapter(&adapter)?);
            if let Some(service_type) = service_type {
                let service_type: ServiceType =
                    service_type.parse().context("invalid --service-type")?;
                form.select_service_type(service_type);
            }
            if let Some(name) = name {
                form.name = name;
            }
            if let Some(url) = url {
                form.api_url = url;
            }
            if auto_node {
                if let Some(node) = coordinator.auto_select_node(&mut form).await {
                    println!("selected node {} ({})", node.name, node.url);
                }
                for result in coordinator.failover_view().board.results() {
                    print_result(result);
                }
            }
            form.system_token = token;
            form.description = description.unwrap_or_default();
            form.enabled = enable;
            let ok = coordinator.create(&form).await;
            rt.finish(ok)
        }
        StationCommands::Update {
            id,
            name,
            url,
            token,
            description,
        } => {
            coordinator.list().await;
            let Some(mut form) = coordinator.open_edit(&id) else {
                rt.finish(true)?;
                bail!("中转站不存在: {}", id);
            };
            if let Some(name) = name {
                form.name = name;
            }
            if let Some(url) = url {
                form.api_url = url;
            }
            if let Some(token) = token {
                form.system_token = token;
            }
            if let Some(description) = description {
                form.description = description;
            }
            let ok = coordinator.update(&form).await;
            rt.finish(ok)
        }
        StationCommands::Remove { id, yes } => {
            coordinator.list().await;
            if !coordinator.request_delete(&id) {
                rt.finish(true)?;
                bail!("中转站不存在: {}", id);
            }
            let name = coordinator
                .pending_delete()
                .map(|p| p.name)
                .unwrap_or_default();
            if !yes && !confirm(&format!("删除中转站 {}？", name))? {
                coordinator.cancel_delete();
                println!("cancelled");
                return rt.finish(true);
            }
            let ok = coordinator.confirm_delete().await;
            rt.finish(ok)
        }
        StationCommands::Enable { id } => {
            let ok = coordinator.toggle_enable(&id, true).await;
            rt.finish(ok)
        }
        StationCommands::Disable { id } => {
            let ok = coordinator.toggle_enable(&id, false).await;
            rt.finish(ok)
        }
        StationCommands::Sync => {
            let ok = coordinator.sync_config().await;
            rt.finish(ok)
        }
        StationCommands::Restore => {
            let ok = coordinator.restore_config().await;
            rt.finish(ok)
        }
        StationCommands::Current => {
            let ok = coordinator.load_current_config().await;
            let current = coordinator.current_config();
            println!("api_url:   {}", current.api_url.as_deref().unwrap_or("-"));
            println!("api_token: {}", current.api_token.as_deref().unwrap_or("-"));
            rt.finish(ok)
        }
        StationCommands::Order { id, index } => {
            coordinator.list().await;
            let ok = coordinator.move_station(&id, index).await;
            for station in coordinator.stations() {
                print_station(&station);
            }
            rt.finish(ok)
        }
        StationCommands::Export { output } => {
            let Some(stations) = coordinator.export().await else {
                return rt.finish(false);
            };
            let text = serde_json::to_string_pretty(&stations)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, text)
                        .with_context(|| format!("write {} failed", path.display()))?;
                    println!("exported {} stations to {}", stations.len(), path.display());
                }
                None => println!("{}", text),
            }
            rt.finish(true)
        }
        StationCommands::Import { file, clear } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("read {} failed", file.display()))?;
            let stations: Vec<CreateRelayStationRequest> =
                serde_json::from_str(&text).context("parse stations failed")?;
            let request = ImportRelayStationsRequest {
                stations,
                clear_existing: clear,
            };
            let result = coordinator.import(&request).await;
            if let Some(result) = &result {
                println!("{}", result.message);
            }
            rt.finish(result.is_some())
        }
        StationCommands::Quota { id } => {
            let ok = coordinator.refresh_quota(&id).await;
            if let Some(quota) = coordinator.quota(&id) {
                println!("plan:    {}", quota.plan_type);
                println!(
                    "daily:   {:.2} / {:.2} USD",
                    quota.daily_spent_usd, quota.daily_budget_usd
                );
                println!(
                    "monthly: {:.2} / {:.2} USD",
                    quota.monthly_spent_usd, quota.monthly_budget_usd
                );
                println!("balance: {:.2} USD", quota.balance_usd);
                if let Some(expires) = &quota.plan_expires_at {
                    println!("expires: {}", expires);
                }
            }
            rt.finish(ok)
        }
        StationCommands::Test { id } => {
            let result = coordinator.test_connection(&id).await;
            if let Some(result) = &result {
                println!(
                    "{} {}ms  {}",
                    if result.success { "ok" } else { "failed" },
                    result.response_time,
                    result.message
                );
                if let Some(details) = &result.details {
                    println!("{}", details);
                }
            }
            rt.finish(result.map(|r| r.success).unwrap_or(false))
        }
        StationCommands::Info { id, user } => {
            let Some(info) = coordinator.station_info(&id).await else {
                return rt.finish(false);
            };
            println!("name:    {}", info.name);
            println!("api_url: {}", info.api_url);
            println!("version: {}", info.version.as_deref().unwrap_or("-"));
            if let Some(announcement) = &info.announcement {
                println!("notice:  {}", announcement);
            }
            let Some(user_id) = user else {
                return rt.finish(true);
            };
            let Some(account) = coordinator.station_user_info(&id, &user_id).await else {
                return rt.finish(false);
            };
            println!("user:    {} ({})", account.username, account.id);
            println!("quota:   {} / {}", account.used_quota, account.quota);
            println!("requests: {}", account.request_count);
            rt.finish(true)
        }
        StationCommands::Probe {
            service_type,
            urls,
        } => {
            let (winner, mut results) = if urls.is_empty() {
                let service_type: ServiceType =
                    service_type.parse().context("invalid --service-type")?;
                let mut form = StationForm::new(Adapter::Packycode);
                form.select_service_type(service_type);
                let winner = coordinator.auto_select_node(&mut form).await;
                (winner, coordinator.failover_view().board.into_results())
            } else {
                let candidates: Vec<NodeCandidate> = urls
                    .iter()
                    .map(|url| NodeCandidate::from_url(url, url))
                    .collect();
                let results =
                    probe_all(rt.prober.clone(), &candidates, rt.config.probe_timeout).await;
                let winner = select_fastest(&candidates, &results).cloned();
                (winner, results)
            };
            sort_by_response_time(&mut results);
            for result in &results {
                print_result(result);
            }
            match winner {
                Some(node) => println!("fastest: {} ({})", node.name, node.url),
                None => println!("no candidates"),
            }
            rt.finish(true)
        }
    }
}

async fn run_nodes(rt: &Runtime, command: NodeCommands) -> Result<()> {
    let manager = rt.node_manager();
    match command {
        NodeCommands::List {
            adapter,
            enabled_only,
        } => {
            let adapter = adapter.as_deref().map(parse_adapter).transpose()?;
            manager.set_enabled_only(enabled_only).await;
            let ok = manager.open(adapter).await;
            for node in manager.nodes() {
                println!(
                    "{} {}  {} [{}] {}{}",
                    if node.enabled { "+" } else { "-" },
                    node.id,
                    node.name,
                    node.adapter,
                    node.url,
                    if node.is_default { " (preset)" } else { "" }
                );
            }
            rt.finish(ok)
        }
        NodeCommands::Add {
            adapter,
            name,
            url,
            description,
        } => {
            let request = CreateApiNodeRequest {
                name,
                url,
                adapter: parse_adapter(&adapter)?,
                description,
            };
            let created = manager.create(&request).await;
            if let Some(node) = &created {
                println!("created node {}", node.id);
            }
            rt.finish(created.is_some())
        }
        NodeCommands::Update {
            id,
            name,
            url,
            description,
            enabled,
        } => {
            let request = UpdateApiNodeRequest {
                name,
                url,
                description,
                enabled,
            };
            let updated = manager.update(&id, &request).await;
            rt.finish(updated.is_some())
        }
        NodeCommands::Remove { id } => {
            let ok = manager.delete(&id).await;
            rt.finish(ok)
        }
        NodeCommands::Test { id } => {
            manager.open(None).await;
            let result = manager.test_one(&id).await;
            if let Some(result) = &result {
                print_result(result);
            }
            let ok = result.map(|r| r.is_success()).unwrap_or(false);
            if !ok && rt.toasts.snapshot().is_empty() {
                eprintln!("node {} unreachable or unknown", id);
            }
            rt.finish(ok)
        }
        NodeCommands::TestAll { adapter } => {
            let adapter = adapter.as_deref().map(parse_adapter).transpose()?;
            manager.set_enabled_only(true).await;
            manager.open(adapter).await;
            let mut results = manager.test_all().await;
            sort_by_response_time(&mut results);
            for result in &results {
                print_result(result);
            }
            rt.finish(true)
        }
        NodeCommands::Seed => {
            let ok = manager.seed_defaults().await;
            rt.finish(ok)
        }
        NodeCommands::FlushDns => {
            let ok = manager.flush_dns().await;
            rt.finish(ok)
        }
    }
}

async fn run_settings(rt: &Runtime, command: SettingsCommands) -> Result<()> {
    let mut editor = rt.settings_editor();
    if !editor.load().await {
        return rt.finish(false);
    }
    match command {
        SettingsCommands::Show => {
            println!(
                "ANTHROPIC_BASE_URL:   {}",
                editor.base_url().as_deref().unwrap_or("-")
            );
            println!(
                "ANTHROPIC_AUTH_TOKEN: {}",
                editor.masked_token().as_deref().unwrap_or("-")
            );
            rt.finish(true)
        }
        SettingsCommands::SetEnv { key, value } => {
            editor.set_env(&key, value.as_deref());
            let ok = editor.save().await;
            rt.finish(ok)
        }
        SettingsCommands::Apply { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("read {} failed", file.display()))?;
            editor.enter_raw();
            editor.update_raw(&text);
            let ok = editor.save().await;
            rt.finish(ok)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let rt = Runtime::connect(cli.remote)?;

    match cli.command {
        Commands::Stations { command } => run_stations(&rt, command).await?,
        Commands::Nodes { command } => run_nodes(&rt, command).await?,
        Commands::Settings { command } => run_settings(&rt, command).await?,
        Commands::Telemetry { state } => {
            let backend = rt.local("telemetry")?;
            let enabled = state == "on";
            backend
                .set_telemetry_enabled(enabled)
                .context("save telemetry failed")?;
            println!("telemetry {}", if enabled { "enabled" } else { "disabled" });
        }
        Commands::Serve { addr } => {
            let backend = rt.local("serve")?;
            server::run(&addr, backend, rt.config.ui_dir.clone()).await?;
        }
    }

    Ok(())
}
