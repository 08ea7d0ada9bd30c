use anyhow::{anyhow, bail, Result};
use std::process::Stdio;
use tokio::process::Command;

/**
 * \brief 刷新操作系统 DNS 缓存，按平台选择命令；Linux 依次尝试常见方案。
 */
pub async fn flush_dns() -> Result<String> {
    let attempts: &[(&str, &[&str])] = if cfg!(target_os = "windows") {
        &[("ipconfig", &["/flushdns"])]
    } else if cfg!(target_os = "macos") {
        &[("dscacheutil", &["-flushcache"])]
    } else {
        &[
            ("resolvectl", &["flush-caches"]),
            ("systemd-resolve", &["--flush-caches"]),
            (
                "sh",
                &[
                    "-c",
                    "service nscd restart || service dnsmasq restart || rc-service nscd restart",
                ],
            ),
        ]
    };

    let mut last_error = None;
    for (program, args) in attempts {
        match run(program, args).await {
            Ok(()) => return Ok("DNS cache flushed".to_string()),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow!("no DNS flush method available")))
}

async fn run(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| anyhow!("Failed to execute {}: {}", program, e))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        bail!("{} {} failed", program, args.join(" "));
    }
    bail!(stderr)
}
