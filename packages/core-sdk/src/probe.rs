use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_stream::stream;
use async_trait::async_trait;
use futures_util::{stream::FuturesUnordered, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::models::{ApiNode, NodeTestReport, ReportStatus};

/**
 * \brief 单次可达性探测的原始结果。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /** \brief 服务器有响应；状态码在不透明响应下可能缺失 */
    Reachable { status: Option<u16> },
    Unreachable(String),
}

/**
 * \brief HEAD 风格的轻量探测端口。
 */
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome;
}

/**
 * \brief 基于 reqwest 的 HEAD 探测器，允许自签名证书。
 */
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        match self.client.head(url).timeout(timeout).send().await {
            Ok(resp) => ProbeOutcome::Reachable {
                status: Some(resp.status().as_u16()),
            },
            Err(e) if e.is_timeout() => {
                ProbeOutcome::Unreachable(format!("请求超过 {} 毫秒未响应", timeout.as_millis()))
            }
            Err(e) if e.is_connect() => {
                ProbeOutcome::Unreachable(format!("无法连接到服务器: {}", e))
            }
            Err(e) => ProbeOutcome::Unreachable(format!("网络错误: {}", e)),
        }
    }
}

/**
 * \brief 参与测速的候选节点。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCandidate {
    pub id: String,
    pub name: String,
    pub url: String,
}

impl NodeCandidate {
    /**
     * \brief 以 URL 作为键的候选节点（内置节点池使用）。
     */
    pub fn from_url(name: &str, url: &str) -> Self {
        Self {
            id: url.to_string(),
            name: name.to_string(),
            url: url.to_string(),
        }
    }
}

impl From<&ApiNode> for NodeCandidate {
    fn from(node: &ApiNode) -> Self {
        Self {
            id: node.id.clone(),
            name: node.name.clone(),
            url: node.url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Testing,
    Success,
    Failed,
}

/**
 * \brief 界面侧的节点测试结果，只存在于内存。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTestResult {
    pub node_id: String,
    pub url: String,
    pub name: String,
    /** \brief 毫秒；失败时为空 */
    pub response_time: Option<u64>,
    pub status: ProbeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeTestResult {
    pub fn testing(candidate: &NodeCandidate) -> Self {
        Self {
            node_id: candidate.id.clone(),
            url: candidate.url.clone(),
            name: candidate.name.clone(),
            response_time: None,
            status: ProbeStatus::Testing,
            error: None,
        }
    }

    pub fn success(candidate: &NodeCandidate, response_time: u64) -> Self {
        Self {
            response_time: Some(response_time),
            status: ProbeStatus::Success,
            ..Self::testing(candidate)
        }
    }

    pub fn failed(candidate: &NodeCandidate, error: String) -> Self {
        Self {
            status: ProbeStatus::Failed,
            error: Some(error),
            ..Self::testing(candidate)
        }
    }

    /**
     * \brief 将后端测试报告折算为界面结果；超时视为失败。
     */
    pub fn from_report(candidate: &NodeCandidate, report: &NodeTestReport) -> Self {
        match report.status {
            ReportStatus::Success => {
                Self::success(candidate, report.response_time_ms.unwrap_or_default())
            }
            ReportStatus::Failure | ReportStatus::Timeout => Self::failed(
                candidate,
                report
                    .error_details
                    .clone()
                    .unwrap_or_else(|| report.message.clone()),
            ),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ProbeStatus::Success
    }
}

/**
 * \brief 按节点 ID 更新的结果面板，容忍乱序完成。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeBoard {
    results: Vec<NodeTestResult>,
}

impl ProbeBoard {
    pub fn new(candidates: &[NodeCandidate]) -> Self {
        Self {
            results: candidates.iter().map(NodeTestResult::testing).collect(),
        }
    }

    /**
     * \brief 写入一条结果；未知节点被忽略并返回 false。
     */
    pub fn apply(&mut self, result: NodeTestResult) -> bool {
        match self.results.iter_mut().find(|r| r.node_id == result.node_id) {
            Some(slot) => {
                *slot = result;
                true
            }
            None => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.status != ProbeStatus::Testing)
    }

    pub fn results(&self) -> &[NodeTestResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<NodeTestResult> {
        self.results
    }
}

/**
 * \brief 探测单个节点，记录从发出到响应的耗时。
 */
pub async fn probe_node(
    prober: &dyn Prober,
    candidate: &NodeCandidate,
    timeout: Duration,
) -> NodeTestResult {
    let start = Instant::now();
    let outcome = tokio::time::timeout(timeout, prober.probe(&candidate.url, timeout)).await;
    let elapsed = start.elapsed().as_millis() as u64;
    match outcome {
        Ok(ProbeOutcome::Reachable { .. }) => NodeTestResult::success(candidate, elapsed),
        Ok(ProbeOutcome::Unreachable(error)) => NodeTestResult::failed(candidate, error),
        Err(_) => NodeTestResult::failed(
            candidate,
            format!("请求超过 {} 毫秒未响应（超时）", timeout.as_millis()),
        ),
    }
}

/**
 * \brief 并发探测全部候选节点，按完成顺序逐条产出结果。
 * \details 所有探测在首次轮询时一并发出，彼此之间没有先后依赖。
 */
pub fn probe_stream(
    prober: Arc<dyn Prober>,
    candidates: Vec<NodeCandidate>,
    timeout: Duration,
) -> impl Stream<Item = NodeTestResult> + Send + 'static {
    stream! {
        let mut pending = FuturesUnordered::new();
        for candidate in candidates {
            let prober = prober.clone();
            pending.push(async move { probe_node(prober.as_ref(), &candidate, timeout).await });
        }
        while let Some(result) = pending.next().await {
            yield result;
        }
    }
}

/**
 * \brief 并发探测并汇总，结果顺序与候选顺序一致。
 */
pub async fn probe_all(
    prober: Arc<dyn Prober>,
    candidates: &[NodeCandidate],
    timeout: Duration,
) -> Vec<NodeTestResult> {
    let mut board = ProbeBoard::new(candidates);
    let stream = probe_stream(prober, candidates.to_vec(), timeout);
    futures_util::pin_mut!(stream);
    while let Some(result) = stream.next().await {
        board.apply(result);
    }
    board.into_results()
}

/**
 * \brief 选出成功节点中响应最快者；全部失败时退回第一个候选。
 */
pub fn select_fastest<'a>(
    candidates: &'a [NodeCandidate],
    results: &[NodeTestResult],
) -> Option<&'a NodeCandidate> {
    candidates
        .iter()
        .filter_map(|candidate| {
            results
                .iter()
                .find(|r| r.node_id == candidate.id && r.is_success())
                .and_then(|r| r.response_time)
                .map(|time| (candidate, time))
        })
        .min_by_key(|(_, time)| *time)
        .map(|(candidate, _)| candidate)
        .or_else(|| candidates.first())
}

/**
 * \brief 展示排序：成功节点在前且按耗时升序，其余保持原顺序。
 */
pub fn sort_by_response_time(results: &mut [NodeTestResult]) {
    results.sort_by_key(|r| match (r.status, r.response_time) {
        (ProbeStatus::Success, Some(t)) => (0, t),
        (ProbeStatus::Success, None) => (1, 0),
        (ProbeStatus::Testing, _) => (2, 0),
        (ProbeStatus::Failed, _) => (3, 0),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProber;

    fn candidates() -> Vec<NodeCandidate> {
        vec![
            NodeCandidate::from_url("A", "https://a.example.com"),
            NodeCandidate::from_url("B", "https://b.example.com"),
            NodeCandidate::from_url("C", "https://c.example.com"),
        ]
    }

    #[test]
    fn test_select_fastest_prefers_minimum_successful_time() {
        let c = candidates();
        let results = vec![
            NodeTestResult::success(&c[0], 120),
            NodeTestResult::success(&c[1], 45),
            NodeTestResult::failed(&c[2], "refused".into()),
        ];
        let winner = select_fastest(&c, &results).expect("winner");
        assert_eq!(winner.url, "https://b.example.com");
    }

    #[test]
    fn test_select_fastest_falls_back_to_first_when_all_fail() {
        let c = candidates();
        let results: Vec<_> = c
            .iter()
            .map(|n| NodeTestResult::failed(n, "down".into()))
            .collect();
        let winner = select_fastest(&c, &results).expect("fallback");
        assert_eq!(winner.url, "https://a.example.com");
        assert!(select_fastest(&[], &results).is_none());
    }

    #[test]
    fn test_board_applies_out_of_order_results_by_key() {
        let c = candidates();
        let mut board = ProbeBoard::new(&c);
        assert!(board.apply(NodeTestResult::success(&c[1], 45)));
        assert!(!board.is_settled());
        assert!(board.apply(NodeTestResult::failed(&c[2], "x".into())));
        assert!(board.apply(NodeTestResult::success(&c[0], 120)));
        assert!(board.is_settled());

        let stray = NodeCandidate::from_url("Z", "https://z.example.com");
        assert!(!board.apply(NodeTestResult::success(&stray, 1)));

        let results = board.results();
        assert_eq!(results[0].response_time, Some(120));
        assert_eq!(results[1].response_time, Some(45));
        assert_eq!(results[2].status, ProbeStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_all_runs_concurrently_and_keeps_candidate_order() {
        let prober: Arc<dyn Prober> = Arc::new(
            ScriptedProber::new()
                .route("https://a.example.com", 120, true)
                .route("https://b.example.com", 45, true)
                .route("https://c.example.com", 10, false),
        );
        let started = Instant::now();
        let results = probe_all(prober, &candidates(), Duration::from_millis(5000)).await;

        assert_eq!(started.elapsed(), Duration::from_millis(120));
        assert_eq!(results[0].response_time, Some(120));
        assert_eq!(results[1].response_time, Some(45));
        assert_eq!(results[2].status, ProbeStatus::Failed);
        assert_eq!(results[2].response_time, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_stream_yields_in_completion_order() {
        let prober: Arc<dyn Prober> = Arc::new(
            ScriptedProber::new()
                .route("https://a.example.com", 120, true)
                .route("https://b.example.com", 45, true)
                .route("https://c.example.com", 80, true),
        );
        let order: Vec<String> = probe_stream(prober, candidates(), Duration::from_secs(5))
            .map(|r| r.name)
            .collect()
            .await;
        assert_eq!(order, vec!["B", "C", "A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_resolves_to_failure() {
        let prober = ScriptedProber::new().route("https://slow.example.com", 6000, true);
        let slow = NodeCandidate::from_url("slow", "https://slow.example.com");
        let result = probe_node(&prober, &slow, Duration::from_millis(5000)).await;
        assert_eq!(result.status, ProbeStatus::Failed);
        assert!(result.error.unwrap().contains("超时"));
    }

    #[test]
    fn test_report_conversion_treats_timeout_as_failed() {
        let c = &candidates()[0];
        let report = NodeTestReport::timeout(&c.url, 5000);
        let result = NodeTestResult::from_report(c, &report);
        assert_eq!(result.status, ProbeStatus::Failed);
        assert_eq!(result.response_time, None);

        let ok = NodeTestReport::success(&c.url, 88, "连接成功 (HTTP 200)".into());
        assert_eq!(NodeTestResult::from_report(c, &ok).response_time, Some(88));
    }

    #[test]
    fn test_sort_puts_fast_successes_first() {
        let c = candidates();
        let mut results = vec![
            NodeTestResult::failed(&c[0], "x".into()),
            NodeTestResult::success(&c[1], 300),
            NodeTestResult::success(&c[2], 100),
        ];
        sort_by_response_time(&mut results);
        let names: Vec<_> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["C", "B", "A"]);
    }
}
