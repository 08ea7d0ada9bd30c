use std::{fmt, str::FromStr};

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};

use crate::probe::NodeCandidate;

/**
 * \brief PackyCode 服务档位：公交（共享线路）与出租（独享线路）。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    #[default]
    Bus,
    Taxi,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Bus => "bus",
            ServiceType::Taxi => "taxi",
        }
    }

    /**
     * \brief 自动命名使用的档位标签。
     */
    pub fn label(&self) -> &'static str {
        match self {
            ServiceType::Bus => "Bus",
            ServiceType::Taxi => "Taxi",
        }
    }

    /**
     * \brief 该档位的内置节点池，第一个为默认节点。
     */
    pub fn pool(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            ServiceType::Bus => BUS_NODES,
            ServiceType::Taxi => TAXI_NODES,
        }
    }

    pub fn default_url(&self) -> &'static str {
        self.pool()[0].1
    }

    pub fn candidates(&self) -> Vec<NodeCandidate> {
        self.pool()
            .iter()
            .map(|(name, url)| NodeCandidate::from_url(name, url))
            .collect()
    }

    /**
     * \brief 根据地址推断档位：`share-api` 主机属于出租档。
     */
    pub fn detect(api_url: &str) -> Self {
        if api_url.contains("share-api") || api_url.contains("share.packycode") {
            ServiceType::Taxi
        } else {
            ServiceType::Bus
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bus" => Ok(ServiceType::Bus),
            "taxi" => Ok(ServiceType::Taxi),
            other => Err(anyhow!("unknown service type: {}", other)),
        }
    }
}

const BUS_NODES: &[(&str, &str)] = &[
    ("公交车默认节点", "https://api.packycode.com"),
    ("公交车 HK-CN2", "https://api-hk-cn2.packycode.com"),
    ("公交车 HK-G", "https://api-hk-g.packycode.com"),
    ("公交车 CF-Pro", "https://api-cf-pro.packycode.com"),
    ("公交车 US-CN2", "https://api-us-cn2.packycode.com"),
];

const TAXI_NODES: &[(&str, &str)] = &[
    ("滴滴车默认节点", "https://share-api.packycode.com"),
    ("滴滴车 HK-CN2", "https://share-api-hk-cn2.packycode.com"),
    ("滴滴车 HK-G", "https://share-api-hk-g.packycode.com"),
    ("滴滴车 CF-Pro", "https://share-api-cf-pro.packycode.com"),
    ("滴滴车 US-CN2", "https://share-api-us-cn2.packycode.com"),
];

/**
 * \brief 额度查询地址：出租档走 share 域名。
 */
pub fn quota_endpoint(api_url: &str) -> &'static str {
    match ServiceType::detect(api_url) {
        ServiceType::Taxi => "https://share.packycode.com/api/backend/users/info",
        ServiceType::Bus => "https://www.packycode.com/api/backend/users/info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pools_are_disjoint_and_detectable() {
        for (_, url) in ServiceType::Bus.pool() {
            assert_eq!(ServiceType::detect(url), ServiceType::Bus);
        }
        for (_, url) in ServiceType::Taxi.pool() {
            assert_eq!(ServiceType::detect(url), ServiceType::Taxi);
        }
        assert_eq!(ServiceType::Bus.candidates().len(), 5);
        assert_eq!(ServiceType::Taxi.candidates()[0].id, ServiceType::Taxi.default_url());
    }

    #[test]
    fn test_quota_endpoint_follows_tier() {
        assert!(quota_endpoint("https://share-api-hk-g.packycode.com").contains("share.packycode"));
        assert!(quota_endpoint("https://api.packycode.com").contains("www.packycode"));
    }
}
