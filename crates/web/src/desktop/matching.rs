//! Reuse policies for existing gateway connections

use serde::{Deserialize, Serialize};

use super::gateway::GatewayConnection;

/// One rule for picking an existing gateway connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// Connection named like the configured sentinel (case-insensitive)
    Sentinel,
    /// Same hostname, port and username
    Exact,
    /// Same hostname
    Host,
}

impl MatchPolicy {
    pub fn default_order() -> Vec<Self> {
        vec![Self::Sentinel, Self::Exact, Self::Host]
    }

    /// Parse a comma-separated list such as `"sentinel,exact,host"`
    pub fn parse_list(s: &str) -> Result<Vec<Self>, String> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::parse)
            .collect()
    }

    /// Whether the policy inspects connection parameters
    pub fn needs_parameters(self) -> bool {
        !matches!(self, Self::Sentinel)
    }
}

impl std::str::FromStr for MatchPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sentinel" => Ok(Self::Sentinel),
            "exact" => Ok(Self::Exact),
            "host" => Ok(Self::Host),
            other => Err(format!("unknown match policy: {}", other)),
        }
    }
}

/// What the profile being resolved looks like
#[derive(Debug, Clone)]
pub struct MatchTarget<'a> {
    pub hostname: &'a str,
    pub port: u16,
    pub username: Option<&'a str>,
}

/// Apply `policies` in order; the first policy with any hit wins.
pub fn find_existing<'c>(
    connections: &'c [GatewayConnection],
    policies: &[MatchPolicy],
    sentinel_name: &str,
    target: &MatchTarget<'_>,
) -> Option<(&'c GatewayConnection, MatchPolicy)> {
    policies.iter().find_map(|&policy| {
        connections
            .iter()
            .find(|c| matches(c, policy, sentinel_name, target))
            .map(|c| (c, policy))
    })
}

fn matches(
    conn: &GatewayConnection,
    policy: MatchPolicy,
    sentinel_name: &str,
    target: &MatchTarget<'_>,
) -> bool {
    match policy {
        MatchPolicy::Sentinel => {
            !sentinel_name.is_empty() && conn.name.eq_ignore_ascii_case(sentinel_name)
        }
        MatchPolicy::Exact => {
            conn.parameter("hostname") == Some(target.hostname)
                && conn.parameter("port") == Some(target.port.to_string().as_str())
                && conn.parameter("username").unwrap_or("") == target.username.unwrap_or("")
        }
        MatchPolicy::Host => conn.parameter("hostname") == Some(target.hostname),
    }
}
