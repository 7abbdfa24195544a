use std::collections::HashMap;

use dashmap::DashMap;

/// Browser user-agent rotation table.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.6 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
];

/// Consecutive failures on one index before rotating away from it.
const ROTATE_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
struct HostState {
    current_index: usize,
    /// Failure count per UA index.
    failures: Vec<u32>,
    /// Consecutive failures with the current index.
    consecutive: u32,
}

impl HostState {
    fn new(table_len: usize) -> Self {
        Self {
            current_index: 0,
            failures: vec![0; table_len],
            consecutive: 0,
        }
    }
}

/// Round-robin user-agent pool with per-host failure tracking. Three
/// consecutive failures on one index rotate the host to the index with the
/// lowest observed failure count; success zeroes the current index's count.
pub struct UserAgentPool {
    agents: Vec<String>,
    hosts: DashMap<String, HostState>,
}

impl UserAgentPool {
    pub fn new() -> Self {
        Self {
            agents: USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            hosts: DashMap::new(),
        }
    }

    /// The primary UA string, used for robots.txt identification.
    pub fn primary(&self) -> &str {
        &self.agents[0]
    }

    pub fn user_agent_for(&self, host: &str) -> String {
        let state = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(self.agents.len()));
        self.agents[state.current_index % self.agents.len()].clone()
    }

    /// Full request headers for a host. Returns a fresh map per call.
    pub fn headers_for(&self, host: &str) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("User-Agent".to_string(), self.user_agent_for(host));
        headers.insert(
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
                .to_string(),
        );
        headers.insert("Accept-Language".to_string(), "en-CA,en;q=0.9,fr-CA;q=0.7".to_string());
        headers.insert("Accept-Encoding".to_string(), "gzip, deflate, br".to_string());
        headers.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());
        headers
    }

    /// Force rotation to the next index, used by block-evasion policies.
    pub fn rotate(&self, host: &str) -> String {
        let mut state = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(self.agents.len()));
        state.current_index = (state.current_index + 1) % self.agents.len();
        state.consecutive = 0;
        self.agents[state.current_index].clone()
    }

    pub fn report_success(&self, host: &str) {
        let mut state = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(self.agents.len()));
        let idx = state.current_index;
        state.failures[idx] = 0;
        state.consecutive = 0;
    }

    /// Record a failure; at three consecutive with the same index, move the
    /// host to the least-failed index. Returns the new UA when a rotation
    /// happened.
    pub fn report_failure(&self, host: &str) -> Option<String> {
        let mut state = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(self.agents.len()));
        let idx = state.current_index;
        state.failures[idx] += 1;
        state.consecutive += 1;

        if state.consecutive >= ROTATE_AFTER_FAILURES {
            let best = state
                .failures
                .iter()
                .enumerate()
                .min_by_key(|(_, count)| **count)
                .map(|(i, _)| i)
                .unwrap_or(0);
            state.current_index = best;
            state.consecutive = 0;
            return Some(self.agents[best].clone());
        }
        None
    }
}

impl Default for UserAgentPool {
    fn default() -> Self {
        Self::new()
    }
}
