//! Statistics sink
//!
//! Calls are fire-and-forget; nothing the coordinator does depends on them.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use fleetd_api::{FailureReason, Peer, RequestCode};
use tracing::{debug, info};

pub trait Stats: Send + Sync {
    fn record_request(&self, node: &Peer, client: &str, code: RequestCode);
    fn record_finished_job(&self, node: &Peer, client: &str, reason: FailureReason);
    fn record_language_bytes(&self, languages: &[(String, u64)]);
    fn add_recent_project(&self, url: &str);
}

/// Reports everything through `tracing`
#[derive(Default, Debug, Clone, Copy)]
pub struct TracingStats;

impl Stats for TracingStats {
    fn record_request(&self, node: &Peer, client: &str, code: RequestCode) {
        debug!(target: "fleetd::stats", %node, client, code = code.as_str(), "request");
    }

    fn record_finished_job(&self, node: &Peer, client: &str, reason: FailureReason) {
        debug!(target: "fleetd::stats", %node, client, reason = reason.id(), "finished job");
    }

    fn record_language_bytes(&self, languages: &[(String, u64)]) {
        for (language, bytes) in languages {
            debug!(target: "fleetd::stats", language = %language, bytes, "crawled language");
        }
    }

    fn add_recent_project(&self, url: &str) {
        info!(target: "fleetd::stats", url, "Project processed");
    }
}

#[derive(Default, Debug)]
struct MemStatsInner {
    requests: HashMap<(String, &'static str), u64>,
    finished: HashMap<i32, u64>,
    language_bytes: HashMap<String, u64>,
    recent_projects: VecDeque<String>,
}

/// Keeps counters in memory
#[derive(Default, Debug)]
pub struct MemStats {
    inner: Mutex<MemStatsInner>,
}

impl MemStats {
    pub const RECENT_PROJECTS: usize = 100;

    pub fn requests(&self, client: &str, code: RequestCode) -> u64 {
        let inner = self.inner.lock().expect("Locking failed");
        inner
            .requests
            .get(&(client.to_owned(), code.as_str()))
            .copied()
            .unwrap_or_default()
    }

    pub fn finished_jobs(&self, reason: FailureReason) -> u64 {
        let inner = self.inner.lock().expect("Locking failed");
        inner.finished.get(&reason.id()).copied().unwrap_or_default()
    }

    pub fn language_bytes(&self, language: &str) -> u64 {
        let inner = self.inner.lock().expect("Locking failed");
        inner
            .language_bytes
            .get(language)
            .copied()
            .unwrap_or_default()
    }

    /// Most recent first
    pub fn recent_projects(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("Locking failed");
        inner.recent_projects.iter().rev().cloned().collect()
    }
}

impl Stats for MemStats {
    fn record_request(&self, _node: &Peer, client: &str, code: RequestCode) {
        let mut inner = self.inner.lock().expect("Locking failed");
        *inner
            .requests
            .entry((client.to_owned(), code.as_str()))
            .or_default() += 1;
    }

    fn record_finished_job(&self, _node: &Peer, _client: &str, reason: FailureReason) {
        let mut inner = self.inner.lock().expect("Locking failed");
        *inner.finished.entry(reason.id()).or_default() += 1;
    }

    fn record_language_bytes(&self, languages: &[(String, u64)]) {
        let mut inner = self.inner.lock().expect("Locking failed");
        for (language, bytes) in languages {
            *inner.language_bytes.entry(language.clone()).or_default() += bytes;
        }
    }

    fn add_recent_project(&self, url: &str) {
        let mut inner = self.inner.lock().expect("Locking failed");
        if inner.recent_projects.len() == Self::RECENT_PROJECTS {
            inner.recent_projects.pop_front();
        }
        inner.recent_projects.push_back(url.to_owned());
    }
}

#[test]
fn mem_stats_keeps_bounded_recent_projects() {
    let stats = MemStats::default();
    for i in 0..(MemStats::RECENT_PROJECTS + 5) {
        stats.add_recent_project(&format!("https://p/{i}"));
    }
    let recent = stats.recent_projects();
    assert_eq!(recent.len(), MemStats::RECENT_PROJECTS);
    assert_eq!(recent[0], format!("https://p/{}", MemStats::RECENT_PROJECTS + 4));

    stats.record_language_bytes(&[("Rust".into(), 10), ("Rust".into(), 5)]);
    assert_eq!(stats.language_bytes("Rust"), 15);
}
