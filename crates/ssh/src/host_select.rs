//! Host tracking for the two load-balancing algorithms (§4.E, R1-R3). Mirrors the original's
//! process-wide `TrackKernelOnHost` + `host_index`, replaced per REDESIGN FLAGS §9 with a
//! small concurrency-safe container rather than bare module-level mutable state.

use dashmap::DashMap;
use kprov_core::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct HostSelector {
    hosts: Vec<String>,
    algorithm: LoadBalancingAlgorithm,
    round_robin_index: AtomicUsize,
    active_by_host: DashMap<String, i64>,
    host_by_kernel: DashMap<KernelId, String>,
}

impl HostSelector {
    pub fn new(hosts: Vec<String>, algorithm: LoadBalancingAlgorithm) -> Self {
        let active_by_host = DashMap::new();
        for h in &hosts {
            active_by_host.insert(h.clone(), 0);
        }
        HostSelector {
            hosts,
            algorithm,
            round_robin_index: AtomicUsize::new(0),
            active_by_host,
            host_by_kernel: DashMap::new(),
        }
    }

    /// Selects the next host for `kernel_id`, honoring a `KERNEL_REMOTE_HOST` override
    /// (R3). Registers the selection so `release` can undo it at cleanup time.
    pub fn select(&self, kernel_id: &KernelId, remote_host_override: Option<&str>) -> String {
        let host = match self.algorithm {
            LoadBalancingAlgorithm::LeastConnection => {
                let chosen = match remote_host_override {
                    Some(h) => h.to_string(),
                    None => self.least_loaded_host(),
                };
                *self.active_by_host.entry(chosen.clone()).or_insert(0) += 1;
                chosen
            }
            LoadBalancingAlgorithm::RoundRobin => {
                let idx = self.round_robin_index.fetch_add(1, Ordering::SeqCst);
                match remote_host_override {
                    Some(h) => h.to_string(),
                    None => self.hosts[idx % self.hosts.len()].clone(),
                }
            }
        };
        self.host_by_kernel.insert(kernel_id.clone(), host.clone());
        host
    }

    /// Ties broken by insertion order (R2), i.e. the order hosts were configured in.
    fn least_loaded_host(&self) -> String {
        self.hosts
            .iter()
            .min_by_key(|h| self.active_by_host.get(h.as_str()).map(|v| *v).unwrap_or(0))
            .cloned()
            .unwrap_or_else(|| self.hosts[0].clone())
    }

    /// Undoes a prior `select` for `kernel_id`, used during `cleanup` for least-connection.
    pub fn release(&self, kernel_id: &KernelId) {
        if self.algorithm != LoadBalancingAlgorithm::LeastConnection {
            return;
        }
        if let Some((_, host)) = self.host_by_kernel.remove(kernel_id) {
            if let Some(mut count) = self.active_by_host.get_mut(&host) {
                *count -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_assigns_hosts_in_sequence_r1() {
        let sel = HostSelector::new(vec!["h1".into(), "h2".into(), "h3".into()], LoadBalancingAlgorithm::RoundRobin);
        assert_eq!(sel.select(&"k1".to_string(), None), "h1");
        assert_eq!(sel.select(&"k2".to_string(), None), "h2");
        assert_eq!(sel.select(&"k3".to_string(), None), "h3");
        assert_eq!(sel.select(&"k4".to_string(), None), "h1");
    }

    #[test]
    fn least_connection_picks_minimum_and_tracks_sum_r2() {
        let sel = HostSelector::new(vec!["h1".into(), "h2".into()], LoadBalancingAlgorithm::LeastConnection);
        assert_eq!(sel.select(&"k1".to_string(), None), "h1");
        assert_eq!(sel.select(&"k2".to_string(), None), "h2");
        assert_eq!(sel.select(&"k3".to_string(), None), "h1");
        sel.release(&"k1".to_string());
        assert_eq!(sel.select(&"k4".to_string(), None), "h1");
    }

    #[test]
    fn remote_host_override_bypasses_algorithm_r3() {
        let sel = HostSelector::new(vec!["h1".into(), "h2".into()], LoadBalancingAlgorithm::RoundRobin);
        assert_eq!(sel.select(&"k1".to_string(), Some("h-override")), "h-override");
    }
}
