use crate::background::{self, Stopper};
use crate::cluster::{NodeId, NodeStatus, ResourceMetrics};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Resource thresholds, in usage percent. One breached threshold degrades a
/// node, two or more make it unhealthy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub network_io: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        HealthThresholds {
            cpu: 85.0,
            memory: 85.0,
            disk: 90.0,
            network_io: 80.0,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Alert {
    pub node: NodeId,
    pub severity: AlertSeverity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Periodic metric self-report, pushed by each member to the others.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub node: NodeId,
    pub metrics: ResourceMetrics,
}

/// Per-node health view returned to collaborators.
#[derive(Clone, Debug, Serialize)]
pub struct NodeHealth {
    pub status: NodeStatus,
    pub metrics: ResourceMetrics,
    pub alerts: Vec<Alert>,
    pub consecutive_failures: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, Serialize)]
pub struct ClusterHealth {
    pub status: HealthLevel,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub degraded_nodes: usize,
    pub unhealthy_nodes: usize,
    pub healthy_percentage: f64,
}

#[derive(Clone)]
pub struct HealthMonitorConfig {
    pub thresholds: HealthThresholds,
    pub heartbeat_timeout: Duration,
    pub max_consecutive_failures: u32,
    pub alert_retention: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        HealthMonitorConfig {
            thresholds: HealthThresholds::default(),
            heartbeat_timeout: Duration::seconds(30),
            max_consecutive_failures: 3,
            alert_retention: Duration::hours(24),
        }
    }
}

struct NodeRecord {
    status: NodeStatus,
    metrics: ResourceMetrics,
    last_heartbeat: DateTime<Utc>,
    consecutive_failures: u32,
    alerts: Vec<Alert>,
}

/// Tracks per-node metrics and heartbeat recency, derives health status, and
/// accumulates alerts. Independent of consensus; it observes, it does not
/// coordinate.
pub struct HealthMonitor {
    logger: slog::Logger,
    config: HealthMonitorConfig,
    records: Mutex<HashMap<NodeId, NodeRecord>>,
}

pub struct MonitorLoopHandle {
    _stopper: Stopper,
}

impl HealthMonitor {
    pub fn new(logger: slog::Logger, config: HealthMonitorConfig) -> Self {
        HealthMonitor {
            logger,
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_node(&self, node: NodeId) {
        let mut records = self.records.lock().expect("HealthMonitor.register_node() mutex poison");
        records.entry(node).or_insert_with(|| NodeRecord {
            status: NodeStatus::Active,
            metrics: ResourceMetrics::default(),
            last_heartbeat: Utc::now(),
            consecutive_failures: 0,
            alerts: Vec::new(),
        });
    }

    pub fn forget_node(&self, node: &NodeId) {
        let mut records = self.records.lock().expect("HealthMonitor.forget_node() mutex poison");
        records.remove(node);
    }

    pub fn record_heartbeat(&self, node: &NodeId) {
        let mut records = self.records.lock().expect("HealthMonitor.record_heartbeat() mutex poison");
        if let Some(record) = records.get_mut(node) {
            record.last_heartbeat = Utc::now();
        }
    }

    /// Overwrite a node's metrics and re-derive its status immediately.
    /// A report also counts as proof of life.
    pub fn update_node_metrics(&self, node: &NodeId, metrics: ResourceMetrics) {
        let now = Utc::now();
        let mut records = self
            .records
            .lock()
            .expect("HealthMonitor.update_node_metrics() mutex poison");
        let record = match records.get_mut(node) {
            Some(record) => record,
            None => {
                slog::debug!(self.logger, "Metrics for unknown node {:?}", node);
                return;
            }
        };

        record.metrics = metrics;
        record.last_heartbeat = now;
        Self::evaluate_record(&self.config, node, record, now);
    }

    /// Force a status, e.g. when the distribution manager declares a node
    /// failed. Failed is terminal until the node re-registers.
    pub fn set_node_status(&self, node: &NodeId, status: NodeStatus) {
        let mut records = self.records.lock().expect("HealthMonitor.set_node_status() mutex poison");
        if let Some(record) = records.get_mut(node) {
            record.status = status;
        }
    }

    pub fn get_node_health(&self, node: &NodeId) -> Option<NodeHealth> {
        let records = self.records.lock().expect("HealthMonitor.get_node_health() mutex poison");
        records.get(node).map(|record| NodeHealth {
            status: record.status,
            metrics: record.metrics,
            alerts: record.alerts.clone(),
            consecutive_failures: record.consecutive_failures,
        })
    }

    pub fn get_cluster_health(&self) -> ClusterHealth {
        let records = self.records.lock().expect("HealthMonitor.get_cluster_health() mutex poison");

        let total = records.len();
        let mut healthy = 0usize;
        let mut degraded = 0usize;
        let mut unhealthy = 0usize;
        for record in records.values() {
            match record.status {
                NodeStatus::Active => healthy += 1,
                NodeStatus::Degraded => degraded += 1,
                NodeStatus::Unhealthy | NodeStatus::Failed => unhealthy += 1,
            }
        }

        let status = if total == 0 {
            HealthLevel::Healthy
        } else {
            let healthy_pct = healthy as f64 / total as f64 * 100.0;
            let degraded_pct = degraded as f64 / total as f64 * 100.0;
            let unhealthy_pct = unhealthy as f64 / total as f64 * 100.0;

            if unhealthy_pct > 20.0 {
                HealthLevel::Unhealthy
            } else if degraded_pct > 30.0 {
                HealthLevel::Degraded
            } else if healthy_pct > 80.0 {
                HealthLevel::Healthy
            } else {
                HealthLevel::Degraded
            }
        };

        ClusterHealth {
            status,
            total_nodes: total,
            healthy_nodes: healthy,
            degraded_nodes: degraded,
            unhealthy_nodes: unhealthy,
            healthy_percentage: if total == 0 {
                100.0
            } else {
                healthy as f64 / total as f64 * 100.0
            },
        }
    }

    /// One pass over every node: heartbeat staleness, threshold evaluation,
    /// alert retention. Returns alerts newly raised this cycle so the caller
    /// can publish them. Called by the background loop, and directly by
    /// tests.
    pub fn run_check_cycle(&self) -> Vec<Alert> {
        self.run_check_cycle_at(Utc::now())
    }

    pub(crate) fn run_check_cycle_at(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let mut new_alerts = Vec::new();
        let mut records = self.records.lock().expect("HealthMonitor.run_check_cycle() mutex poison");

        for (node, record) in records.iter_mut() {
            // Failed is set by the coordinator layer and is terminal here.
            if record.status == NodeStatus::Failed {
                continue;
            }

            let alerts_before = record.alerts.len();
            let heartbeat_age = now.signed_duration_since(record.last_heartbeat);
            if heartbeat_age > self.config.heartbeat_timeout {
                record.consecutive_failures += 1;
                record.status = NodeStatus::Unhealthy;
                record.alerts.push(Alert {
                    node: node.clone(),
                    severity: AlertSeverity::Critical,
                    message: format!("No heartbeat for {}s", heartbeat_age.num_seconds()),
                    raised_at: now,
                });
                slog::warn!(
                    self.logger,
                    "Node {:?} missed heartbeat ({}s old), marked unhealthy",
                    node,
                    heartbeat_age.num_seconds(),
                );
            } else {
                Self::evaluate_record(&self.config, node, record, now);
            }

            new_alerts.extend(record.alerts[alerts_before..].iter().cloned());

            // Prune stale alerts.
            let retention = self.config.alert_retention;
            record
                .alerts
                .retain(|alert| now.signed_duration_since(alert.raised_at) <= retention);
        }

        new_alerts
    }

    fn evaluate_record(
        config: &HealthMonitorConfig,
        node: &NodeId,
        record: &mut NodeRecord,
        now: DateTime<Utc>,
    ) {
        let mut breaches: Vec<String> = Vec::new();
        let metrics = &record.metrics;
        let thresholds = &config.thresholds;
        if metrics.cpu >= thresholds.cpu {
            breaches.push(format!("cpu {:.1}% >= {:.1}%", metrics.cpu, thresholds.cpu));
        }
        if metrics.memory >= thresholds.memory {
            breaches.push(format!("memory {:.1}% >= {:.1}%", metrics.memory, thresholds.memory));
        }
        if metrics.disk >= thresholds.disk {
            breaches.push(format!("disk {:.1}% >= {:.1}%", metrics.disk, thresholds.disk));
        }
        if metrics.network_io >= thresholds.network_io {
            breaches.push(format!(
                "network {:.1}% >= {:.1}%",
                metrics.network_io, thresholds.network_io
            ));
        }

        let status = match breaches.len() {
            0 => NodeStatus::Active,
            1 => NodeStatus::Degraded,
            _ => NodeStatus::Unhealthy,
        };

        // The failure streak survives a merely-degraded evaluation; only a
        // clean bill of health resets it.
        match status {
            NodeStatus::Unhealthy => record.consecutive_failures += 1,
            NodeStatus::Active => record.consecutive_failures = 0,
            NodeStatus::Degraded | NodeStatus::Failed => {}
        }

        // Repeated unhealthy evaluations escalate regardless of breach count.
        let status = if record.consecutive_failures >= config.max_consecutive_failures {
            NodeStatus::Unhealthy
        } else {
            status
        };

        if status != record.status {
            for breach in &breaches {
                record.alerts.push(Alert {
                    node: node.clone(),
                    severity: if status == NodeStatus::Unhealthy {
                        AlertSeverity::Critical
                    } else {
                        AlertSeverity::Warning
                    },
                    message: breach.clone(),
                    raised_at: now,
                });
            }
        }
        record.status = status;
    }

    /// Background loop re-checking all nodes on a fixed interval. New alerts
    /// are pushed into `alert_sink` for the runtime to publish.
    pub fn spawn_check_loop(
        self: &Arc<Self>,
        interval: tokio::time::Duration,
        alert_sink: mpsc::Sender<Alert>,
    ) -> MonitorLoopHandle {
        let (stopper, stop_check) = background::stop_signal();
        let monitor = self.clone();

        tokio::task::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if stop_check.should_stop() {
                    return;
                }

                for alert in monitor.run_check_cycle() {
                    if let Err(e) = alert_sink.try_send(alert) {
                        slog::debug!(monitor.logger, "Alert sink rejected alert: {:?}", e);
                    }
                }
            }
        });

        MonitorLoopHandle { _stopper: stopper }
    }
}
