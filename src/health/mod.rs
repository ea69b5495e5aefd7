mod monitor;

pub use monitor::Alert;
pub use monitor::AlertSeverity;
pub use monitor::ClusterHealth;
pub use monitor::HealthLevel;
pub use monitor::HealthMonitor;
pub use monitor::HealthMonitorConfig;
pub use monitor::HealthReport;
pub use monitor::HealthThresholds;
pub use monitor::MonitorLoopHandle;
pub use monitor::NodeHealth;
