use std::convert::TryFrom;
use tokio::time::Duration;

/// Optional tuning knobs for one cluster member. Anything left None takes
/// the documented default.
#[derive(Clone, Default)]
pub struct Options {
    pub leader_heartbeat_interval: Option<Duration>,
    pub election_timeout_min: Option<Duration>,
    pub election_timeout_max: Option<Duration>,
    pub health_check_interval: Option<Duration>,
    pub backup_interval: Option<Duration>,
    pub backup_retention_days: Option<i64>,
    pub coordinator_cleanup_interval: Option<Duration>,
    pub default_replication_factor: Option<usize>,
}

pub(crate) struct OptionsValidated {
    pub leader_heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub health_check_interval: Duration,
    pub backup_interval: Duration,
    pub backup_retention_days: i64,
    pub coordinator_cleanup_interval: Duration,
    pub default_replication_factor: usize,
}

impl OptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_interval >= self.election_timeout_min {
            return Err("Election timeout minimum must be greater than the leader heartbeat interval");
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err("Election timeout minimum must be less than the maximum");
        }
        if self.default_replication_factor < 1 {
            return Err("Replication factor must be at least 1");
        }
        if self.backup_retention_days < 1 {
            return Err("Backup retention must be at least one day");
        }

        Ok(())
    }
}

impl TryFrom<Options> for OptionsValidated {
    type Error = &'static str;

    fn try_from(options: Options) -> Result<Self, Self::Error> {
        let values = OptionsValidated {
            leader_heartbeat_interval: options
                .leader_heartbeat_interval
                .unwrap_or(Duration::from_millis(50)),
            election_timeout_min: options.election_timeout_min.unwrap_or(Duration::from_millis(150)),
            election_timeout_max: options.election_timeout_max.unwrap_or(Duration::from_millis(300)),
            health_check_interval: options.health_check_interval.unwrap_or(Duration::from_secs(10)),
            backup_interval: options.backup_interval.unwrap_or(Duration::from_secs(3600)),
            backup_retention_days: options.backup_retention_days.unwrap_or(7),
            coordinator_cleanup_interval: options
                .coordinator_cleanup_interval
                .unwrap_or(Duration::from_secs(10)),
            default_replication_factor: options.default_replication_factor.unwrap_or(3),
        };

        values.validate()?;
        Ok(values)
    }
}
