use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs for a raft division. Anything left as `None` gets a default.
#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    /// Timeout for every peer RPC the leader (or a candidate) makes.
    pub leader_append_entries_timeout: Option<Duration>,
    /// The leader's lease lasts `follower_min_timeout * leader_lease_ratio`. Must be in (0, 1].
    pub leader_lease_ratio: Option<f64>,
    pub pre_vote: Option<bool>,
    pub max_entries_per_append_entries: Option<usize>,
    pub snapshot_chunk_size: Option<usize>,
    /// Take a snapshot (and compact the log) after this many applied entries. Off by default.
    pub snapshot_auto_trigger_threshold: Option<u64>,
    pub retry_cache_expiry: Option<Duration>,
}

#[derive(Clone, Debug)]
pub(super) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub leader_append_entries_timeout: Duration,
    pub leader_lease_ratio: f64,
    pub pre_vote: bool,
    pub max_entries_per_append_entries: usize,
    pub snapshot_chunk_size: usize,
    pub snapshot_auto_trigger_threshold: Option<u64>,
    pub retry_cache_expiry: Duration,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.leader_append_entries_timeout >= self.follower_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's heartbeat timeout");
        }
        if !(self.leader_lease_ratio > 0.0 && self.leader_lease_ratio <= 1.0) {
            return Err("Leader lease ratio must be greater than 0 and at most 1");
        }
        if self.max_entries_per_append_entries == 0 {
            return Err("AppendEntries must be allowed to carry at least one entry");
        }
        if self.snapshot_chunk_size == 0 {
            return Err("Snapshot chunk size must not be 0");
        }
        if self.snapshot_auto_trigger_threshold == Some(0) {
            return Err("Snapshot threshold must not be 0. Leave it unset to disable snapshots.");
        }

        Ok(())
    }

    pub fn leader_lease_duration(&self) -> Duration {
        self.follower_min_timeout.mul_f64(self.leader_lease_ratio)
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(1500)),
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(300)),
            leader_lease_ratio: options.leader_lease_ratio.unwrap_or(0.9),
            pre_vote: options.pre_vote.unwrap_or(true),
            max_entries_per_append_entries: options.max_entries_per_append_entries.unwrap_or(128),
            snapshot_chunk_size: options.snapshot_chunk_size.unwrap_or(64 * 1024),
            snapshot_auto_trigger_threshold: options.snapshot_auto_trigger_threshold,
            retry_cache_expiry: options.retry_cache_expiry.unwrap_or(Duration::from_secs(60)),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let validated = RaftOptionsValidated::try_from(RaftOptions::default()).unwrap();
        assert!(validated.pre_vote);
        assert_eq!(validated.snapshot_auto_trigger_threshold, None);
        assert_eq!(validated.leader_lease_duration(), Duration::from_millis(450));
    }

    #[test]
    fn timing_relationships_are_enforced() {
        let heartbeat_too_slow = RaftOptions {
            leader_heartbeat_duration: Some(Duration::from_millis(600)),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(heartbeat_too_slow).is_err());

        let inverted_timeouts = RaftOptions {
            follower_min_timeout: Some(Duration::from_millis(2000)),
            follower_max_timeout: Some(Duration::from_millis(1000)),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(inverted_timeouts).is_err());

        let rpc_timeout_too_long = RaftOptions {
            leader_append_entries_timeout: Some(Duration::from_millis(500)),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(rpc_timeout_too_long).is_err());
    }

    #[test]
    fn sizes_and_ratios_are_enforced() {
        for ratio in [0.0, -0.5, 1.5].iter() {
            let options = RaftOptions {
                leader_lease_ratio: Some(*ratio),
                ..RaftOptions::default()
            };
            assert!(RaftOptionsValidated::try_from(options).is_err(), "ratio {}", ratio);
        }

        let no_entries = RaftOptions {
            max_entries_per_append_entries: Some(0),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(no_entries).is_err());

        let no_chunk = RaftOptions {
            snapshot_chunk_size: Some(0),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(no_chunk).is_err());

        let snapshot_every_entry = RaftOptions {
            snapshot_auto_trigger_threshold: Some(1),
            leader_lease_ratio: Some(1.0),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(snapshot_every_entry).is_ok());
    }
}
