use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Default)]
pub struct EngineOptions {
    /// Depth of the group's actor event queue.
    pub actor_queue_size: Option<usize>,
    /// How long a linearizable read waits on its barrier before giving up.
    pub linearizable_read_timeout: Option<Duration>,
    /// Base period of the timer-driven snapshot trigger. `None` disables the timer;
    /// snapshots can still be cut explicitly.
    pub snapshot_interval: Option<Duration>,
    /// Random extra delay added to each snapshot trigger. Defaults to a tenth of the
    /// interval.
    pub snapshot_jitter: Option<Duration>,
}

pub(super) struct EngineOptionsValidated {
    pub actor_queue_size: usize,
    pub linearizable_read_timeout: Duration,
    pub snapshot_trigger: Option<(Duration, Duration)>,
}

impl EngineOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.actor_queue_size == 0 {
            return Err("Actor queue size must be at least 1");
        }
        if self.linearizable_read_timeout.is_zero() {
            return Err("Linearizable read timeout must be non-zero");
        }
        if let Some((interval, jitter)) = self.snapshot_trigger {
            if interval.is_zero() {
                return Err("Snapshot interval must be non-zero");
            }
            if jitter > interval {
                return Err("Snapshot jitter must not exceed the snapshot interval");
            }
        }

        Ok(())
    }
}

impl TryFrom<EngineOptions> for EngineOptionsValidated {
    type Error = &'static str;

    fn try_from(options: EngineOptions) -> Result<Self, Self::Error> {
        if options.snapshot_interval.is_none() && options.snapshot_jitter.is_some() {
            return Err("Snapshot jitter requires a snapshot interval");
        }

        let snapshot_trigger = options.snapshot_interval.map(|interval| {
            let jitter = options.snapshot_jitter.unwrap_or(interval / 10);
            (interval, jitter)
        });

        let values = EngineOptionsValidated {
            actor_queue_size: options.actor_queue_size.unwrap_or(16),
            linearizable_read_timeout: options
                .linearizable_read_timeout
                .unwrap_or(Duration::from_secs(5)),
            snapshot_trigger,
        };

        values.validate()?;
        Ok(values)
    }
}
