//! Runtime configuration shared by every raft group on a host.

use std::time::Duration;

use anyerror::AnyError;
use clap::Parser;

use crate::error::ConfigError;

/// Parse a number with an optional unit, such as `10MiB`.
fn parse_bytes_with_unit(src: &str) -> Result<u64, ConfigError> {
    let res = byte_unit::Byte::from_str(src).map_err(|e| ConfigError::InvalidNumber {
        invalid: src.to_string(),
        reason: e.to_string(),
    })?;

    Ok(res.get_bytes() as u64)
}

/// Runtime configuration for a raft host.
///
/// Timing knobs are expressed in ticks; one tick is `tick_interval_ms` of
/// real time. Every group on the host shares one config and one tick source,
/// but each group randomizes its own election timeout independently.
///
/// Create a configuration, optionally customize fields, then validate it:
///
/// ```ignore
/// let config = Config {
///     election_tick: 10,
///     heartbeat_tick: 1,
///     ..Default::default()
/// };
/// let config = Arc::new(config.validate()?);
/// ```
#[derive(Clone, Debug, Parser, PartialEq)]
pub struct Config {
    /// Length of one tick in milliseconds.
    #[clap(long, default_value = "100")]
    pub tick_interval_ms: u64,

    /// Ticks without leader contact before a follower campaigns.
    ///
    /// The effective timeout is randomized per group in
    /// `[election_tick, 2 * election_tick)`.
    #[clap(long, default_value = "5")]
    pub election_tick: u64,

    /// Ticks between two leader heartbeat broadcasts.
    #[clap(long, default_value = "1")]
    pub heartbeat_tick: u64,

    /// The maximum number of bytes of entries carried by one AppendEntries message.
    #[clap(long, default_value = "1MiB", value_parser = parse_bytes_with_unit)]
    pub max_msg_bytes: u64,

    /// The maximum number of unacknowledged AppendEntries batches to a single peer.
    #[clap(long, default_value = "128")]
    pub max_inflight_msgs: usize,

    /// Whether followers refuse votes while under an unexpired leader lease,
    /// and whether a new leader must collect election acks before serving.
    #[clap(long, default_value_t = false,
           action = clap::ArgAction::Set,
           num_args = 0..=1,
           default_missing_value = "true")]
    pub lease_check: bool,

    /// Whether a pre-vote round runs before incrementing the local term.
    #[clap(long, default_value_t = false,
           action = clap::ArgAction::Set,
           num_args = 0..=1,
           default_missing_value = "true")]
    pub pre_vote: bool,

    /// Number of applied entries retained in the log before a snapshot is
    /// taken and the prefix truncated.
    #[clap(long, default_value = "10000")]
    pub snapshot_threshold: u64,

    /// The maximum size of a snapshot transferred in one message.
    #[clap(long, default_value = "64MiB", value_parser = parse_bytes_with_unit)]
    pub snapshot_max_bytes: u64,

    /// Capacity of a group's input channel; overflow rejects proposals.
    #[clap(long, default_value = "4096")]
    pub group_queue_size: usize,

    /// Capacity of a transport sender's outbound queue; overflow drops messages.
    #[clap(long, default_value = "1024")]
    pub sender_queue_size: usize,

    /// Ticks an incoming message for a not-yet-registered group is buffered
    /// before being dropped.
    #[clap(long, default_value = "2")]
    pub unknown_group_ticks: u64,

    /// Deadline for one caller-facing operation (propose, read, member
    /// change) in milliseconds; on elapse the caller gets a timeout error.
    #[clap(long, default_value = "10000")]
    pub request_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        <Self as Parser>::parse_from(Vec::<&'static str>::new())
    }
}

impl Config {
    /// Length of one tick.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Duration of the leader lease: `election_tick - heartbeat_tick` ticks.
    pub fn lease_duration(&self) -> Duration {
        self.tick_interval() * (self.election_tick - self.heartbeat_tick) as u32
    }

    /// Build a `Config` instance from a series of command line arguments.
    ///
    /// The first element in `args` must be the application name.
    pub fn build(args: &[&str]) -> Result<Config, ConfigError> {
        let config = <Self as Parser>::try_parse_from(args).map_err(|e| ConfigError::ParseError {
            source: AnyError::from(&e),
            args: args.iter().map(|x| x.to_string()).collect(),
        })?;
        config.validate()
    }

    /// Validate the state of this config.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.heartbeat_tick == 0 {
            return Err(ConfigError::HeartbeatTickIsZero);
        }

        if self.election_tick <= self.heartbeat_tick {
            return Err(ConfigError::ElectionTickTooSmall {
                election_tick: self.election_tick,
                heartbeat_tick: self.heartbeat_tick,
            });
        }

        if self.max_inflight_msgs == 0 {
            return Err(ConfigError::MaxInflightIsZero);
        }

        Ok(self)
    }
}
