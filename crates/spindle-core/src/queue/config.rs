//! Queue configuration: fixed at construction, immutable per queue instance.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::WorkerTag;
use crate::error::ConfigError;

/// `ttl` value meaning leases never expire.
pub const NEVER_EXPIRE: i64 = -1;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What happens to tasks that used up their retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscardStrategy {
    /// Leave them in place, visible but never claimed again.
    #[default]
    Keep,
    /// Delete them on the next discard sweep.
    Remove,
}

impl DiscardStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscardStrategy::Keep => "keep",
            DiscardStrategy::Remove => "remove",
        }
    }
}

impl FromStr for DiscardStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" => Ok(DiscardStrategy::Keep),
            "remove" => Ok(DiscardStrategy::Remove),
            _ => Err(ConfigError::UnknownDiscardStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for DiscardStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated queue configuration.
///
/// Deserializing goes through [`QueueConfigBuilder`], so a config read from a
/// file is validated exactly like one built in code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QueueConfigBuilder")]
pub struct QueueConfig {
    worker_tag: WorkerTag,
    ttl: i64,
    max_retries: u32,
    discard_strategy: DiscardStrategy,
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }

    pub fn worker_tag(&self) -> &WorkerTag {
        &self.worker_tag
    }

    /// Lease length in seconds, or [`NEVER_EXPIRE`].
    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn discard_strategy(&self) -> DiscardStrategy {
        self.discard_strategy
    }

    pub fn expires(&self) -> bool {
        self.ttl != NEVER_EXPIRE
    }

    /// Leases last touched before the returned timestamp have expired.
    pub fn lease_cutoff(&self, now: f64) -> f64 {
        now - self.ttl as f64
    }

    /// Same queue settings under another worker identity.
    pub fn with_worker_tag(&self, worker_tag: WorkerTag) -> Result<Self, ConfigError> {
        if worker_tag.is_empty() {
            return Err(ConfigError::EmptyWorkerTag);
        }
        Ok(Self {
            worker_tag,
            ..self.clone()
        })
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_tag: WorkerTag::for_current_process(),
            ttl: NEVER_EXPIRE,
            max_retries: DEFAULT_MAX_RETRIES,
            discard_strategy: DiscardStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfigBuilder {
    worker_tag: Option<WorkerTag>,
    ttl: Option<i64>,
    max_retries: Option<u32>,
    discard_strategy: Option<DiscardStrategy>,
}

impl QueueConfigBuilder {
    pub fn worker_tag(mut self, tag: WorkerTag) -> Self {
        self.worker_tag = Some(tag);
        self
    }

    pub fn ttl(mut self, seconds: i64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn discard_strategy(mut self, strategy: DiscardStrategy) -> Self {
        self.discard_strategy = Some(strategy);
        self
    }

    /// Validates and fills defaults. Without an explicit tag the queue runs as
    /// `consumer_<pid>`.
    pub fn build(self) -> Result<QueueConfig, ConfigError> {
        let ttl = self.ttl.unwrap_or(NEVER_EXPIRE);
        if ttl < NEVER_EXPIRE {
            return Err(ConfigError::InvalidTtl(ttl));
        }

        let max_retries = self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        if max_retries == 0 {
            return Err(ConfigError::InvalidMaxRetries);
        }

        let worker_tag = self.worker_tag.unwrap_or_else(WorkerTag::for_current_process);
        if worker_tag.is_empty() {
            return Err(ConfigError::EmptyWorkerTag);
        }

        Ok(QueueConfig {
            worker_tag,
            ttl,
            max_retries,
            discard_strategy: self.discard_strategy.unwrap_or_default(),
        })
    }
}

impl TryFrom<QueueConfigBuilder> for QueueConfig {
    type Error = ConfigError;

    fn try_from(builder: QueueConfigBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}
