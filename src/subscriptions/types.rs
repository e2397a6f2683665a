//! Subscription types: interest, configuration and shared connection state.

use crate::config::QueueConfig;
use crate::error::Result;
use crate::types::ClientId;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Which keys a subscription receives.
#[derive(Clone, Debug)]
pub enum KeyFilter {
    All,
    Keys(BTreeSet<String>),
    Pattern(Regex),
}

/// Key-matching predicate, optionally restricted to one region.
#[derive(Clone, Debug)]
pub struct InterestSpec {
    /// Restrict to a region (None = every region).
    pub region: Option<String>,
    pub keys: KeyFilter,
}

impl InterestSpec {
    /// Interest in every key of every region.
    pub fn all_keys() -> Self {
        Self {
            region: None,
            keys: KeyFilter::All,
        }
    }

    /// Interest in an explicit key set.
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            region: None,
            keys: KeyFilter::Keys(keys.into_iter().map(Into::into).collect()),
        }
    }

    /// Interest in keys matching a regular expression.
    pub fn pattern(pattern: &str) -> Result<Self> {
        Ok(Self {
            region: None,
            keys: KeyFilter::Pattern(Regex::new(pattern)?),
        })
    }

    /// Restrict to a single region.
    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn matches(&self, region: &str, key: &str) -> bool {
        if let Some(ref wanted) = self.region {
            if wanted != region {
                return false;
            }
        }

        match &self.keys {
            KeyFilter::All => true,
            KeyFilter::Keys(keys) => keys.contains(key),
            KeyFilter::Pattern(re) => re.is_match(key),
        }
    }
}

impl Default for InterestSpec {
    fn default() -> Self {
        Self::all_keys()
    }
}

/// Configuration for a client subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    pub client_id: ClientId,

    /// Keep the queue across disconnects until `durable_timeout` elapses.
    pub durable: bool,

    pub durable_timeout: Duration,

    /// Upper bound between QRM broadcasts while dispatching.
    pub ack_interval: Duration,

    /// Entries per replica before the overflow policy applies.
    pub capacity: usize,

    pub interest: InterestSpec,
}

impl SubscriptionConfig {
    /// Non-durable, all-keys subscription with the service defaults.
    pub fn new(client_id: impl Into<String>, defaults: &QueueConfig) -> Self {
        Self {
            client_id: ClientId::new(client_id),
            durable: false,
            durable_timeout: defaults.default_durable_timeout,
            ack_interval: defaults.default_ack_interval,
            capacity: defaults.default_capacity,
            interest: InterestSpec::all_keys(),
        }
    }

    pub fn durable(mut self, timeout: Duration) -> Self {
        self.durable = true;
        self.durable_timeout = timeout;
        self
    }

    pub fn with_interest(mut self, interest: InterestSpec) -> Self {
        self.interest = interest;
        self
    }

    pub fn with_ack_interval(mut self, interval: Duration) -> Self {
        self.ack_interval = interval;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Logical subscription shared by every replica in its redundancy set.
pub struct Subscription {
    pub id: SubscriptionId,
    pub config: SubscriptionConfig,
    connected: AtomicBool,
    disconnected_since: Mutex<Option<Instant>>,
}

impl Subscription {
    pub fn new(id: SubscriptionId, config: SubscriptionConfig) -> Self {
        Self {
            id,
            config,
            connected: AtomicBool::new(true),
            disconnected_since: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.config.client_id
    }

    pub fn is_durable(&self) -> bool {
        self.config.durable
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Record a connection loss. Keeps the earliest timestamp if called twice.
    pub fn mark_disconnected(&self, now: Instant) {
        let mut since = self.disconnected_since.lock();
        if since.is_none() {
            *since = Some(now);
        }
        self.connected.store(false, Ordering::Release);
    }

    pub fn mark_connected(&self) {
        *self.disconnected_since.lock() = None;
        self.connected.store(true, Ordering::Release);
    }

    /// Oldest entries may be dropped only for a disconnected, non-durable client.
    pub fn may_drop_oldest(&self) -> bool {
        !self.is_durable() && !self.is_connected()
    }

    /// True once a disconnected durable client has outlived its timeout.
    pub fn durable_expired(&self, now: Instant) -> bool {
        match *self.disconnected_since.lock() {
            Some(since) => now.saturating_duration_since(since) >= self.config.durable_timeout,
            None => false,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("client", &self.config.client_id)
            .field("durable", &self.config.durable)
            .field("connected", &self.is_connected())
            .finish()
    }
}
