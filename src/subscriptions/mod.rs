//! Client subscriptions.
//!
//! A subscription is created on client registration and referenced by every
//! replica queue in its redundancy set. Subscriptions support:
//! - Interest by key set, key pattern or all keys, optionally per region
//! - Durable clients whose queues outlive a disconnect until a timeout
//! - Bounded queues that shed oldest entries only for gone non-durable clients
//!
//! # Example
//!
//! ```ignore
//! let config = SubscriptionConfig::new("my-durable-client", &QueueConfig::default())
//!     .durable(Duration::from_secs(300))
//!     .with_interest(InterestSpec::pattern("^KEY_")?);
//! let id = service.subscribe(config, &[MemberId(1), MemberId(2)])?;
//! ```

mod registry;
mod types;

pub use registry::SubscriptionRegistry;
pub use types::{InterestSpec, KeyFilter, Subscription, SubscriptionConfig, SubscriptionId};
