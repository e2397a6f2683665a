//! # HA Queue
//!
//! Highly available per-client event queues with cross-replica
//! deduplication.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: A client's registration and interest; one per client
//! - **Replica Queues**: Each hosting member keeps an ordered copy of the
//!   client's pending events; exactly one is Primary
//! - **Dispatch**: The Primary sends to the client and periodically
//!   broadcasts a Queue Removal Message (QRM) so Secondaries drop what was
//!   delivered
//! - **Failover**: When a Primary dies the lowest live Secondary is promoted
//!   and marks the handover with a marker event
//!
//! ## Example
//!
//! ```ignore
//! use haqueue::{ChannelTransport, MemberId, OperationKind, QueueConfig, QueueService};
//!
//! let transport = Arc::new(ChannelTransport::new(Duration::from_secs(1)));
//! let service = QueueService::new(QueueConfig::default(), transport.clone())?;
//! service.add_member(MemberId(1))?;
//! service.add_member(MemberId(2))?;
//!
//! let client = transport.connect(ClientId::new("client-a"), 1024);
//! let sub = service.subscribe(service.subscription_config("client-a"), &[MemberId(1), MemberId(2)])?;
//!
//! service.on_mutation("region", "KEY_1", OperationKind::Create, None, MemberId(1));
//! service.pump(sub)?;
//! let marker = client.recv()?;
//! let event = client.recv()?;
//! ```

pub mod adapter;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod failover;
pub mod member;
pub mod qrm;
pub mod queue;
pub mod service;
pub mod stats;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use adapter::EventSourceAdapter;
pub use client::{ClientEventTracker, Observation, TrackerStats};
pub use config::QueueConfig;
pub use dispatch::{
    ChannelTransport, ClientConnection, ClientTransport, CycleOutcome, DispatchControl,
    DispatchNotice, DispatchReport, Dispatcher, DispatcherHandle, DispatcherState, SendOutcome,
};
pub use error::{QueueError, Result};
pub use failover::{FailoverController, Promotion};
pub use member::Member;
pub use qrm::QrmCoordinator;
pub use queue::{QueueImage, Replica, ReplicaQueue, ReplicaSet};
pub use service::QueueService;
pub use stats::{QrmStats, ReplicaStats, StatsSnapshot};
pub use subscriptions::{
    InterestSpec, KeyFilter, Subscription, SubscriptionConfig, SubscriptionId,
    SubscriptionRegistry,
};
pub use types::*;
