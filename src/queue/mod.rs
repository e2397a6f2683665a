//! Per-client subscription queues and their redundancy sets.
//!
//! - [`ReplicaQueue`]: one member's ordered copy of a client's pending events
//! - [`ReplicaSet`]: every replica of a subscription; one is Primary
//! - [`QueueImage`]: checksummed snapshot used to seed a new Secondary

mod image;
mod replica;
mod set;

pub use image::QueueImage;
pub use replica::ReplicaQueue;
pub use set::{Replica, ReplicaSet};
