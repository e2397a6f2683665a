//! Delivery of Primary queue entries to clients.
//!
//! A [`Dispatcher`] can be stepped synchronously with
//! [`Dispatcher::run_cycle`] or driven on its own thread by a
//! [`DispatcherHandle`]. Clients are reached through a [`ClientTransport`].

mod dispatcher;
mod handle;
mod transport;

pub use dispatcher::{CycleOutcome, DispatchNotice, DispatchReport, Dispatcher, DispatcherState};
pub use handle::{DispatchControl, DispatcherHandle};
pub use transport::{ChannelTransport, ClientConnection, ClientTransport, SendOutcome};
