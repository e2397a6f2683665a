//! Background thread driving a dispatcher.

use super::dispatcher::{CycleOutcome, Dispatcher};
use crate::error::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// Control messages for a running dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchControl {
    Resume,
    Flush,
    Stop,
}

/// Owns a dispatcher thread. Dropping the handle stops and joins it.
pub struct DispatcherHandle {
    dispatcher: Arc<Dispatcher>,
    control: Sender<DispatchControl>,
    thread: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Start `dispatcher` on its own thread. Waits for new events are bounded
    /// by `wait`, after which control messages are re-checked.
    pub fn spawn(dispatcher: Arc<Dispatcher>, wait: Duration) -> Result<Self> {
        let (control, commands) = bounded(16);
        let worker = Arc::clone(&dispatcher);
        let name = format!(
            "dispatch-{}-{}",
            dispatcher.subscription_id().0,
            dispatcher.member().0
        );
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || run(worker, commands, wait))?;

        Ok(Self {
            dispatcher,
            control,
            thread: Some(thread),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn resume(&self) {
        let _ = self.control.send(DispatchControl::Resume);
        self.dispatcher.queue().notify();
    }

    pub fn flush(&self) {
        let _ = self.control.send(DispatchControl::Flush);
        self.dispatcher.queue().notify();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.control.send(DispatchControl::Stop);
            self.dispatcher.stop();
            let _ = thread.join();
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Returns false when the loop should exit.
fn apply(dispatcher: &Dispatcher, command: DispatchControl) -> bool {
    match command {
        DispatchControl::Resume => dispatcher.resume(),
        DispatchControl::Flush => {
            dispatcher.flush();
        }
        DispatchControl::Stop => return false,
    }
    true
}

fn run(dispatcher: Arc<Dispatcher>, commands: Receiver<DispatchControl>, wait: Duration) {
    debug!(
        subscription = %dispatcher.subscription_id(),
        member = %dispatcher.member(),
        "dispatcher thread started"
    );

    loop {
        match commands.try_recv() {
            Ok(command) => {
                if !apply(&dispatcher, command) {
                    break;
                }
            }
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        match dispatcher.run_cycle() {
            CycleOutcome::Dispatched(_) => {}
            CycleOutcome::Empty => {
                dispatcher.queue().wait_for_event(wait);
            }
            CycleOutcome::Suspended => match commands.recv_timeout(wait) {
                Ok(command) => {
                    if !apply(&dispatcher, command) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            },
            CycleOutcome::Stopped => break,
        }
    }

    debug!(
        subscription = %dispatcher.subscription_id(),
        member = %dispatcher.member(),
        "dispatcher thread exited"
    );
}
