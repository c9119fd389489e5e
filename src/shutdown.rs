// Process-wide shutdown signal. The dispatcher and every transfer session hold a listener and
// stop as soon as it fires.

use tokio::sync::watch;

/// Fires the shutdown signal. Dropping the trigger also releases every pending `recv`.
#[derive(Debug)]
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

/// Listens for the process-wide shutdown signal. Cloned into the dispatcher and into every
/// transfer session.
#[derive(Debug, Clone)]
pub struct Shutdown {
    receiver: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownTrigger { sender }, Shutdown { receiver })
}

impl ShutdownTrigger {
    pub fn shutdown(&self) {
        // No receivers left means nobody needs telling.
        let _ = self.sender.send(true);
    }
}

impl Shutdown {
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes once shutdown has been requested, immediately if it already was.
    pub async fn recv(&mut self) {
        // An error means the trigger was dropped, which counts as a shutdown.
        let _ = self.receiver.wait_for(|stop| *stop).await;
    }
}
