use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};

/// Resettable idle deadline owned by a read loop.
///
/// The timer lives inside the struct, so it is dropped with the loop on every exit path.
#[derive(Debug)]
pub struct IdleDeadline {
    window: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl IdleDeadline {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            sleep: Box::pin(tokio::time::sleep(window)),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Push the deadline a full window past now.
    pub fn reset(&mut self) {
        let next = Instant::now() + self.window;
        self.sleep.as_mut().reset(next);
    }

    /// Resolves once the window has elapsed without a reset. Cancel safe.
    pub async fn expired(&mut self) {
        self.sleep.as_mut().await;
    }
}
