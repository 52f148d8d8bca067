//! Shared test fixtures: a no-op byte sink and a short polling helper for
//! assertions that depend on the presence tracker's async consumer task.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nakama_core::error::Result;
use nakama_core::session::ByteSink;

/// Captures every payload sent to it instead of writing to a real socket.
#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl ByteSink for RecordingSink {
    fn send_bytes(&self, payload: &[u8], _reliable: bool) -> Result<()> {
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}

/// Poll `check` until it returns `true` or `timeout` elapses. The presence
/// event queue is drained by a background task, so any assertion about its
/// side effects (a status follower notified, a match hook invoked) needs to
/// wait rather than assume same-tick delivery.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
