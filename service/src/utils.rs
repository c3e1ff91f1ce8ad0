//! Small shared helpers: the one-shot alarm used for watchdogs and sniff
//! timers, the advertising-payload fingerprint hash, and a monotonic
//! millisecond clock.

use std::time::{Duration, Instant};

use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::Message;

/// One-shot timer that posts a message back onto the dispatch loop when it
/// fires. Dropping or cancelling the alarm aborts the underlying task; a
/// message that already left the task is neutralised by the state checks in
/// its handler.
pub struct Alarm {
    handle: JoinHandle<()>,
}

impl Alarm {
    pub fn start<F>(tx: Sender<Message>, timeout_ms: u64, make_msg: F) -> Self
    where
        F: FnOnce() -> Message + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            sleep(Duration::from_millis(timeout_ms)).await;
            let _ = tx.send(make_msg()).await;
        });

        Alarm { handle }
    }

    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// 4-byte FNV-1a over a raw advertising payload. Zero is reserved as the
/// empty-slot marker in the fingerprint table, so it is mapped away.
pub fn payload_hash32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for b in data {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x01000193);
    }

    if hash == 0 {
        1
    } else {
        hash
    }
}

/// Monotonic millisecond clock anchored at first use.
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock { epoch: Instant::now() }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_hash_stability() {
        let payload = [0x02, 0x01, 0x06, 0x03, 0x16, 0x0f, 0x18];
        assert_eq!(payload_hash32(&payload), payload_hash32(&payload));
        assert_ne!(payload_hash32(&payload), payload_hash32(&payload[..6]));
        assert_ne!(payload_hash32(&[]), 0);
    }
}
