use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, trace};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Number of trailing lines kept for late subscribers.
pub const LOG_BUFFER_LINES: usize = 100;

/// Per-subscriber queue depth. A subscriber lagging further behind loses lines.
pub const SUBSCRIBER_QUEUE: usize = 256;

/// Fans the core's output out to any number of readers.
///
/// Publishing never waits: each subscriber has its own bounded queue and a
/// full queue only costs that subscriber the line. Subscribers whose receiver
/// was dropped are forgotten on the next publish.
#[derive(Debug)]
pub struct LogHub {
    subscribers: Mutex<Vec<mpsc::Sender<String>>>,
    buffer: Mutex<VecDeque<String>>,
    buffer_lines: usize,
    queue_depth: usize,
}

impl LogHub {
    pub fn new() -> Self {
        Self::with_limits(LOG_BUFFER_LINES, SUBSCRIBER_QUEUE)
    }

    pub fn with_limits(buffer_lines: usize, queue_depth: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer: Mutex::new(VecDeque::with_capacity(buffer_lines)),
            buffer_lines,
            queue_depth: queue_depth.max(1),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<mpsc::Sender<String>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new reader. It receives every line published from now on.
    pub fn subscribe(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let mut subscribers = self.subscribers();
        subscribers.push(tx);
        debug!("New log subscriber ({} total)", subscribers.len());
        rx
    }

    /// Copy of the trailing buffer, oldest line first.
    pub fn get_buffer(&self) -> Vec<String> {
        self.buffer().iter().cloned().collect()
    }

    /// Hands a line to every live subscriber, then appends it to the buffer.
    pub fn publish(&self, line: &str) {
        self.subscribers().retain(|tx| match tx.try_send(line.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("Log subscriber is lagging, dropping line");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Log subscriber went away, deregistering");
                false
            }
        });

        let mut buffer = self.buffer();
        if buffer.len() == self.buffer_lines {
            buffer.pop_front();
        }
        if self.buffer_lines > 0 {
            buffer.push_back(line.to_string());
        }
    }

    /// Drops every send side so readers observe end-of-stream.
    ///
    /// The trailing buffer is left untouched.
    pub fn close_subscribers(&self) {
        let mut subscribers = self.subscribers();
        if !subscribers.is_empty() {
            debug!("Closing {} log subscriber(s)", subscribers.len());
        }
        subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lines_reach_every_subscriber_in_order() {
        let hub = LogHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        for line in ["one", "two", "three"] {
            hub.publish(line);
        }
        hub.close_subscribers();

        for rx in [&mut a, &mut b] {
            let mut seen = Vec::new();
            while let Some(line) = rx.recv().await {
                seen.push(line);
            }
            assert_eq!(seen, vec!["one", "two", "three"]);
        }
    }

    #[test]
    fn test_buffer_keeps_trailing_lines() {
        let hub = LogHub::new();
        for i in 0..(LOG_BUFFER_LINES + 20) {
            hub.publish(&format!("line {}", i));
        }
        let buffer = hub.get_buffer();
        assert_eq!(buffer.len(), LOG_BUFFER_LINES);
        assert_eq!(buffer[0], "line 20");
        assert_eq!(buffer[LOG_BUFFER_LINES - 1], format!("line {}", LOG_BUFFER_LINES + 19));
    }

    #[test]
    fn test_buffer_survives_close() {
        let hub = LogHub::new();
        hub.publish("fatal: bad config");
        hub.close_subscribers();
        assert_eq!(hub.get_buffer(), vec!["fatal: bad config"]);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let hub = LogHub::with_limits(10, 2);
        let _stalled = hub.subscribe();
        let mut live = hub.subscribe();

        for i in 0..5 {
            hub.publish(&format!("{}", i));
            assert_eq!(live.recv().await.as_deref(), Some(format!("{}", i).as_str()));
        }
        // The stalled reader is still registered, it only lost lines.
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[test]
    fn test_dropped_subscriber_is_deregistered() {
        let hub = LogHub::new();
        let gone = hub.subscribe();
        let _kept = hub.subscribe();
        drop(gone);
        hub.publish("hello");
        assert_eq!(hub.subscriber_count(), 1);
    }
}
