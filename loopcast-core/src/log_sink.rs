use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub text: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

#[derive(Debug, Default)]
struct SinkState {
    pending: VecDeque<LogLine>,
    next_seq: u64,
}

/// FIFO channel of log lines from a run to the display layer.
///
/// Any number of producers may push; a single consumer drains. Draining
/// hands over everything pushed so far in push order.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    state: Arc<Mutex<SinkState>>,
    notify: Arc<Notify>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: impl Into<String>) {
        {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push_back(LogLine {
                seq,
                at: Utc::now(),
                text: line.into(),
            });
        }
        self.notify.notify_one();
    }

    pub fn drain_all(&self) -> Vec<LogLine> {
        self.lock().pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Waits until at least one undrained line is available.
    pub async fn wait_for_lines(&self) {
        if !self.is_empty() {
            return;
        }
        self.notify.notified().await;
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The last `capacity` lines seen by the display layer.
#[derive(Debug, Clone)]
pub struct LogTail {
    capacity: usize,
    lines: VecDeque<LogLine>,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn extend(&mut self, lines: impl IntoIterator<Item = LogLine>) {
        for line in lines {
            if self.lines.len() == self.capacity {
                self.lines.pop_front();
            }
            self.lines.push_back(line);
        }
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.iter().cloned().collect()
    }

    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn drain_preserves_push_order() {
        let sink = LogSink::new();
        sink.push("one");
        sink.push(String::from("two"));
        sink.push("three");

        let lines = sink.drain_all();
        let texts: Vec<_> = lines.iter().map(|line| line.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert!(lines.windows(2).all(|pair| pair[0].seq < pair[1].seq));
        assert!(sink.drain_all().is_empty());
    }

    #[test]
    fn tail_keeps_most_recent_lines() {
        let sink = LogSink::new();
        for idx in 0..30 {
            sink.push(format!("line {idx}"));
        }
        let mut tail = LogTail::new(20);
        tail.extend(sink.drain_all());
        let lines = tail.lines();
        assert_eq!(lines.len(), 20);
        assert_eq!(lines[0].text, "line 10");
        assert!(tail.render().ends_with("line 29"));
    }

    #[tokio::test]
    async fn waiter_is_released_by_push_from_another_task() {
        let sink = LogSink::new();
        let producer = sink.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push("hello");
        });
        tokio::time::timeout(Duration::from_secs(2), sink.wait_for_lines())
            .await
            .expect("push should wake the consumer");
        assert_eq!(sink.drain_all()[0].text, "hello");
    }
}
