//! Bounded ring of decoder stderr lines
//!
//! The decoder's stderr is drained on its own task so the pipe can never
//! fill up and stall the process. Only the most recent lines are kept, and
//! every line is credential-masked before it is stored; nothing downstream
//! ever sees a raw URI.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;
use tokio::task::JoinHandle;

/// Lines retained per decoder process
const RING_CAPACITY: usize = 20;

/// Shared, bounded buffer of the most recent stderr lines
#[derive(Clone, Debug)]
pub struct StderrRing {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrRing {
    pub fn new() -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(RING_CAPACITY))),
        }
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == RING_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Joined tail of retained lines (already masked).
    pub fn tail(&self) -> String {
        let lines = self.lines.lock();
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl Default for StderrRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain `stderr` line by line into `ring` until EOF.
pub fn spawn_drain(stderr: ChildStderr, ring: StderrRing) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            ring.push(crate::utils::url::mask_credentials(line.trim_end()));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_is_bounded() {
        let ring = StderrRing::new();
        for i in 0..50 {
            ring.push(format!("line {i}"));
        }
        let tail = ring.tail();
        let count = tail.lines().count();
        assert_eq!(count, RING_CAPACITY);
        assert!(tail.starts_with("line 30"));
        assert!(tail.ends_with("line 49"));
    }

    #[test]
    fn test_clear() {
        let ring = StderrRing::new();
        ring.push("x".to_string());
        ring.clear();
        assert!(ring.tail().is_empty());
    }
}
