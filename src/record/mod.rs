//! Record kinds written by the broker
//!
//! The engine itself is agnostic of what a record means. This module holds
//! the two concrete layouts the broker uses on top of it: the binlog, which
//! records every state-changing command, and the per-topic data logs.

pub mod binlog;
pub mod topic;

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Command carried by a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Publish messages to a topic
    Pub,
    /// Create a topic
    CreateTopic,
    /// Delete a topic
    DeleteTopic,
    /// Store a delayed message
    Delay,
    /// Deliver a delayed message that came due
    DelayApply,
}

impl CommandKind {
    /// Wire code of the command
    pub fn code(self) -> i64 {
        match self {
            CommandKind::Pub => 1,
            CommandKind::CreateTopic => 2,
            CommandKind::DeleteTopic => 3,
            CommandKind::Delay => 16,
            CommandKind::DelayApply => 101,
        }
    }

    /// Command for a wire code
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(CommandKind::Pub),
            2 => Some(CommandKind::CreateTopic),
            3 => Some(CommandKind::DeleteTopic),
            16 => Some(CommandKind::Delay),
            101 => Some(CommandKind::DelayApply),
            _ => None,
        }
    }

    /// Whether the command changes the topic registry
    pub fn is_ddl(self) -> bool {
        matches!(self, CommandKind::CreateTopic | CommandKind::DeleteTopic)
    }
}

/// Hands out increasing record ids for one log
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicI64,
}

impl IdAllocator {
    /// Allocator whose first id is `first`
    pub fn starting_at(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }

    /// Allocator continuing after the last id found on disk
    pub fn after(last: Option<i64>) -> Self {
        Self::starting_at(last.map_or(1, |id| id + 1))
    }

    /// Take the next id
    pub fn allocate(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Id the next call to [`allocate`](Self::allocate) returns
    pub fn peek(&self) -> i64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_codes_round_trip() {
        for kind in [
            CommandKind::Pub,
            CommandKind::CreateTopic,
            CommandKind::DeleteTopic,
            CommandKind::Delay,
            CommandKind::DelayApply,
        ] {
            assert_eq!(CommandKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(CommandKind::from_code(0), None);
        assert!(CommandKind::CreateTopic.is_ddl());
        assert!(!CommandKind::Pub.is_ddl());
    }

    #[test]
    fn test_ids_are_unique_across_threads() {
        let ids = Arc::new(IdAllocator::after(Some(41)));
        assert_eq!(ids.peek(), 42);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                thread::spawn(move || (0..100).map(|_| ids.allocate()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
        assert_eq!(all[0], 42);
        assert_eq!(ids.peek(), 442);
    }
}
