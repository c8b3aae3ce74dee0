use crate::consensus::Index;
use tokio::sync::watch;

/// CommitCursor is the highest log index known applied to storage for one group.
///
/// It only ever ratchets forward, one index at a time (or jumps forward on snapshot
/// install). The engine's actor is the sole writer; readers hold a [`CursorWatch`] and
/// await barrier satisfaction on it. The watch value is the raw index, 0 meaning
/// nothing applied yet.
pub(crate) struct CommitCursor {
    tx: watch::Sender<u64>,
}

/// How an incoming commit index relates to the cursor.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Arrival {
    /// The next expected index; apply it.
    Next,
    /// At or below the cursor; already applied, ignore silently.
    Duplicate,
    /// Beyond the next expected index; the gapless delivery contract is broken.
    Gap { expected: Index },
}

impl CommitCursor {
    pub(crate) fn new(recovered: Option<Index>) -> Self {
        let initial = recovered.map(|i| i.as_u64()).unwrap_or(0);
        let (tx, _) = watch::channel(initial);
        CommitCursor { tx }
    }

    pub(crate) fn current(&self) -> Option<Index> {
        let raw = *self.tx.borrow();
        if raw == 0 {
            None
        } else {
            Some(Index::new(raw))
        }
    }

    pub(crate) fn next_expected(&self) -> Index {
        Index::new(*self.tx.borrow() + 1)
    }

    pub(crate) fn classify(&self, index: Index) -> Arrival {
        let expected = self.next_expected();
        if index == expected {
            Arrival::Next
        } else if index < expected {
            Arrival::Duplicate
        } else {
            Arrival::Gap { expected }
        }
    }

    /// Advance past a just-applied entry. Caller must have classified `index` as
    /// `Arrival::Next`; anything else is an engine bug.
    pub(crate) fn advance_to(&mut self, index: Index) {
        debug_assert_eq!(self.next_expected(), index, "Cursor advanced out of order.");
        self.tx.send_replace(index.as_u64());
    }

    /// Jump forward to a snapshot's floor. Caller is responsible for rejecting stale
    /// (at-or-below-cursor) snapshots before calling.
    pub(crate) fn install(&mut self, index: Index) {
        debug_assert!(
            index.as_u64() > *self.tx.borrow(),
            "Snapshot install must move the cursor forward."
        );
        self.tx.send_replace(index.as_u64());
    }

    pub(crate) fn watch(&self) -> CursorWatch {
        CursorWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-side view of a group's commit cursor.
#[derive(Clone)]
pub struct CursorWatch {
    rx: watch::Receiver<u64>,
}

impl CursorWatch {
    pub fn current(&self) -> Option<Index> {
        let raw = *self.rx.borrow();
        if raw == 0 {
            None
        } else {
            Some(Index::new(raw))
        }
    }

    /// Wait until the cursor covers `index`. This is the linearizable read barrier.
    pub async fn wait_for(&mut self, index: Index) -> Result<(), BarrierLost> {
        loop {
            if *self.rx.borrow() >= index.as_u64() {
                return Ok(());
            }
            self.rx.changed().await.map_err(|_| BarrierLost {})?;
        }
    }
}

/// The engine (the cursor's writer) went away while we were waiting on the barrier.
#[derive(Debug, thiserror::Error)]
#[error("replica engine shut down while waiting on read barrier")]
pub struct BarrierLost {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        fn run(cursor_at: u64, incoming: u64, expected: Arrival) {
            let recovered = if cursor_at == 0 {
                None
            } else {
                Some(Index::new(cursor_at))
            };
            let cursor = CommitCursor::new(recovered);
            assert_eq!(expected, cursor.classify(Index::new(incoming)));
        }

        run(0, 1, Arrival::Next);
        run(0, 2, Arrival::Gap { expected: Index::new(1) });
        run(5, 6, Arrival::Next);
        run(5, 5, Arrival::Duplicate);
        run(5, 1, Arrival::Duplicate);
        run(5, 7, Arrival::Gap { expected: Index::new(6) });
        run(5, 99, Arrival::Gap { expected: Index::new(6) });
    }

    #[test]
    fn advance_is_visible_to_watchers() {
        let mut cursor = CommitCursor::new(None);
        let watch = cursor.watch();
        assert_eq!(watch.current(), None);

        cursor.advance_to(Index::new(1));
        cursor.advance_to(Index::new(2));
        assert_eq!(watch.current(), Some(Index::new(2)));
    }

    #[tokio::test]
    async fn barrier_resolves_once_cursor_covers_index() {
        let mut cursor = CommitCursor::new(None);
        let mut watch = cursor.watch();

        let barrier = tokio::spawn(async move { watch.wait_for(Index::new(2)).await });

        cursor.advance_to(Index::new(1));
        cursor.advance_to(Index::new(2));

        barrier.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn snapshot_install_satisfies_barrier() {
        let mut cursor = CommitCursor::new(None);
        let mut watch = cursor.watch();

        cursor.install(Index::new(10));
        watch.wait_for(Index::new(5)).await.unwrap();
        assert_eq!(cursor.current(), Some(Index::new(10)));
    }
}
