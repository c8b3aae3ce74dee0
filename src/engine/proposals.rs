use crate::consensus::{EntryId, Index, Term};
use crate::engine::engine_api::{ProposalOutcome, ProposalToken, ProposeError};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// ProposalTable holds every proposal accepted on this replica that has not yet been
/// resolved. Keyed by idempotency token; resolution happens exactly once, by whichever
/// comes first of: the token's entry applying, a leadership change invalidating its
/// term, a snapshot install superseding its index, or the caller's timeout.
///
/// This table is volatile, per-replica state. The replicated dedup record in the
/// applier is what protects retries; this table only routes completions to waiters.
pub(crate) struct ProposalTable {
    logger: slog::Logger,
    pending: HashMap<ProposalToken, PendingProposal>,
}

struct PendingProposal {
    entry_id: EntryId,
    // A retry of an in-flight token joins the existing proposal instead of re-appending,
    // so one proposal can have several waiters.
    responders: Vec<oneshot::Sender<ProposalOutcome>>,
}

impl ProposalTable {
    pub(crate) fn new(logger: slog::Logger) -> Self {
        ProposalTable {
            logger,
            pending: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Register a freshly accepted proposal.
    pub(crate) fn register(
        &mut self,
        token: ProposalToken,
        entry_id: EntryId,
    ) -> oneshot::Receiver<ProposalOutcome> {
        let (tx, rx) = oneshot::channel();
        let previous = self.pending.insert(
            token,
            PendingProposal {
                entry_id,
                responders: vec![tx],
            },
        );
        debug_assert!(
            previous.is_none(),
            "Registered a token that was already pending; join_pending should have caught it."
        );
        rx
    }

    /// Attach another waiter to a token that is already in flight. Returns the entry the
    /// token was accepted at, or `None` if the token is not pending here.
    pub(crate) fn join_pending(
        &mut self,
        token: &ProposalToken,
    ) -> Option<(EntryId, oneshot::Receiver<ProposalOutcome>)> {
        let proposal = self.pending.get_mut(token)?;
        let (tx, rx) = oneshot::channel();
        proposal.responders.push(tx);
        Some((proposal.entry_id, rx))
    }

    /// Resolve the token's proposal, if still pending. Duplicate resolution attempts
    /// (e.g. a commit arriving for a proposal that already timed out) are no-ops.
    pub(crate) fn resolve(&mut self, token: &ProposalToken, outcome: ProposalOutcome) {
        if let Some(proposal) = self.pending.remove(token) {
            Self::send_to_all(proposal.responders, outcome);
        }
    }

    /// The caller's timeout elapsed. The proposal is resolved as timed out locally; the
    /// entry may still commit and apply later, where the replicated dedup record takes
    /// over protecting retries.
    pub(crate) fn cancel(&mut self, token: &ProposalToken) {
        if let Some(proposal) = self.pending.remove(token) {
            slog::info!(
                self.logger,
                "Proposal {:?} at {:?} cancelled by caller timeout.",
                token,
                proposal.entry_id,
            );
            Self::send_to_all(proposal.responders, Err(ProposeError::Timeout));
        }
    }

    /// Leadership changed at `observed_term`: every proposal accepted under an older
    /// term can no longer be confirmed by this replica. Their entries may still commit
    /// later and will be applied; only the waiters are failed.
    pub(crate) fn fail_stale_terms(&mut self, observed_term: Term) {
        let stale: Vec<ProposalToken> = self
            .pending
            .iter()
            .filter(|(_, proposal)| proposal.entry_id.term < observed_term)
            .map(|(token, _)| *token)
            .collect();

        if !stale.is_empty() {
            slog::info!(
                self.logger,
                "Failing {} proposal(s) from terms before {:?}.",
                stale.len(),
                observed_term,
            );
        }

        for token in stale {
            self.resolve(&token, Err(ProposeError::LeadershipLost { observed_term }));
        }
    }

    /// A snapshot was installed with `floor` as its last included index. Proposals at
    /// or below the floor were superseded: their outcome is unknowable from here, and
    /// the dedup record that would absorb a retry was replaced wholesale.
    pub(crate) fn fail_at_or_below(&mut self, floor: Index) {
        let superseded: Vec<ProposalToken> = self
            .pending
            .iter()
            .filter(|(_, proposal)| proposal.entry_id.index <= floor)
            .map(|(token, _)| *token)
            .collect();

        for token in superseded {
            self.resolve(&token, Err(ProposeError::SupersededBySnapshot));
        }
    }

    /// Replica-level halt: nothing pending can ever resolve here again.
    pub(crate) fn fail_all(&mut self, error: ProposeError) {
        for (_, proposal) in self.pending.drain() {
            Self::send_to_all(proposal.responders, Err(error.clone()));
        }
    }

    fn send_to_all(responders: Vec<oneshot::Sender<ProposalOutcome>>, outcome: ProposalOutcome) {
        for responder in responders {
            // A waiter that already gave up dropped its receiver; nothing to tell it.
            let _ = responder.send(outcome.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::engine_api::AppliedOutput;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn entry_id(term: u64, index: u64) -> EntryId {
        EntryId {
            term: Term::new(term),
            index: Index::new(index),
        }
    }

    fn applied(entry_id: EntryId) -> ProposalOutcome {
        Ok(AppliedOutput {
            entry_id,
            previous: None,
        })
    }

    #[test]
    fn resolve_reaches_every_waiter() {
        let mut table = ProposalTable::new(test_logger());
        let token = ProposalToken::new(1);
        let id = entry_id(1, 5);

        let mut rx1 = table.register(token, id);
        let (joined_id, mut rx2) = table.join_pending(&token).unwrap();
        assert_eq!(joined_id, id);

        table.resolve(&token, applied(id));
        assert!(rx1.try_recv().unwrap().is_ok());
        assert!(rx2.try_recv().unwrap().is_ok());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn resolution_happens_at_most_once() {
        let mut table = ProposalTable::new(test_logger());
        let token = ProposalToken::new(1);
        let id = entry_id(1, 5);

        let mut rx = table.register(token, id);
        table.cancel(&token);
        // Commit arrives after the timeout already resolved the proposal.
        table.resolve(&token, applied(id));

        match rx.try_recv().unwrap() {
            Err(ProposeError::Timeout) => {}
            other => panic!("Expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn stale_terms_fail_on_leadership_change() {
        let mut table = ProposalTable::new(test_logger());
        let old = ProposalToken::new(1);
        let current = ProposalToken::new(2);

        let mut old_rx = table.register(old, entry_id(3, 10));
        let mut current_rx = table.register(current, entry_id(4, 11));

        table.fail_stale_terms(Term::new(4));

        match old_rx.try_recv().unwrap() {
            Err(ProposeError::LeadershipLost { observed_term }) => {
                assert_eq!(observed_term, Term::new(4))
            }
            other => panic!("Expected leadership lost, got {:?}", other),
        }
        assert!(current_rx.try_recv().is_err(), "Current-term proposal must stay pending.");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn snapshot_floor_supersedes_proposals() {
        let mut table = ProposalTable::new(test_logger());
        let below = ProposalToken::new(1);
        let above = ProposalToken::new(2);

        let mut below_rx = table.register(below, entry_id(1, 5));
        let mut above_rx = table.register(above, entry_id(1, 9));

        table.fail_at_or_below(Index::new(5));

        assert!(matches!(
            below_rx.try_recv().unwrap(),
            Err(ProposeError::SupersededBySnapshot)
        ));
        assert!(above_rx.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }
}
