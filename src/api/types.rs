/// How stale a read is allowed to be.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadConsistency {
    /// Never observe state older than anything committed before the read started. The
    /// read waits behind a barrier until the local applied cursor covers the group's
    /// committed index as of read-start, so it holds even on a lagging replica.
    Linearizable,

    /// Serve locally if this replica currently believes it is leader. Cheaper than the
    /// barrier; only as good as the consensus library's leadership guarantee.
    LeaderLease,

    /// Serve whatever is locally applied. May be arbitrarily far behind the latest
    /// commit.
    Stale,
}
