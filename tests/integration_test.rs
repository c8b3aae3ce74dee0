use bytes::Bytes;
use chrono::Utc;
use replicore::{
    consensus_event_channel, Command, EngineOptions, GroupConfig, GroupDescription, GroupRegistry,
    HaltReason, InMemoryConsensus, InMemoryStorage, Index, MemberChange, ProposalToken,
    ProposeError, ReadConsistency, ReadError, ReplicaGroupApi, ReplicaGroupId, ReplicaId,
    ReplicaInfo, ReplicaRole, StorageEngine, Term,
};
use slog::Drain;
use std::error::Error;
use std::fs::OpenOptions;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

type Handle = replicore::GroupHandle<InMemoryConsensus, InMemoryStorage>;

struct Replica {
    handle: Handle,
    consensus: Arc<InMemoryConsensus>,
    storage: Arc<InMemoryStorage>,
}

#[tokio::test]
async fn propose_commit_apply_read() -> Result<(), Box<dyn Error>> {
    let replica = start_leader_replica("group-1", "replica-1", &["replica-1", "replica-2", "replica-3"]).await?;

    let output = replica
        .handle
        .propose(token(1), put("name", "ferris"), Duration::from_secs(5))
        .await?;
    assert_eq!(output.entry_id.index, Index::new(1));
    assert_eq!(output.previous, None);

    // A linearizable read issued after a Committed response never observes older state.
    let value = replica
        .handle
        .read(ReadConsistency::Linearizable, b"name")
        .await?;
    assert_eq!(value, Some(Bytes::from(String::from("ferris"))));

    // Overwrite reports the previous value; delete removes it.
    let output = replica
        .handle
        .propose(token(2), put("name", "crab"), Duration::from_secs(5))
        .await?;
    assert_eq!(output.previous, Some(Bytes::from(String::from("ferris"))));

    replica
        .handle
        .propose(
            token(3),
            Command::Delete {
                key: Bytes::from(String::from("name")),
            },
            Duration::from_secs(5),
        )
        .await?;
    let value = replica.handle.read(ReadConsistency::Stale, b"name").await?;
    assert_eq!(value, None);

    Ok(())
}

#[tokio::test]
async fn timed_out_proposal_retried_with_same_token_applies_once() -> Result<(), Box<dyn Error>> {
    let replica = start_leader_replica("group-1", "replica-1", &["replica-1", "replica-2", "replica-3"]).await?;
    replica.consensus.set_auto_commit(false);

    let result = replica
        .handle
        .propose(token(7), put("k", "v"), Duration::from_millis(100))
        .await;
    match result {
        Err(ProposeError::Timeout) => {}
        other => panic!("Expected timeout, got {:?}", other),
    }
    assert!(ProposeError::Timeout.retry_safe());

    // The entry commits anyway, after the caller gave up.
    replica.consensus.release_commits(Index::new(1));
    wait_for_cursor(&replica.handle, Index::new(1), Duration::from_secs(5)).await;

    // Retrying the token is absorbed by the replicated dedup record: no second entry.
    let output = replica
        .handle
        .propose(token(7), put("k", "v"), Duration::from_secs(5))
        .await?;
    assert_eq!(output.entry_id.index, Index::new(1));
    assert_eq!(replica.consensus.log_len(), 1);
    assert_eq!(
        replica.handle.read(ReadConsistency::Stale, b"k").await?,
        Some(Bytes::from(String::from("v"))),
    );

    Ok(())
}

#[tokio::test]
async fn duplicate_commit_delivery_is_a_no_op() -> Result<(), Box<dyn Error>> {
    let replica = start_leader_replica("group-1", "replica-1", &["replica-1", "replica-2", "replica-3"]).await?;

    replica
        .handle
        .propose(token(1), put("k", "v"), Duration::from_secs(5))
        .await?;

    replica.consensus.redeliver(Index::new(1));
    // Give the redelivery time to (wrongly) do something.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let description = replica.handle.describe().await?;
    assert_eq!(description.commit_cursor, Some(Index::new(1)));
    assert!(description.serving);
    assert_eq!(
        replica.handle.read(ReadConsistency::Stale, b"k").await?,
        Some(Bytes::from(String::from("v"))),
    );

    Ok(())
}

#[tokio::test]
async fn leadership_lost_retry_does_not_double_apply() -> Result<(), Box<dyn Error>> {
    let replica = start_leader_replica("group-1", "replica-1", &["replica-1", "replica-2", "replica-3"]).await?;
    replica.consensus.set_auto_commit(false);

    let handle = replica.handle.clone();
    let pending = tokio::spawn(async move {
        handle
            .propose(token(9), put("k", "v"), Duration::from_secs(10))
            .await
    });

    // Wait until the proposal is in the log, then yank leadership.
    wait_until(Duration::from_secs(5), || replica.consensus.log_len() == 1).await;
    replica
        .consensus
        .become_follower(Term::new(2), Some(ReplicaId::new("replica-2")));

    let result = pending.await?;
    match result {
        Err(ProposeError::LeadershipLost { observed_term }) => {
            assert_eq!(observed_term, Term::new(2));
            assert!(ProposeError::LeadershipLost { observed_term }.retry_safe());
        }
        other => panic!("Expected leadership lost, got {:?}", other),
    }

    // The old-term entry still commits; it must apply exactly once.
    replica.consensus.release_commits(Index::new(1));
    wait_for_cursor(&replica.handle, Index::new(1), Duration::from_secs(5)).await;

    // Client retries against the replica once it regains leadership.
    replica.consensus.become_leader(Term::new(3));
    let output = replica
        .handle
        .propose(token(9), put("k", "v"), Duration::from_secs(5))
        .await?;
    assert_eq!(output.entry_id.index, Index::new(1));
    assert_eq!(replica.consensus.log_len(), 1, "Retry must not append a second entry");

    Ok(())
}

#[tokio::test]
async fn snapshot_catches_up_a_blank_replica() -> Result<(), Box<dyn Error>> {
    let members = ["replica-1", "replica-2", "replica-3"];
    let leader = start_leader_replica("group-1", "replica-1", &members).await?;

    for i in 1..=5u128 {
        leader
            .handle
            .propose(
                token(i),
                put(&format!("key-{}", i), &format!("value-{}", i)),
                Duration::from_secs(5),
            )
            .await?;
    }

    let descriptor = leader.handle.create_snapshot().await?;
    assert_eq!(descriptor.last_included.index, Index::new(5));

    // A replica that saw none of the five entries installs the snapshot wholesale.
    let follower = start_follower_replica("group-1", "replica-2", &members).await?;
    follower.handle.install_snapshot(descriptor).await?;

    let description = follower.handle.describe().await?;
    assert_eq!(description.commit_cursor, Some(Index::new(5)));
    for i in 1..=5u128 {
        let key = format!("key-{}", i);
        let expected = Some(Bytes::from(format!("value-{}", i)));
        assert_eq!(
            follower.handle.read(ReadConsistency::Stale, key.as_bytes()).await?,
            expected,
        );
    }
    // Follower's storage now matches the leader's, watermark included.
    assert_eq!(
        follower.storage.applied_watermark().unwrap(),
        leader.storage.applied_watermark().unwrap(),
    );

    Ok(())
}

#[tokio::test]
async fn membership_learner_is_added_then_promoted() -> Result<(), Box<dyn Error>> {
    let replica = start_leader_replica("group-1", "replica-1", &["replica-1", "replica-2", "replica-3"]).await?;

    let receipt = replica
        .handle
        .reconfigure(MemberChange::Add {
            replica_id: ReplicaId::new("replica-4"),
            role: ReplicaRole::Learner,
        })
        .await?;
    receipt.applied().await?;

    let description = replica.handle.describe().await?;
    assert_eq!(member_role(&description, "replica-4"), Some(ReplicaRole::Learner));

    let receipt = replica
        .handle
        .reconfigure(MemberChange::Promote {
            replica_id: ReplicaId::new("replica-4"),
        })
        .await?;
    receipt.applied().await?;

    let description = replica.handle.describe().await?;
    assert_eq!(member_role(&description, "replica-4"), Some(ReplicaRole::Voting));
    assert_eq!(description.members.len(), 4);

    Ok(())
}

#[tokio::test]
async fn removing_the_leader_hands_off_before_apply() -> Result<(), Box<dyn Error>> {
    let replica = start_leader_replica("group-1", "replica-1", &["replica-1", "replica-2", "replica-3"]).await?;

    let receipt = replica
        .handle
        .reconfigure(MemberChange::Remove {
            replica_id: ReplicaId::new("replica-1"),
        })
        .await?;
    receipt.applied().await?;

    let description = replica.handle.describe().await?;
    assert_eq!(description.members.len(), 2);
    assert!(member_role(&description, "replica-1").is_none());
    assert!(description.serving);

    // Old leader no longer accepts proposals after the removal entry commits.
    let result = replica
        .handle
        .propose(token(1), put("k", "v"), Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(ProposeError::NotLeader { .. })));

    Ok(())
}

#[tokio::test]
async fn storage_fault_halts_one_group_and_spares_the_other() -> Result<(), Box<dyn Error>> {
    let sick = start_leader_replica("group-sick", "replica-1", &["replica-1"]).await?;
    let healthy = start_leader_replica("group-healthy", "replica-1", &["replica-1"]).await?;

    let registry = GroupRegistry::new(create_root_logger_for_stdout("supervisor".to_string()));
    registry.register(sick.handle.clone()).unwrap();
    registry.register(healthy.handle.clone()).unwrap();

    sick.storage.fail_writes(true);
    let result = registry
        .propose(
            &ReplicaGroupId::new("group-sick"),
            token(1),
            put("k", "v"),
            Duration::from_secs(5),
        )
        .await;
    match result {
        Err(replicore::RegistryError::Group(ProposeError::Halted(
            HaltReason::StorageFault(_),
        ))) => {}
        other => panic!("Expected storage fault halt, got {:?}", other),
    }

    // The halted replica refuses reads too.
    let read = sick.handle.read(ReadConsistency::Stale, b"k").await;
    assert!(matches!(read, Err(ReadError::Halted(_))));

    // The other group on the same process is untouched.
    registry
        .propose(
            &ReplicaGroupId::new("group-healthy"),
            token(1),
            put("k", "v"),
            Duration::from_secs(5),
        )
        .await
        .expect("Healthy group must keep serving");
    let value = registry
        .read(
            &ReplicaGroupId::new("group-healthy"),
            ReadConsistency::Linearizable,
            b"k",
        )
        .await
        .unwrap();
    assert_eq!(value, Some(Bytes::from(String::from("v"))));

    Ok(())
}

// ------- Harness --------

async fn start_leader_replica(
    group: &str,
    replica_id: &str,
    members: &[&str],
) -> Result<Replica, Box<dyn Error>> {
    start_replica(group, replica_id, members, true).await
}

async fn start_follower_replica(
    group: &str,
    replica_id: &str,
    members: &[&str],
) -> Result<Replica, Box<dyn Error>> {
    start_replica(group, replica_id, members, false).await
}

async fn start_replica(
    group: &str,
    replica_id: &str,
    members: &[&str],
    leader: bool,
) -> Result<Replica, Box<dyn Error>> {
    let logger = create_root_logger_for_stdout(replica_id.to_string());
    let (publisher, consensus_events) = consensus_event_channel();

    let consensus = Arc::new(if leader {
        InMemoryConsensus::new_leader(
            logger.clone(),
            ReplicaId::new(replica_id),
            Term::new(1),
            publisher,
        )
    } else {
        InMemoryConsensus::new_follower(
            logger.clone(),
            ReplicaId::new(replica_id),
            Term::new(1),
            publisher,
        )
    });
    let storage = Arc::new(InMemoryStorage::create());

    let handle = replicore::try_start_group(GroupConfig {
        group_id: ReplicaGroupId::new(group),
        my_replica_id: ReplicaId::new(replica_id),
        initial_members: members
            .iter()
            .map(|id| ReplicaInfo::new(ReplicaId::new(*id), ReplicaRole::Voting))
            .collect(),
        consensus: consensus.clone(),
        storage: storage.clone(),
        consensus_events,
        logger,
        options: EngineOptions::default(),
    })
    .await?;

    Ok(Replica {
        handle,
        consensus,
        storage,
    })
}

fn token(id: u128) -> ProposalToken {
    ProposalToken::new(id)
}

fn put(key: &str, value: &str) -> Command {
    Command::Put {
        key: Bytes::from(key.to_string()),
        value: Bytes::from(value.to_string()),
    }
}

fn member_role(description: &GroupDescription, replica_id: &str) -> Option<ReplicaRole> {
    description
        .members
        .iter()
        .find(|member| member.replica_id == ReplicaId::new(replica_id))
        .map(|member| member.role)
}

async fn wait_for_cursor(handle: &Handle, index: Index, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let description = handle.describe().await.expect("Engine should be alive");
        if description.commit_cursor.map_or(false, |c| c >= index) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "Timeout waiting for cursor to reach {:?}",
            index
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "Timeout waiting for condition");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[allow(dead_code)]
fn create_root_logger_for_file(directory_prefix: String, replica_id: String) -> slog::Logger {
    let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let log_path = format!("{}/info_log_{}/{}_info.log", directory_prefix, replica_id, now);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)
        .unwrap();

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}

fn create_root_logger_for_stdout(replica_id: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("ReplicaId" => replica_id))
}
