use crate::consensus::{EntryId, EntryKind};
use crate::engine::engine_api::ProposalToken;
use crate::engine::membership::{AppliedConfig, ConfigRecord, MembershipController};
use crate::storage::{StorageEngine, StorageError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;

/// The replicated command vocabulary. Every replica decodes the same payload into the
/// same command and applies it against the same storage state, so all replicas
/// converge; nothing here may consult a clock or anything outside (entry, storage).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    Put { key: Bytes, value: Bytes },
    Delete { key: Bytes },
}

/// Byte representation of a Data-kind entry payload:
///
/// ```text
///                                           1                   2
/// | 0 | 1 | 2 | 3 | 4 |  ...  | 6 | 7 | 8 | 1 | 2 | 3 | 4 | 5 | 2 | ... |
/// +---+---+---+---+---+--...--+---+---+---+---+---+---+---+---+---+-...-+
/// |Vrs|Tag|       Token (16 bytes)        |KeyLen (4 bytes)| Key | Val  |
/// +---+---+-------------------------------+----------------+-----+-...--+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Tag` - 1 = Put (KeyLen, Key, then Value as the remainder),
///           2 = Delete (the remainder is the Key, no KeyLen)
/// * `Token` - the client's idempotency token, replicated so every replica
///   deduplicates identically
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DataRecord {
    pub(crate) token: ProposalToken,
    pub(crate) command: Command,
}

const DATA_RECORD_FORMAT_VERSION: u8 = 1;

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;

impl DataRecord {
    pub(crate) fn encode(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(2 + 16 + 4 + self.encoded_fields_len());

        bytes.put_u8(DATA_RECORD_FORMAT_VERSION);
        match &self.command {
            Command::Put { key, value } => {
                bytes.put_u8(TAG_PUT);
                bytes.put_u128(self.token.as_u128());
                bytes.put_u32(key.len() as u32);
                bytes.put_slice(key);
                bytes.put_slice(value);
            }
            Command::Delete { key } => {
                bytes.put_u8(TAG_DELETE);
                bytes.put_u128(self.token.as_u128());
                bytes.put_slice(key);
            }
        }

        bytes.freeze()
    }

    pub(crate) fn decode(payload: &Bytes) -> Result<DataRecord, PayloadDecodeError> {
        let mut buf = payload.clone();
        if buf.remaining() < 2 + 16 {
            return Err(PayloadDecodeError::Truncated);
        }

        let version = buf.get_u8();
        if version != DATA_RECORD_FORMAT_VERSION {
            return Err(PayloadDecodeError::UnsupportedVersion(version));
        }

        let tag = buf.get_u8();
        let token = ProposalToken::new(buf.get_u128());

        let command = match tag {
            TAG_PUT => {
                if buf.remaining() < 4 {
                    return Err(PayloadDecodeError::Truncated);
                }
                let key_len = buf.get_u32() as usize;
                if buf.remaining() < key_len {
                    return Err(PayloadDecodeError::Truncated);
                }
                let key = buf.copy_to_bytes(key_len);
                if key.is_empty() {
                    return Err(PayloadDecodeError::MalformedField("key"));
                }
                let value = buf.copy_to_bytes(buf.remaining());
                Command::Put { key, value }
            }
            TAG_DELETE => {
                let key = buf.copy_to_bytes(buf.remaining());
                if key.is_empty() {
                    return Err(PayloadDecodeError::MalformedField("key"));
                }
                Command::Delete { key }
            }
            other => return Err(PayloadDecodeError::UnknownTag(other)),
        };

        Ok(DataRecord { token, command })
    }

    fn encoded_fields_len(&self) -> usize {
        match &self.command {
            Command::Put { key, value } => key.len() + value.len(),
            Command::Delete { key } => key.len(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadDecodeError {
    #[error("payload ends before its fixed-size fields")]
    Truncated,

    #[error("unsupported payload format version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown payload tag {0}")]
    UnknownTag(u8),

    #[error("malformed {0} field")]
    MalformedField(&'static str),
}

/// The token-keyed record of commands already applied. Part of the replicated state:
/// every replica derives the same table from the same committed sequence, and snapshots
/// carry it so an installing replica dedups exactly like one that replayed the log.
#[derive(Clone, Debug, Default)]
pub(crate) struct DedupState {
    applied: HashMap<ProposalToken, EntryId>,
}

impl DedupState {
    pub(crate) fn lookup(&self, token: &ProposalToken) -> Option<EntryId> {
        self.applied.get(token).copied()
    }

    fn record(&mut self, token: ProposalToken, id: EntryId) {
        self.applied.insert(token, id);
    }
}

#[derive(Debug)]
pub(crate) struct AppliedData {
    pub(crate) token: ProposalToken,
    pub(crate) previous: Option<Bytes>,
    pub(crate) deduplicated: bool,
}

#[derive(Debug)]
pub(crate) enum Applied {
    Data(AppliedData),
    Config(AppliedConfig),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ApplyFault {
    #[error("storage engine failed: {0}")]
    Storage(#[from] StorageError),

    #[error("committed payload could not be decoded: {0}")]
    Corrupted(PayloadDecodeError),
}

/// LogApplier deterministically maps one committed entry to storage engine operations.
/// Data entries become put/delete calls; Config entries are routed to the Membership
/// Controller and never touch the storage engine's data.
pub(crate) struct LogApplier<S: StorageEngine> {
    logger: slog::Logger,
    storage: Arc<S>,
    dedup: DedupState,
}

impl<S: StorageEngine> LogApplier<S> {
    pub(crate) fn new(logger: slog::Logger, storage: Arc<S>) -> Self {
        LogApplier {
            logger,
            storage,
            dedup: DedupState::default(),
        }
    }

    /// Where `token`'s command was applied, if it was.
    pub(crate) fn already_applied(&self, token: &ProposalToken) -> Option<EntryId> {
        self.dedup.lookup(token)
    }

    pub(crate) fn dedup_state(&self) -> DedupState {
        self.dedup.clone()
    }

    pub(crate) fn restore_dedup(&mut self, dedup: DedupState) {
        self.dedup = dedup;
    }

    /// Apply one committed entry. Caller (the engine) guarantees in-order, gapless
    /// invocation; a failure here is not locally recoverable and must halt the replica.
    pub(crate) fn apply(
        &mut self,
        id: EntryId,
        kind: EntryKind,
        payload: &Bytes,
        membership: &mut MembershipController,
    ) -> Result<Applied, ApplyFault> {
        let applied = match kind {
            EntryKind::Data => {
                let record = DataRecord::decode(payload).map_err(ApplyFault::Corrupted)?;
                if let Some(first_applied) = self.dedup.lookup(&record.token) {
                    slog::debug!(
                        self.logger,
                        "Entry {:?} carries token {:?} already applied at {:?}; no-op.",
                        id,
                        record.token,
                        first_applied,
                    );
                    Applied::Data(AppliedData {
                        token: record.token,
                        previous: None,
                        deduplicated: true,
                    })
                } else {
                    let previous = self.execute(record.command)?;
                    self.dedup.record(record.token, id);
                    Applied::Data(AppliedData {
                        token: record.token,
                        previous,
                        deduplicated: false,
                    })
                }
            }
            EntryKind::Config => {
                let record = ConfigRecord::decode(payload).map_err(ApplyFault::Corrupted)?;
                Applied::Config(membership.apply_config(id, record))
            }
        };

        // Same apply step as the data it covers; a snapshot can never capture data
        // without the watermark that vouches for it.
        self.storage.record_applied(id.index)?;

        Ok(applied)
    }

    fn execute(&self, command: Command) -> Result<Option<Bytes>, StorageError> {
        match command {
            Command::Put { key, value } => {
                let previous = self.storage.get(&key)?;
                self.storage.put(key, value)?;
                Ok(previous)
            }
            Command::Delete { key } => {
                let previous = self.storage.get(&key)?;
                self.storage.delete(&key)?;
                Ok(previous)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{Index, ReplicaId, Term};
    use crate::engine::membership::{MembershipView, ReplicaInfo, ReplicaRole};
    use crate::storage::InMemoryStorage;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn entry_id(term: u64, index: u64) -> EntryId {
        EntryId {
            term: Term::new(term),
            index: Index::new(index),
        }
    }

    fn membership() -> MembershipController {
        MembershipController::new(
            test_logger(),
            ReplicaId::new("r1"),
            MembershipView::new(vec![ReplicaInfo {
                replica_id: ReplicaId::new("r1"),
                role: ReplicaRole::Voting,
                last_known_index: None,
            }]),
        )
    }

    fn put_payload(token: u128, key: &str, value: &str) -> Bytes {
        DataRecord {
            token: ProposalToken::new(token),
            command: Command::Put {
                key: b(key),
                value: b(value),
            },
        }
        .encode()
    }

    #[test]
    fn data_record_codec() {
        let records = vec![
            DataRecord {
                token: ProposalToken::new(7),
                command: Command::Put {
                    key: b("some-key"),
                    value: b("some-value"),
                },
            },
            DataRecord {
                token: ProposalToken::new(u128::MAX),
                command: Command::Put {
                    key: b("k"),
                    value: Bytes::new(),
                },
            },
            DataRecord {
                token: ProposalToken::new(0),
                command: Command::Delete { key: b("some-key") },
            },
        ];

        for record in records {
            let decoded = DataRecord::decode(&record.encode()).unwrap();
            assert_eq!(record, decoded);
        }
    }

    #[test]
    fn data_record_decode_rejects_garbage() {
        assert!(DataRecord::decode(&Bytes::from_static(&[1, 1])).is_err());
        // Wrong version.
        let mut wrong_version = put_payload(1, "k", "v").to_vec();
        wrong_version[0] = 9;
        assert!(DataRecord::decode(&Bytes::from(wrong_version)).is_err());
        // Unknown tag.
        let mut unknown_tag = put_payload(1, "k", "v").to_vec();
        unknown_tag[1] = 9;
        assert!(DataRecord::decode(&Bytes::from(unknown_tag)).is_err());
        // Key length pointing past the end.
        let mut truncated = put_payload(1, "kkkk", "").to_vec();
        truncated.truncate(truncated.len() - 2);
        assert!(DataRecord::decode(&Bytes::from(truncated)).is_err());
    }

    #[test]
    fn replicas_applying_same_sequence_converge() {
        let sequence = vec![
            put_payload(1, "a", "1"),
            put_payload(2, "b", "2"),
            put_payload(3, "a", "3"),
            DataRecord {
                token: ProposalToken::new(4),
                command: Command::Delete { key: b("b") },
            }
            .encode(),
        ];

        let run = |storage: &Arc<InMemoryStorage>| {
            let mut applier = LogApplier::new(test_logger(), storage.clone());
            let mut m = membership();
            for (i, payload) in sequence.iter().enumerate() {
                applier
                    .apply(entry_id(1, (i + 1) as u64), EntryKind::Data, payload, &mut m)
                    .unwrap();
            }
        };

        let storage_a = Arc::new(InMemoryStorage::create());
        let storage_b = Arc::new(InMemoryStorage::create());
        run(&storage_a);
        run(&storage_b);

        for key in &[b"a".as_ref(), b"b".as_ref()] {
            assert_eq!(storage_a.get(key).unwrap(), storage_b.get(key).unwrap());
        }
        assert_eq!(storage_a.get(b"a").unwrap(), Some(b("3")));
        assert_eq!(storage_a.get(b"b").unwrap(), None);
        assert_eq!(
            storage_a.applied_watermark().unwrap(),
            Some(Index::new(4))
        );
    }

    #[test]
    fn duplicate_token_is_not_applied_twice() {
        let storage = Arc::new(InMemoryStorage::create());
        let mut applier = LogApplier::new(test_logger(), storage.clone());
        let mut m = membership();

        applier
            .apply(
                entry_id(1, 1),
                EntryKind::Data,
                &put_payload(42, "k", "first"),
                &mut m,
            )
            .unwrap();

        // Same token re-proposed by a retrying client, committed again at a new index.
        let applied = applier
            .apply(
                entry_id(2, 2),
                EntryKind::Data,
                &put_payload(42, "k", "second"),
                &mut m,
            )
            .unwrap();

        match applied {
            Applied::Data(data) => assert!(data.deduplicated),
            other => panic!("Expected data apply, got {:?}", other),
        }
        assert_eq!(storage.get(b"k").unwrap(), Some(b("first")));
        // The duplicate still advances the watermark; the entry occupies its index.
        assert_eq!(storage.applied_watermark().unwrap(), Some(Index::new(2)));
    }

    #[test]
    fn config_entries_do_not_touch_storage() {
        let storage = Arc::new(InMemoryStorage::create());
        let mut applier = LogApplier::new(test_logger(), storage.clone());
        let mut m = membership();

        let payload = ConfigRecord {
            change: crate::engine::membership::MemberChange::Add {
                replica_id: ReplicaId::new("r2"),
                role: ReplicaRole::Learner,
            },
        }
        .encode();

        applier
            .apply(entry_id(1, 1), EntryKind::Config, &payload, &mut m)
            .unwrap();

        assert_eq!(storage.len(), 0);
        assert!(m.view().contains(&ReplicaId::new("r2")));
        assert_eq!(storage.applied_watermark().unwrap(), Some(Index::new(1)));
    }

    #[test]
    fn storage_fault_surfaces_as_apply_fault() {
        let storage = Arc::new(InMemoryStorage::create());
        let mut applier = LogApplier::new(test_logger(), storage.clone());
        let mut m = membership();

        storage.fail_writes(true);
        let result = applier.apply(
            entry_id(1, 1),
            EntryKind::Data,
            &put_payload(1, "k", "v"),
            &mut m,
        );
        assert!(matches!(result, Err(ApplyFault::Storage(_))));
    }
}
