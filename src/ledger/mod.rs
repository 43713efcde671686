use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Key = String;
pub type TxId = [u8; 32];
pub type WriteSet = BTreeMap<Key, Vec<u8>>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("key must not be an empty string")]
    EmptyKey,
    #[error("range scan failed after {key}: {reason}")]
    ScanFailed { key: Key, reason: String },
    #[error("no more entries in range scan")]
    IteratorExhausted,
    #[error("range scan already closed")]
    IteratorClosed,
    #[error("value stored at {key} is not valid UTF-8")]
    NonUtf8Value { key: Key },
    #[error("snapshot state root mismatch: recorded {recorded}, computed {computed}")]
    CorruptSnapshot { recorded: String, computed: String },
}

/// One step of a range scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Key,
    pub value: Vec<u8>,
}

/// Ledger accessor handed to chaincode for the duration of one invocation.
///
/// `get_state` returns an empty vector when the key is absent; an absent key
/// is not an error.
pub trait ChaincodeStub {
    fn get_state(&self, key: &str) -> Result<Vec<u8>, LedgerError>;

    fn put_state(&mut self, key: &str, value: Vec<u8>) -> Result<(), LedgerError>;

    /// Scans `[start_key, end_key)` in key order. An empty `end_key` leaves
    /// the range unbounded above.
    fn get_state_by_range(
        &self,
        start_key: &str,
        end_key: &str,
    ) -> Result<Box<dyn StateQueryIterator + '_>, LedgerError>;
}

/// Host-side scan cursor. Callers must `close` it once done; the host keeps
/// scan state alive until then.
pub trait StateQueryIterator {
    fn has_next(&self) -> bool;

    fn next_entry(&mut self) -> Result<KeyValue, LedgerError>;

    fn close(&mut self) -> Result<(), LedgerError>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    pub height: u64,
    #[serde(default, with = "serde_digest::option")]
    pub last_tx_id: Option<TxId>,
}

/// Persisted form of the world state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub state: BTreeMap<Key, String>,
    #[serde(with = "serde_digest")]
    pub state_root: [u8; 32],
}

/// Committed key-value state of the channel.
#[derive(Debug, Default)]
pub struct WorldState {
    meta: SnapshotMetadata,
    entries: BTreeMap<Key, Vec<u8>>,
    open_scans: Arc<AtomicUsize>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn height(&self) -> u64 {
        self.meta.height
    }

    pub fn last_tx_id(&self) -> Option<TxId> {
        self.meta.last_tx_id
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Range scans opened against this state and not yet closed.
    pub fn open_scans(&self) -> usize {
        self.open_scans.load(Ordering::SeqCst)
    }

    pub fn state_root(&self) -> [u8; 32] {
        compute_state_root(&self.entries)
    }

    /// Commits a transaction's write set and advances the height.
    pub fn apply(&mut self, writes: WriteSet, tx_id: TxId) -> usize {
        let count = writes.len();
        self.entries.extend(writes);
        self.meta.height += 1;
        self.meta.last_tx_id = Some(tx_id);
        count
    }

    pub fn snapshot(&self) -> Result<LedgerSnapshot, LedgerError> {
        let mut state = BTreeMap::new();
        for (key, value) in &self.entries {
            let text = String::from_utf8(value.clone())
                .map_err(|_| LedgerError::NonUtf8Value { key: key.clone() })?;
            state.insert(key.clone(), text);
        }
        Ok(LedgerSnapshot {
            meta: self.meta.clone(),
            state,
            state_root: self.state_root(),
        })
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, LedgerError> {
        let entries: BTreeMap<Key, Vec<u8>> = snapshot
            .state
            .into_iter()
            .map(|(key, value)| (key, value.into_bytes()))
            .collect();
        let computed = compute_state_root(&entries);
        if computed != snapshot.state_root {
            return Err(LedgerError::CorruptSnapshot {
                recorded: hex::encode(snapshot.state_root),
                computed: hex::encode(computed),
            });
        }
        Ok(Self {
            meta: snapshot.meta,
            entries,
            open_scans: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn scan(&self, start_key: &str, end_key: &str) -> RangeScan {
        let upper = if end_key.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end_key)
        };
        let pending = if !end_key.is_empty() && start_key >= end_key {
            VecDeque::new()
        } else {
            self.entries
                .range::<str, _>((Bound::Included(start_key), upper))
                .map(|(key, value)| KeyValue {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect()
        };
        self.open_scans.fetch_add(1, Ordering::SeqCst);
        RangeScan {
            pending,
            open_scans: Arc::clone(&self.open_scans),
            closed: false,
        }
    }
}

/// Stub for one invocation: reads hit committed state, writes are buffered
/// until the host decides to commit.
pub struct TxContext<'a> {
    state: &'a WorldState,
    writes: WriteSet,
}

impl<'a> TxContext<'a> {
    pub fn new(state: &'a WorldState) -> Self {
        Self {
            state,
            writes: WriteSet::new(),
        }
    }

    pub fn write_set(&self) -> &WriteSet {
        &self.writes
    }

    pub fn into_write_set(self) -> WriteSet {
        self.writes
    }
}

impl ChaincodeStub for TxContext<'_> {
    fn get_state(&self, key: &str) -> Result<Vec<u8>, LedgerError> {
        Ok(self.state.get(key).map(<[u8]>::to_vec).unwrap_or_default())
    }

    fn put_state(&mut self, key: &str, value: Vec<u8>) -> Result<(), LedgerError> {
        if key.is_empty() {
            return Err(LedgerError::EmptyKey);
        }
        self.writes.insert(key.to_string(), value);
        Ok(())
    }

    fn get_state_by_range(
        &self,
        start_key: &str,
        end_key: &str,
    ) -> Result<Box<dyn StateQueryIterator + '_>, LedgerError> {
        Ok(Box::new(self.state.scan(start_key, end_key)))
    }
}

// Entries are copied out when the scan opens, so later writes never show up.
struct RangeScan {
    pending: VecDeque<KeyValue>,
    open_scans: Arc<AtomicUsize>,
    closed: bool,
}

impl StateQueryIterator for RangeScan {
    fn has_next(&self) -> bool {
        !self.closed && !self.pending.is_empty()
    }

    fn next_entry(&mut self) -> Result<KeyValue, LedgerError> {
        if self.closed {
            return Err(LedgerError::IteratorClosed);
        }
        self.pending
            .pop_front()
            .ok_or(LedgerError::IteratorExhausted)
    }

    fn close(&mut self) -> Result<(), LedgerError> {
        if !self.closed {
            self.closed = true;
            self.pending.clear();
            self.open_scans.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn compute_state_root(entries: &BTreeMap<Key, Vec<u8>>) -> [u8; 32] {
    let leaves: Vec<[u8; 32]> = entries
        .iter()
        .map(|(key, value)| {
            let mut hasher = Sha256::new();
            hasher.update(b"kv");
            hasher.update((key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            hasher.update(value);
            let leaf: [u8; 32] = hasher.finalize().into();
            leaf
        })
        .collect();
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"fabhouse-empty-state").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            if chunk.len() == 2 {
                hasher.update(chunk[1]);
            } else {
                hasher.update(chunk[0]);
            }
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

/// Hex (de)serialization for 32-byte digests.
pub(crate) mod serde_digest {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        decode(&encoded).map_err(D::Error::custom)
    }

    fn decode(encoded: &str) -> Result<[u8; 32], String> {
        let bytes = hex::decode(encoded).map_err(|e| e.to_string())?;
        <[u8; 32]>::try_from(bytes.as_slice())
            .map_err(|_| format!("expected 32-byte digest, got {} bytes", bytes.len()))
    }

    pub mod option {
        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(value: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(digest) => serializer.serialize_some(&hex::encode(digest)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|encoded| super::decode(&encoded).map_err(D::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(keys: &[&str]) -> WorldState {
        let mut state = WorldState::new();
        let writes = keys
            .iter()
            .map(|k| (k.to_string(), format!("\"{k}\"").into_bytes()))
            .collect();
        state.apply(writes, [7u8; 32]);
        state
    }

    fn drain(iter: &mut dyn StateQueryIterator) -> Vec<String> {
        let mut keys = Vec::new();
        while iter.has_next() {
            keys.push(iter.next_entry().unwrap().key);
        }
        keys
    }

    #[test]
    fn range_scan_is_half_open_and_lexicographic() {
        let state = state_with(&["HOUSE0", "HOUSE10", "HOUSE2", "HOUSE999", "HOUSE1000", "CAR1"]);
        let ctx = TxContext::new(&state);
        let mut iter = ctx.get_state_by_range("HOUSE0", "HOUSE999").unwrap();
        assert_eq!(
            drain(iter.as_mut()),
            vec!["HOUSE0", "HOUSE10", "HOUSE1000", "HOUSE2"]
        );
        iter.close().unwrap();
    }

    #[test]
    fn empty_end_key_is_unbounded_and_inverted_range_is_empty() {
        let state = state_with(&["A", "B", "C"]);
        let ctx = TxContext::new(&state);

        let mut open = ctx.get_state_by_range("B", "").unwrap();
        assert_eq!(drain(open.as_mut()), vec!["B", "C"]);
        open.close().unwrap();

        let mut inverted = ctx.get_state_by_range("C", "A").unwrap();
        assert!(!inverted.has_next());
        inverted.close().unwrap();
    }

    #[test]
    fn open_scans_are_counted_until_closed() {
        let state = state_with(&["A"]);
        let ctx = TxContext::new(&state);
        let mut first = ctx.get_state_by_range("", "").unwrap();
        let mut second = ctx.get_state_by_range("", "").unwrap();
        assert_eq!(state.open_scans(), 2);
        first.close().unwrap();
        first.close().unwrap();
        assert_eq!(state.open_scans(), 1);
        second.close().unwrap();
        assert_eq!(state.open_scans(), 0);
        assert!(matches!(
            second.next_entry(),
            Err(LedgerError::IteratorClosed)
        ));
    }

    #[test]
    fn writes_are_buffered_until_applied() {
        let mut state = WorldState::new();
        let writes = {
            let mut ctx = TxContext::new(&state);
            ctx.put_state("HOUSE1", b"{}".to_vec()).unwrap();
            assert!(ctx.get_state("HOUSE1").unwrap().is_empty());
            ctx.into_write_set()
        };
        assert!(state.is_empty());
        assert_eq!(state.apply(writes, [1u8; 32]), 1);
        assert_eq!(state.get("HOUSE1"), Some(&b"{}"[..]));
        assert_eq!(state.height(), 1);
        assert_eq!(state.last_tx_id(), Some([1u8; 32]));
    }

    #[test]
    fn empty_key_is_rejected() {
        let state = WorldState::new();
        let mut ctx = TxContext::new(&state);
        assert!(matches!(
            ctx.put_state("", b"x".to_vec()),
            Err(LedgerError::EmptyKey)
        ));
        assert!(ctx.write_set().is_empty());
    }

    #[test]
    fn state_root_ignores_insertion_order() {
        let a = state_with(&["HOUSE0", "HOUSE1", "HOUSE2"]);
        let b = state_with(&["HOUSE2", "HOUSE0", "HOUSE1"]);
        assert_eq!(a.state_root(), b.state_root());
        assert_ne!(a.state_root(), WorldState::new().state_root());
    }

    #[test]
    fn tampered_snapshot_is_rejected() {
        let state = state_with(&["HOUSE0", "HOUSE1"]);
        let mut snapshot = state.snapshot().unwrap();
        let restored = WorldState::from_snapshot(snapshot.clone()).unwrap();
        assert_eq!(restored.height(), 1);
        assert_eq!(restored.state_root(), state.state_root());

        snapshot
            .state
            .insert("HOUSE1".into(), r#"{"owner":"Mallory"}"#.into());
        match WorldState::from_snapshot(snapshot) {
            Err(LedgerError::CorruptSnapshot { recorded, computed }) => {
                assert_eq!(recorded, hex::encode(state.state_root()));
                assert_ne!(recorded, computed);
            }
            other => panic!("expected corrupt snapshot, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_digests_serialize_as_hex() {
        let state = state_with(&["HOUSE0"]);
        let snapshot = state.snapshot().unwrap();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state_root"], hex::encode(state.state_root()));
        assert_eq!(json["meta"]["last_tx_id"], hex::encode([7u8; 32]));
        let parsed: LedgerSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
