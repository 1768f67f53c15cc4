use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::envelope::Fragment;
use crate::error::ProtoError;

const COMPLETED_CAPACITY: usize = 1024;

/// Splits `data` into chunks of at most `size` characters, never cutting a
/// UTF-8 code point. An empty input yields a single empty chunk.
pub fn split_chunks(data: &str, size: usize) -> Vec<&str> {
    let size = size.max(1);
    if data.is_empty() {
        return vec![data];
    }

    let mut chunks = Vec::with_capacity(data.len() / size + 1);
    let mut start = 0;
    let mut chars = 0;
    for (offset, _) in data.char_indices() {
        if chars == size {
            chunks.push(&data[start..offset]);
            start = offset;
            chars = 0;
        }
        chars += 1;
    }
    chunks.push(&data[start..]);
    chunks
}

/// Fragments a serialized envelope under a fresh message id.
pub fn encode_fragments(data: &str, chunk_size: usize) -> Vec<Fragment> {
    let id = uuid::Uuid::new_v4().to_string();
    let chunks = split_chunks(data, chunk_size);
    let count = chunks.len() as u32;
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| Fragment {
            id: id.clone(),
            index: index as u32,
            count,
            data: chunk.to_string(),
        })
        .collect()
}

/// Buffers fragments per message id until every index has arrived.
///
/// Duplicate `(id, index)` pairs overwrite each other. Once a message
/// completes its buffer is dropped and the id is remembered for a while, so a
/// late redelivery of the same message is ignored instead of starting a new
/// buffer.
pub struct Reassembler {
    pending: HashMap<String, BTreeMap<u32, String>>,
    completed: LruCache<String, ()>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_capacity(COMPLETED_CAPACITY)
    }

    pub fn with_capacity(completed: usize) -> Self {
        let capacity = NonZeroUsize::new(completed).unwrap_or(NonZeroUsize::MIN);
        Self {
            pending: HashMap::new(),
            completed: LruCache::new(capacity),
        }
    }

    /// Adds a fragment, returning the full payload when this fragment
    /// completes its message.
    pub fn push(&mut self, fragment: Fragment) -> Result<Option<String>, ProtoError> {
        let Fragment {
            id,
            index,
            count,
            data,
        } = fragment;

        if count == 0 {
            return Err(ProtoError::EmptyFragmentCount { id });
        }
        if index >= count {
            return Err(ProtoError::FragmentOutOfRange { id, index, count });
        }
        if self.completed.contains(&id) {
            return Ok(None);
        }

        let parts = self.pending.entry(id.clone()).or_default();
        parts.insert(index, data);
        if parts.len() < count as usize {
            return Ok(None);
        }

        let parts = self.pending.remove(&id).unwrap_or_default();
        self.completed.put(id, ());
        Ok(Some(parts.into_values().collect()))
    }

    /// Number of messages with fragments still outstanding.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CHUNK_SIZE, Envelope};
    use proptest::prelude::*;
    use serde_json::{Map, json};

    fn reassemble(fragments: Vec<Fragment>) -> Option<String> {
        let mut reassembler = Reassembler::new();
        let mut out = None;
        for fragment in fragments {
            if let Some(done) = reassembler.push(fragment).unwrap() {
                assert!(out.is_none(), "message completed twice");
                out = Some(done);
            }
        }
        assert_eq!(reassembler.pending_len(), 0);
        out
    }

    #[test]
    fn greet_envelope_splits_into_three_fragments() {
        let padding = "x".repeat(120_000);
        let mut properties = Map::new();
        properties.insert("msg".to_string(), json!("hi"));
        properties.insert("padding".to_string(), json!(padding));
        let envelope = Envelope::new("greet", "src", properties);
        let json = envelope.to_json().unwrap();
        assert!(json.len() > 100_000 && json.len() <= 150_000);

        let fragments = encode_fragments(&json, CHUNK_SIZE);

        assert_eq!(fragments.len(), 3);
        for (i, fragment) in fragments.iter().enumerate() {
            assert_eq!(fragment.index, i as u32);
            assert_eq!(fragment.count, 3);
            assert_eq!(fragment.id, fragments[0].id);
            assert!(fragment.data.chars().count() <= CHUNK_SIZE);
        }

        let joined = reassemble(fragments).unwrap();
        assert_eq!(Envelope::from_json(&joined).unwrap(), envelope);
    }

    #[test]
    fn split_never_cuts_multibyte_characters() {
        let data = "héllo wörld ✓✓";
        let chunks = split_chunks(data, 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 3));
        assert_eq!(chunks.concat(), data);
    }

    #[test]
    fn empty_payload_is_one_empty_fragment() {
        let fragments = encode_fragments("", CHUNK_SIZE);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].count, 1);
        assert_eq!(reassemble(fragments).unwrap(), "");
    }

    #[test]
    fn duplicate_index_overwrites_without_completing_early() {
        let mut fragments = encode_fragments("abcdef", 2);
        let dup = fragments[0].clone();
        fragments.insert(1, dup);

        let mut reassembler = Reassembler::new();
        let results: Vec<_> = fragments
            .into_iter()
            .map(|f| reassembler.push(f).unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(results.last().unwrap().as_deref(), Some("abcdef"));
    }

    #[test]
    fn redelivery_after_completion_is_ignored() {
        let fragments = encode_fragments("payload", CHUNK_SIZE);
        let mut reassembler = Reassembler::new();

        assert!(reassembler.push(fragments[0].clone()).unwrap().is_some());
        assert!(reassembler.push(fragments[0].clone()).unwrap().is_none());
        assert_eq!(reassembler.pending_len(), 0);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut reassembler = Reassembler::new();
        let err = reassembler
            .push(Fragment {
                id: "m".to_string(),
                index: 2,
                count: 2,
                data: String::new(),
            })
            .unwrap_err();
        assert!(matches!(err, ProtoError::FragmentOutOfRange { .. }));
        assert_eq!(reassembler.pending_len(), 0);
    }

    #[test]
    fn zero_count_is_rejected() {
        let mut reassembler = Reassembler::new();
        let err = reassembler
            .push(Fragment {
                id: "m".to_string(),
                index: 0,
                count: 0,
                data: String::new(),
            })
            .unwrap_err();
        assert!(matches!(err, ProtoError::EmptyFragmentCount { .. }));
    }

    #[test]
    fn interleaved_messages_complete_independently() {
        let a = encode_fragments("aaaaaa", 2);
        let b = encode_fragments("bbbb", 2);
        let mut reassembler = Reassembler::new();

        assert!(reassembler.push(a[0].clone()).unwrap().is_none());
        assert!(reassembler.push(b[1].clone()).unwrap().is_none());
        assert!(reassembler.push(a[2].clone()).unwrap().is_none());
        assert_eq!(reassembler.pending_len(), 2);
        assert_eq!(
            reassembler.push(b[0].clone()).unwrap().as_deref(),
            Some("bbbb")
        );
        assert_eq!(
            reassembler.push(a[1].clone()).unwrap().as_deref(),
            Some("aaaaaa")
        );
        assert_eq!(reassembler.pending_len(), 0);
    }

    fn arb_envelope() -> impl Strategy<Value = Envelope> {
        (
            "[a-z.]{1,20}",
            "[0-9a-f]{0,32}",
            prop::collection::btree_map("[a-zA-Z]{1,8}", "\\PC{0,40}", 0..6),
        )
            .prop_map(|(kind, source_id, props)| {
                let properties = props
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect();
                Envelope::new(kind, source_id, properties)
            })
    }

    proptest! {
        #[test]
        fn fragments_reassemble_in_any_order(
            (envelope, chunk_size, order) in arb_envelope().prop_flat_map(|envelope| {
                let len = envelope.to_json().map(|j| j.chars().count()).unwrap_or(1);
                (Just(envelope), 1..=len + 1).prop_flat_map(move |(envelope, chunk_size)| {
                    let json = envelope.to_json().unwrap_or_default();
                    let count = split_chunks(&json, chunk_size).len();
                    let order: Vec<usize> = (0..count).collect();
                    (Just(envelope), Just(chunk_size), Just(order).prop_shuffle())
                })
            })
        ) {
            let json = envelope.to_json().unwrap();
            let fragments = encode_fragments(&json, chunk_size);
            prop_assert_eq!(fragments.len(), order.len());

            let shuffled: Vec<Fragment> = order.iter().map(|&i| fragments[i].clone()).collect();
            let joined = reassemble(shuffled).unwrap();
            prop_assert_eq!(Envelope::from_json(&joined).unwrap(), envelope);
        }

        #[test]
        fn chunks_respect_size_and_concatenate_back(data in "\\PC{0,300}", size in 1usize..64) {
            let chunks = split_chunks(&data, size);
            prop_assert!(chunks.iter().all(|c| c.chars().count() <= size));
            prop_assert_eq!(chunks.concat(), data);
        }
    }
}
