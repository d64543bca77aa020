use bytes::Bytes;
use futures_util::stream;
use proptest::prelude::*;
use std::sync::Arc;
use turnstream::client::read_stream;
use turnstream::history_pruning::{total_chars, truncate};
use turnstream::store::{ConversationStore, MemoryStore};
use turnstream::types::{ChatMessage, NewSession, Role};
use turnstream::variants::VariantAllocator;

fn conversation(lengths: &[usize]) -> Vec<ChatMessage> {
    let mut turns = vec![ChatMessage::new(Role::System, "s".repeat(lengths[0]))];
    for (i, len) in lengths[1..].iter().enumerate() {
        let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
        turns.push(ChatMessage::new(role, "é".repeat(*len)));
    }
    turns
}

fn read_all(chunks: Vec<Vec<u8>>) -> String {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    rt.block_on(async {
        let s = stream::iter(chunks.into_iter().map(|c| Ok::<_, std::io::Error>(Bytes::from(c))));
        read_stream(s, |_, _| {}).await.unwrap()
    })
}

fn frame(delta: &str) -> String {
    format!("data: {}\n\n", serde_json::json!({ "content": delta }))
}

proptest! {
    #[test]
    fn truncation_keeps_system_and_last_and_drops_oldest_first(
        lengths in prop::collection::vec(0usize..200, 1..12),
        limit in 0usize..1500,
    ) {
        let turns = conversation(&lengths);
        let out = truncate(&turns, limit);

        prop_assert_eq!(out.turns.len() + out.removed_count, turns.len());
        prop_assert_eq!(out.was_truncated, out.removed_count > 0);
        prop_assert_eq!(&out.turns[0], &turns[0]);
        prop_assert_eq!(out.turns.last(), turns.last());
        // What remains after the system turn is a suffix of the original.
        prop_assert_eq!(&out.turns[1..], &turns[1 + out.removed_count..]);

        if turns.len() > 2 {
            let fits = total_chars(&out.turns) <= limit;
            let floor = out.turns.len() == 2;
            prop_assert!(fits || floor);
            // Nothing was removed that did not need to be.
            if out.removed_count > 0 {
                let one_less = total_chars(&turns[..1])
                    + total_chars(&turns[out.removed_count..]);
                prop_assert!(one_less > limit);
            }
        } else {
            prop_assert!(!out.was_truncated);
        }
    }

    #[test]
    fn consumer_is_indifferent_to_chunk_boundaries(
        deltas in prop::collection::vec("[a-zé✓ ]{0,8}", 0..10),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..6),
    ) {
        let wire: Vec<u8> = deltas
            .iter()
            .map(|d| frame(d))
            .chain(std::iter::once("data: [DONE]\n\n".to_string()))
            .collect::<String>()
            .into_bytes();

        let mut points: Vec<usize> = cuts.iter().map(|i| i.index(wire.len() + 1)).collect();
        points.sort_unstable();
        points.dedup();
        let mut chunks = Vec::new();
        let mut start = 0;
        for p in points {
            chunks.push(wire[start..p].to_vec());
            start = p;
        }
        chunks.push(wire[start..].to_vec());

        prop_assert_eq!(read_all(chunks), deltas.concat());
    }

    #[test]
    fn consumer_ignores_everything_after_done(
        before in prop::collection::vec("[a-z]{1,5}", 0..5),
        after in prop::collection::vec("[a-z]{1,5}", 1..5),
    ) {
        let mut wire = String::new();
        for d in &before {
            wire.push_str(&frame(d));
        }
        wire.push_str("data: [DONE]\n\n");
        for d in &after {
            wire.push_str(&frame(d));
        }
        prop_assert_eq!(read_all(vec![wire.into_bytes()]), before.concat());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn allocator_versions_are_unique_and_dense(writers in 1usize..7) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let versions = rt.block_on(async move {
            let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::with_interleaving());
            let session = store.create_session(NewSession::default()).await.unwrap();
            let parent = store
                .create_turn(&session.id, Role::Assistant, "a")
                .await
                .unwrap();
            let allocator = Arc::new(VariantAllocator::with_attempts(store.clone(), 32));

            let tasks: Vec<_> = (0..writers)
                .map(|_| {
                    let allocator = allocator.clone();
                    let parent = parent.id.clone();
                    tokio::spawn(async move { allocator.allocate_and_create(&parent, "v").await })
                })
                .collect();
            let mut versions = Vec::new();
            for t in tasks {
                versions.push(t.await.unwrap().unwrap().version);
            }
            versions.sort_unstable();
            versions
        });
        let expected: Vec<u32> = (1..=writers as u32).collect();
        prop_assert_eq!(versions, expected);
    }
}
