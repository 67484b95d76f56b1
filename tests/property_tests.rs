//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use repmgr::ack::{evaluate, quorum, AckGroup, AckPolicy, AckTracker};
use repmgr::election::{tally, Candidate};
use repmgr::wire::{FrameCodec, Message};
use repmgr::{Eid, SiteAddr, SELF_EID};
use std::collections::BTreeSet;
use tokio_util::codec::Decoder;

fn eids(n: usize) -> BTreeSet<Eid> {
    (1..=n as u32).map(Eid).collect()
}

fn connected_group(n: usize) -> AckGroup {
    AckGroup {
        connected: eids(n),
        electable: eids(n),
        total_electable: n,
        ..Default::default()
    }
}

fn message_strategy() -> impl Strategy<Value = Message> {
    prop_oneof![
        ("[a-z0-9.-]{1,40}", any::<u16>(), any::<u32>())
            .prop_map(|(host, port, priority)| Message::Handshake { host, port, priority }),
        any::<u64>().prop_map(|term| Message::Heartbeat { term }),
        Just(Message::MasterQuery),
        (any::<u64>(), any::<u32>()).prop_map(|(term, priority)| Message::VoteRequest { term, priority }),
        (any::<u64>(), any::<u32>()).prop_map(|(term, priority)| Message::VoteReply { term, priority }),
        (any::<u64>(), any::<u32>()).prop_map(|(term, priority)| Message::NewMaster { term, priority }),
        (any::<u64>(), any::<bool>(), prop::collection::vec(any::<u8>(), 0..512)).prop_map(
            |(lsn, needs_ack, payload)| Message::Log {
                lsn,
                needs_ack,
                payload: Bytes::from(payload),
            }
        ),
        any::<u64>().prop_map(|lsn| Message::Ack { lsn }),
    ]
}

// =============================================================================
// Ack Policy Properties
// =============================================================================

proptest! {
    /// ALL is never satisfied while any connected site is missing.
    #[test]
    fn all_policy_needs_every_connected_site(n in 1usize..16, missing in 0usize..16) {
        let missing = missing % n;
        let group = connected_group(n);
        let mut acked = eids(n);
        prop_assert!(evaluate(AckPolicy::All, &acked, &group));

        acked.remove(&Eid(missing as u32 + 1));
        prop_assert!(!evaluate(AckPolicy::All, &acked, &group));
    }

    /// QUORUM flips exactly at floor(n/2)+1 acks.
    #[test]
    fn quorum_threshold_is_majority(n in 1usize..32, acks in 0usize..32) {
        let acks = acks.min(n);
        let group = connected_group(n);
        let acked = eids(acks);
        prop_assert_eq!(evaluate(AckPolicy::Quorum, &acked, &group), acks >= n / 2 + 1);
        prop_assert!(quorum(n) * 2 > n);
        prop_assert!((quorum(n) - 1) * 2 <= n);
    }

    /// Acks from sites that cannot be elected never count toward QUORUM.
    #[test]
    fn quorum_ignores_unelectable_acks(electable in 1usize..10, others in 1usize..10) {
        let mut group = connected_group(electable);
        let unelectable: BTreeSet<Eid> = (100..100 + others as u32).map(Eid).collect();
        group.connected.extend(unelectable.iter().copied());

        let mut acked = unelectable.clone();
        acked.extend(eids(quorum(electable) - 1));
        prop_assert!(!evaluate(AckPolicy::Quorum, &acked, &group));

        acked.insert(Eid(quorum(electable) as u32));
        prop_assert!(evaluate(AckPolicy::Quorum, &acked, &group));
    }

    /// NONE holds for any ack set; ONE holds exactly when a remote site acked.
    #[test]
    fn none_and_one(n in 0usize..8) {
        let group = connected_group(n.max(1));
        let acked = eids(n);
        prop_assert!(evaluate(AckPolicy::None, &acked, &group));
        prop_assert_eq!(evaluate(AckPolicy::One, &acked, &group), n > 0);

        let only_self: BTreeSet<Eid> = [SELF_EID].into_iter().collect();
        prop_assert!(!evaluate(AckPolicy::One, &only_self, &group));
    }

    /// Acks are monotonic: once satisfied, more acks keep it satisfied.
    #[test]
    fn more_acks_never_unsatisfy(n in 1usize..10, first in 0usize..10, policy_id in 1u32..=6) {
        let policy = AckPolicy::try_from(policy_id).unwrap();
        let mut tracker = AckTracker::new();
        let mut group = connected_group(n);
        group.peers = eids(1);
        group.peer_eid = Some(Eid(1));
        tracker.register(7, group, false).unwrap();

        let mut was_satisfied = false;
        for (i, eid) in eids(n).into_iter().enumerate() {
            if i < first.min(n) {
                continue;
            }
            tracker.record_ack(7, eid);
            let now = tracker.is_satisfied(7, policy).unwrap();
            prop_assert!(!was_satisfied || now);
            was_satisfied = now;
        }
    }
}

#[test]
fn quorum_of_five() {
    let group = connected_group(5);
    assert!(evaluate(AckPolicy::Quorum, &eids(3), &group));
    assert!(!evaluate(AckPolicy::Quorum, &eids(2), &group));
}

// =============================================================================
// Election Properties
// =============================================================================

proptest! {
    /// The tally does not depend on reply order.
    #[test]
    fn tally_is_order_independent(
        candidates in prop::collection::btree_map(1u32..1000, (0u64..4, 0u32..4), 1..12),
        rotate in 0usize..12,
    ) {
        let mut list: Vec<Candidate> = candidates
            .into_iter()
            .map(|(eid, (term, priority))| Candidate { eid: Eid(eid), term, priority })
            .collect();
        let expected = tally(list.clone());
        let len = list.len();
        list.rotate_left(rotate % len);
        prop_assert_eq!(tally(list.clone()), expected);
        list.reverse();
        prop_assert_eq!(tally(list), expected);
    }

    /// Equal term and priority: the highest EID wins.
    #[test]
    fn tally_tie_breaks_on_highest_eid(
        eid_set in prop::collection::btree_set(1u32..100_000, 2..8),
        term in any::<u64>(),
        priority in 1u32..u32::MAX,
    ) {
        let candidates: Vec<Candidate> = eid_set
            .iter()
            .map(|eid| Candidate { eid: Eid(*eid), term, priority })
            .collect();
        let highest = *eid_set.iter().max().unwrap();
        prop_assert_eq!(tally(candidates).unwrap().eid, Eid(highest));
    }

    /// Zero-priority sites never win.
    #[test]
    fn tally_never_picks_zero_priority(
        candidates in prop::collection::vec((1u32..1000, any::<u64>(), 0u32..3), 1..10),
    ) {
        let list: Vec<Candidate> = candidates
            .into_iter()
            .map(|(eid, term, priority)| Candidate { eid: Eid(eid), term, priority })
            .collect();
        if let Some(winner) = tally(list) {
            prop_assert!(winner.priority > 0);
        }
    }
}

// =============================================================================
// Address Properties
// =============================================================================

proptest! {
    /// Derived EIDs never collide with the local marker.
    #[test]
    fn derived_eid_is_never_self(host in "[a-z0-9.]{1,30}", port in any::<u16>()) {
        let addr = SiteAddr::new(&host, port).unwrap();
        prop_assert_ne!(addr.derived_eid(), SELF_EID);
        prop_assert_eq!(addr.derived_eid(), SiteAddr::new(&host.to_uppercase(), port).unwrap().derived_eid());
    }
}

// =============================================================================
// Frame Codec Properties
// =============================================================================

proptest! {
    /// Feeding a frame stream in arbitrary chunks yields the same messages.
    #[test]
    fn codec_resumes_partial_reads(
        messages in prop::collection::vec(message_strategy(), 1..8),
        chunk in 1usize..64,
    ) {
        let wire: Vec<u8> = messages.iter().flat_map(|m| m.to_frame().to_vec()).collect();
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();

        for piece in wire.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(msg) = codec.decode(&mut buf).unwrap() {
                decoded.push(msg);
            }
        }

        prop_assert!(buf.is_empty());
        prop_assert_eq!(decoded, messages);
    }

    /// Arbitrary bytes never panic the decoder.
    #[test]
    fn codec_survives_garbage(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::from(&data[..]);
        while let Ok(Some(_)) = codec.decode(&mut buf) {}
    }
}
