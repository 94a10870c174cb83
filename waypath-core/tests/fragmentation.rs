mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use common::{Net, Packet, Verdict};
use proptest::prelude::*;
use uuid::Uuid;
use waypath_core::protocol::{CoreData, FragmentBox};
use waypath_core::{encode_frame, stats, Characteristics, Message, TransportConfig};

fn payload(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i * 31 % 251) as u8).collect()
}

/// A fragment of `whole` as a peer would put it on the wire.
fn fragment(msg_uuid: u128, whole: &[u8], range: std::ops::Range<usize>) -> Vec<u8> {
    encode_frame(&Message::Fragment(FragmentBox {
        ack_uuid: Uuid::nil(),
        msg_uuid: Uuid::from_u128(msg_uuid),
        frag_off: range.start as u32,
        msg_size: whole.len() as u32,
        payload: whole[range].to_vec(),
    }))
    .unwrap()
}

#[test]
fn large_message_completes_only_after_the_last_ack() {
    let mut net = Net::new(2, Characteristics::Unreliable);
    net.connect(0, 1, 1200);
    let msg = payload(10_000);

    let sizes = Rc::new(RefCell::new(Vec::new()));
    let seen = sizes.clone();
    net.intercept = Some(Box::new(move |p: &Packet| {
        match p.message() {
            Some(Message::Fragment(_)) if p.from == 0 => seen.borrow_mut().push(p.bytes.len()),
            Some(Message::ReliabilityAck(_)) if p.from == 1 => return Verdict::Hold,
            _ => {}
        }
        Verdict::Deliver
    }));
    net.send(0, 1, msg.clone());
    net.settle();

    let sizes = sizes.borrow().clone();
    assert!(sizes.len() >= 9, "{} fragments", sizes.len());
    assert!(sizes.iter().all(|s| *s <= 1200));
    let id0 = net.id(0);
    assert_eq!(net.nodes[1].delivered, vec![(id0, msg)]);
    assert!(net.nodes[0].send_ok.is_empty());
    assert!(!net.held.is_empty());

    net.intercept = None;
    let last = net.held.pop().unwrap();
    net.release_held();
    assert!(net.nodes[0].send_ok.is_empty());
    assert_eq!(net.nodes[0].core.pending_messages(&net.id(1)), 1);

    net.held.push(last);
    net.release_held();
    let id1 = net.id(1);
    assert_eq!(net.nodes[0].send_ok, vec![(id1, true, 10_000)]);
    assert_eq!(net.nodes[0].core.pending_messages(&id1), 0);
}

#[test]
fn reliable_communicator_needs_no_acks() {
    let mut net = Net::new(2, Characteristics::Reliable);
    net.connect(0, 1, 1200);
    let msg = payload(5_000);
    net.send(0, 1, msg.clone());
    net.settle();

    let (id0, id1) = (net.id(0), net.id(1));
    assert_eq!(net.nodes[1].delivered, vec![(id0, msg)]);
    assert_eq!(net.nodes[0].send_ok, vec![(id1, true, 5_000)]);
    assert_eq!(net.nodes[1].core.statistics().get(stats::ACKS_SENT), 0);
    assert!(net.nodes[1].core.statistics().get(stats::FRAGMENTS_RECEIVED) >= 5);
}

#[test]
fn lost_fragments_are_retransmitted() {
    let mut net = Net::new(2, Characteristics::Unreliable);
    net.connect(0, 1, 1200);
    let mut dropped = 0;
    net.intercept = Some(Box::new(move |p: &Packet| {
        if p.from == 0 && dropped < 2 && matches!(p.message(), Some(Message::Fragment(_))) {
            dropped += 1;
            return Verdict::Drop;
        }
        Verdict::Deliver
    }));
    let msg = payload(6_000);
    net.send(0, 1, msg.clone());
    net.settle();
    assert!(net.nodes[1].delivered.is_empty());

    net.run_for(Duration::from_secs(30));
    let (id0, id1) = (net.id(0), net.id(1));
    assert_eq!(net.nodes[1].delivered, vec![(id0, msg)]);
    assert_eq!(net.nodes[0].send_ok, vec![(id1, true, 6_000)]);
    assert!(net.nodes[0].core.statistics().get(stats::RETRANSMISSIONS) >= 2);
}

#[test]
fn small_messages_are_not_fragmented() {
    let mut net = Net::new(2, Characteristics::Unreliable);
    net.connect(0, 1, 1200);
    net.send(0, 1, payload(300));
    net.settle();
    assert_eq!(net.nodes[1].core.statistics().get(stats::FRAGMENTS_RECEIVED), 0);
    assert_eq!(net.nodes[1].delivered.len(), 1);
    assert_eq!(net.nodes[1].core.statistics().get(stats::ACKS_SENT), 1);
}

#[test]
fn oversized_messages_are_refused() {
    let mut net = Net::new(2, Characteristics::Unreliable);
    net.connect(0, 1, 1200);
    let id1 = net.id(1);
    net.send(0, 1, payload(70_000));
    net.settle();
    assert_eq!(net.nodes[0].send_ok, vec![(id1, false, 70_000)]);

    let whole = vec![0u8; 1 << 20];
    net.inject(0, 1, fragment(7, &whole, 0..1000));
    net.settle();
    let st = net.nodes[1].core.statistics();
    assert_eq!(st.get(stats::FRAGMENTS_TOO_LARGE), 1);
    assert_eq!(st.get(stats::FRAGMENTS_BAD_RANGE), 0);
    assert!(net.nodes[1].delivered.is_empty());
}

#[test]
fn oldest_reassembly_gives_way() {
    let config = TransportConfig {
        max_reassembly_per_peer: 2,
        ..TransportConfig::default()
    };
    let mut net = Net::with_config(2, Characteristics::Unreliable, config);
    net.connect(0, 1, 1200);
    let msg = payload(600);
    let whole = encode_frame(&Message::CoreData(CoreData { payload: msg.clone() })).unwrap();
    let half = whole.len() / 2;

    for id in [1, 2, 3] {
        net.inject(0, 1, fragment(id, &whole, 0..half));
        net.run_for(Duration::from_millis(1));
    }
    assert_eq!(net.nodes[1].core.statistics().get(stats::REASSEMBLY_EVICTED), 1);

    // message 1 starts over and pushes out message 2
    net.inject(0, 1, fragment(1, &whole, half..whole.len()));
    net.inject(0, 1, fragment(3, &whole, half..whole.len()));
    net.settle();
    assert_eq!(net.nodes[1].core.statistics().get(stats::REASSEMBLY_EVICTED), 2);
    assert_eq!(net.nodes[1].delivered, vec![(net.id(0), msg)]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn any_size_survives_reordering(size in 1usize..20_000, mtu in 400u32..1500, seed: u64) {
        let mut net = Net::new(2, Characteristics::Unreliable);
        net.connect(0, 1, mtu);
        net.scramble = Some(seed);
        let msg = payload(size);
        net.send(0, 1, msg.clone());
        net.settle();
        let (id0, id1) = (net.id(0), net.id(1));
        prop_assert_eq!(&net.nodes[1].delivered, &vec![(id0, msg)]);
        prop_assert_eq!(&net.nodes[0].send_ok, &vec![(id1, true, size as u64)]);
    }
}
