mod common;

use common::Net;
use std::time::Duration;

use waypath_core::{Action, Characteristics, TransportConfig};

fn numbered(i: u8) -> Vec<u8> {
    vec![i; 64]
}

#[test]
fn receive_window_holds_back_deliveries() {
    let mut net = Net::new(2, Characteristics::Unreliable);
    net.connect(0, 1, 1200);
    net.nodes[1].auto_recv_ok = false;
    for i in 0..7 {
        net.send(0, 1, numbered(i));
    }
    net.settle();

    let a = net.id(0);
    let got: Vec<Vec<u8>> = net.nodes[1].delivered.iter().map(|(_, m)| m.clone()).collect();
    assert_eq!(got, (0..4).map(numbered).collect::<Vec<_>>());
    // held messages are still acknowledged on the wire
    assert_eq!(net.nodes[0].send_ok.len(), 7);

    let actions = net.nodes[1].core.on_core_recv_ok(a, 2);
    net.push(1, actions);
    net.settle();
    assert_eq!(net.nodes[1].delivered.len(), 6);

    let actions = net.nodes[1].core.on_core_recv_ok(a, 10);
    net.push(1, actions);
    net.settle();
    let got: Vec<Vec<u8>> = net.nodes[1].delivered.iter().map(|(_, m)| m.clone()).collect();
    assert_eq!(got, (0..7).map(numbered).collect::<Vec<_>>());
}

#[test]
fn queue_never_exceeds_its_length_limit() {
    let config = TransportConfig {
        queue_length_limit: 3,
        ..TransportConfig::default()
    };
    let mut net = Net::with_config(2, Characteristics::Unreliable, config);
    net.connect(0, 1, 1200);
    net.nodes[0].auto_complete = false;

    for i in 0..10 {
        net.send(0, 1, numbered(i));
    }
    net.settle();
    let b = net.id(1);
    let mut rounds = 0;
    while net.nodes[1].delivered.len() < 10 {
        let in_flight = net.nodes[0].core.queue_in_flight(&b);
        assert_eq!(in_flight.len(), 1);
        assert!(in_flight[0] <= 3, "{} in flight", in_flight[0]);
        assert!(!net.nodes[0].unsent.is_empty());
        net.complete_sends(0);
        rounds += 1;
        assert!(rounds < 20, "stalled");
    }
    assert!(rounds >= 3);
    let got: Vec<Vec<u8>> = net.nodes[1].delivered.iter().map(|(_, m)| m.clone()).collect();
    assert_eq!(got, (0..10).map(numbered).collect::<Vec<_>>());
}

#[test]
fn send_without_link_fails_at_once() {
    let mut net = Net::new(2, Characteristics::Unreliable);
    net.send(0, 1, numbered(1));
    net.settle();
    let b = net.id(1);
    assert_eq!(net.nodes[0].send_ok, vec![(b, false, 64)]);
    assert!(net.nodes[1].delivered.is_empty());
}

#[test]
fn send_lost_with_its_queue_moves_to_another_queue() {
    let mut net = Net::new(2, Characteristics::Reliable);
    net.connect(0, 1, 1200);
    // a second queue pair between the same peers
    net.wire(0, 1, 1200);
    net.run_for(Duration::from_millis(10));
    let b = net.id(1);
    assert_eq!(net.nodes[0].core.queue_in_flight(&b).len(), 2);

    let actions = net.nodes[0].core.on_core_send(b, numbered(9));
    let queue = actions
        .iter()
        .find_map(|a| match a {
            Action::Transmit { queue, .. } => Some(*queue),
            _ => None,
        })
        .expect("message handed to a queue");
    // the communicator never reports this send; its queue goes away instead
    let rest: Vec<Action> = actions
        .into_iter()
        .filter(|a| !matches!(a, Action::Transmit { .. }))
        .collect();
    net.push(0, rest);
    let comm = net.nodes[0].comm;
    let actions = net.nodes[0].core.on_del_queue(comm, queue);
    net.push(0, actions);
    net.settle();

    assert_eq!(net.nodes[1].delivered, vec![(net.id(0), numbered(9))]);
    assert_eq!(net.nodes[0].send_ok, vec![(b, true, 64)]);
    assert_eq!(net.nodes[0].core.pending_messages(&b), 0);
}

#[test]
fn monitor_reports_recent_goodput() {
    let mut net = Net::new(2, Characteristics::Unreliable);
    net.connect(0, 1, 1200);
    let b = net.id(1);
    net.send(0, 1, numbered(3));
    net.settle();
    assert_eq!(net.nodes[0].send_ok, vec![(b, true, 64)]);

    let (_, snapshots) = net.nodes[0].core.monitor_start(Some(b), true);
    assert_eq!(snapshots.len(), 1);
    let s = &snapshots[0];
    assert!(s.bytes_sent > 64, "sent {}", s.bytes_sent);
    assert!(s.bytes_acked > 64, "acked {}", s.bytes_acked);
    assert!(s.bytes_acked <= s.bytes_sent);
}
