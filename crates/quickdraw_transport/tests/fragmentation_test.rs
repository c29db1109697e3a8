//! Integration tests for fragmentation and reassembly across a simulated link.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;
use quickdraw_transport::{
    LinkConditions, MacAddress, PacketTransport, PayloadType, SimulatedAir, SimulatedRadio,
    TransportConfig,
};

const A: MacAddress = MacAddress([0x24, 0x6F, 0x28, 0, 0, 0xA1]);
const B: MacAddress = MacAddress([0x24, 0x6F, 0x28, 0, 0, 0xB2]);

type Inbox = Rc<RefCell<Vec<(MacAddress, Vec<u8>)>>>;

fn link(
    seed: u64,
    conditions: LinkConditions,
    config: TransportConfig,
) -> (SimulatedAir, PacketTransport<SimulatedRadio>, PacketTransport<SimulatedRadio>, Inbox) {
    let air = SimulatedAir::new(seed, conditions);
    let (radio_a, rx_a) = air.attach(A);
    let (radio_b, rx_b) = air.attach(B);
    let a = PacketTransport::new(radio_a, rx_a, config.clone());
    let mut b = PacketTransport::new(radio_b, rx_b, config);

    let inbox: Inbox = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&inbox);
    b.set_handler(
        PayloadType::QuickdrawCommand,
        Box::new(move |from, bytes| sink.borrow_mut().push((from, bytes.to_vec()))),
    );
    (air, a, b, inbox)
}

fn pump(a: &mut PacketTransport<SimulatedRadio>, b: &mut PacketTransport<SimulatedRadio>) {
    for tick in 0..10_000 {
        let handled = a.poll(tick) + b.poll(tick);
        if handled == 0 && a.queued_frames() == 0 {
            return;
        }
    }
    panic!("link never went idle");
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn fragment_count_and_reassembly_match(
        fragment_payload in 8usize..=245,
        len in 0usize..2000,
    ) {
        let config = TransportConfig { max_fragment_payload: fragment_payload, ..TransportConfig::default() };
        let (air, mut a, mut b, inbox) = link(1, LinkConditions::PERFECT, config);

        let bytes = payload(len);
        a.send(B, PayloadType::QuickdrawCommand, &bytes).unwrap();
        pump(&mut a, &mut b);

        let expected_fragments = len.div_ceil(fragment_payload).max(1) as u64;
        prop_assert_eq!(air.stats().transmitted, expected_fragments);
        prop_assert_eq!(inbox.borrow().len(), 1);
        prop_assert_eq!(&inbox.borrow()[0].1, &bytes);
        prop_assert_eq!(inbox.borrow()[0].0, A);
    }
}

#[test]
fn test_messages_arrive_in_send_order() {
    let (_air, mut a, mut b, inbox) = link(3, LinkConditions::PERFECT, TransportConfig::default());

    for n in 0..5u8 {
        a.send(B, PayloadType::QuickdrawCommand, &vec![n; 300]).unwrap();
    }
    pump(&mut a, &mut b);

    let inbox = inbox.borrow();
    assert_eq!(inbox.len(), 5);
    for (n, (_, bytes)) in inbox.iter().enumerate() {
        assert_eq!(bytes, &vec![n as u8; 300]);
    }
}

#[test]
fn test_noisy_link_recovers_through_retries() {
    let (air, mut a, mut b, inbox) = link(42, LinkConditions::NOISY, TransportConfig::default());

    for _ in 0..20 {
        a.send(B, PayloadType::QuickdrawCommand, &payload(600)).unwrap();
    }
    pump(&mut a, &mut b);

    assert!(air.stats().lost > 0);
    assert!(a.stats().retries > 0);
    assert_eq!(inbox.borrow().len(), 20);
    assert!(inbox.borrow().iter().all(|(_, bytes)| *bytes == payload(600)));
}

#[test]
fn test_link_degrading_between_messages() {
    let (air, mut a, mut b, inbox) = link(21, LinkConditions::PERFECT, TransportConfig::default());

    a.send(B, PayloadType::QuickdrawCommand, &payload(600)).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(air.stats().lost, 0);

    air.set_conditions(LinkConditions::POOR);
    for _ in 0..10 {
        a.send(B, PayloadType::QuickdrawCommand, &payload(300)).unwrap();
    }
    pump(&mut a, &mut b);

    assert!(air.stats().lost > 0);
    assert!(a.stats().retries > 0);
    assert_eq!(inbox.borrow()[0].1, payload(600));
}

#[test]
fn test_exhausted_fragment_drops_whole_message() {
    let (air, mut a, mut b, inbox) = link(5, LinkConditions::PERFECT, TransportConfig::default());

    // First attempt plus five retries of fragment 0 all fail.
    air.fail_next(6);
    a.send(B, PayloadType::QuickdrawCommand, &payload(600)).unwrap();
    pump(&mut a, &mut b);

    assert_eq!(a.stats().frames_dropped, 1);
    assert!(inbox.borrow().is_empty());

    a.send(B, PayloadType::QuickdrawCommand, &payload(600)).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(inbox.borrow().len(), 1);
}

#[test]
fn test_lost_middle_fragment_counts_violation() {
    let (air, mut a, mut b, inbox) = link(9, LinkConditions::PERFECT, TransportConfig {
        max_retries: 0,
        ..TransportConfig::default()
    });

    a.send(B, PayloadType::QuickdrawCommand, &payload(600)).unwrap();
    // Deliver fragment 0, then lose fragment 1.
    b.poll(0);
    air.fail_next(1);
    a.poll(0);
    pump(&mut a, &mut b);

    assert!(inbox.borrow().is_empty());
    assert_eq!(b.stats().sequence_violations, 1);
}

#[test]
fn test_crowd_of_broadcasters_does_not_break_cluster() {
    let (air, mut a, mut b, inbox) = link(13, LinkConditions::PERFECT, TransportConfig::default());
    let mut crowd: Vec<_> = (0..20u8)
        .map(|n| {
            let (radio, rx) = air.attach(MacAddress([0x24, 0x6F, 0x28, 0, 1, n]));
            PacketTransport::new(radio, rx, TransportConfig::default())
        })
        .collect();

    a.send(B, PayloadType::QuickdrawCommand, &payload(600)).unwrap();
    for station in &mut crowd {
        station.send(MacAddress::BROADCAST, PayloadType::Debug, b"hello").unwrap();
    }
    pump(&mut a, &mut b);

    assert_eq!(a.stats().frames_dropped, 0);
    assert!(a.stats().peers_evicted > 0);
    assert!(a.peers().get(B).unwrap().is_registered());
    assert_eq!(inbox.borrow().len(), 1);
    assert_eq!(inbox.borrow()[0].1, payload(600));
}

#[test]
fn test_unhandled_payload_type_is_dropped() {
    let (_air, mut a, mut b, inbox) = link(1, LinkConditions::PERFECT, TransportConfig::default());
    a.send(B, PayloadType::PlayerInfo, &[1, 2, 3]).unwrap();
    pump(&mut a, &mut b);
    assert!(inbox.borrow().is_empty());
    assert_eq!(b.stats().messages_delivered, 0);
}
