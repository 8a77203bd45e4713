//! Property-based tests for the request queue over the simulated fabric.
//!
//! Clients send while fewer than half of the slots are in flight and the
//! server consumes in between. Every live request must occupy its own slot
//! and the server must see requests in the order their slots were claimed.

mod common;

use std::collections::{HashSet, VecDeque};

use common::{connect_client, transport, TIMEOUT};
use fabric_transport::{MemoryHandle, Operation, Role, SimFabric};
use proptest::prelude::*;

const SLOT_SIZE: usize = 64;

#[derive(Debug, Clone, Copy)]
enum Step {
    Send(usize),
    Receive,
}

fn any_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0usize..3).prop_map(Step::Send),
        2 => Just(Step::Receive),
    ]
}

fn any_slot_count() -> impl Strategy<Value = usize> {
    prop_oneof![Just(4usize), Just(8), Just(16)]
}

fn run(slot_count: usize, clients: usize, steps: &[Step]) -> Result<(), TestCaseError> {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let mut queue = server
        .register(
            vec![0u8; slot_count * SLOT_SIZE],
            SLOT_SIZE,
            Role::RequestQueue,
            None,
        )
        .unwrap();
    let connected: Vec<_> = (0..clients)
        .map(|_| connect_client(&fabric, &server))
        .collect();
    let mut handles: Vec<MemoryHandle> = connected
        .iter()
        .map(|c| {
            c.transport
                .register(vec![0u8; SLOT_SIZE], 1, Role::Send, Some(&c.server))
                .unwrap()
        })
        .collect();

    let mut live: VecDeque<(u64, u64)> = VecDeque::new();
    let mut seq = 0u64;
    for step in steps {
        let send = match *step {
            Step::Send(_) => live.len() < slot_count / 2,
            Step::Receive => live.is_empty(),
        };
        if send {
            let who = match *step {
                Step::Send(k) => k % clients,
                Step::Receive => 0,
            };
            let client = &connected[who];
            let handle = &mut handles[who];
            handle.write(0, &seq.to_le_bytes()).unwrap();
            client.transport.send(handle, None).unwrap();
            let status = client
                .transport
                .wait(handle, Operation::Send, TIMEOUT)
                .unwrap();
            let slot = status.offset / SLOT_SIZE as u64;
            prop_assert!(slot < slot_count as u64);
            let slots: HashSet<u64> = live.iter().map(|&(s, _)| s).collect();
            prop_assert!(!slots.contains(&slot), "slot {} claimed twice", slot);
            live.push_back((slot, seq));
            seq += 1;
        } else {
            let status = server
                .wait(&mut queue, Operation::Receive, TIMEOUT)
                .unwrap();
            let (slot, expected) = live.pop_front().unwrap();
            prop_assert_eq!(status.offset, slot * SLOT_SIZE as u64);
            let bytes = queue.read(status.offset as usize, 8).unwrap();
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes);
            prop_assert_eq!(u64::from_le_bytes(word), expected);
        }
    }

    while let Some((slot, expected)) = live.pop_front() {
        let status = server
            .wait(&mut queue, Operation::Receive, TIMEOUT)
            .unwrap();
        prop_assert_eq!(status.offset, slot * SLOT_SIZE as u64);
        let bytes = queue.read(status.offset as usize, 8).unwrap();
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        prop_assert_eq!(u64::from_le_bytes(word), expected);
    }
    prop_assert_eq!(server.metrics().requests_received, seq);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_live_slots_distinct_and_fifo(
        slot_count in any_slot_count(),
        clients in 1usize..=3,
        steps in proptest::collection::vec(any_step(), 1..40),
    ) {
        run(slot_count, clients, &steps)?;
    }
}
