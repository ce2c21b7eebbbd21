// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use proptest::prelude::*;
use yare::parameterized;

#[parameterized(
    running = { JobState::Running, 0x01 },
    pending = { JobState::Pending, 0x02 },
    deferred = { JobState::Deferred, 0x04 },
    holding = { JobState::Holding, 0x08 },
    completed = { JobState::Completed, 0x10 },
    exited = { JobState::Exited, 0x20 },
    unknown = { JobState::Unknown, 0x40 },
)]
fn state_bits_round_trip(state: JobState, bits: u32) {
    assert_eq!(state.bits(), bits);
    assert_eq!(JobState::from_bits(bits), Some(state));
}

#[test]
fn from_bits_rejects_combined_and_zero() {
    assert_eq!(JobState::from_bits(0), None);
    assert_eq!(JobState::from_bits(0x03), None);
    assert_eq!(JobState::from_bits(0x80), None);
}

#[test]
fn state_mask_matches_sets() {
    let mask = StateMask::from(JobState::Pending).with(JobState::Deferred);
    assert!(mask.contains(JobState::Pending));
    assert!(mask.contains(JobState::Deferred));
    assert!(!mask.contains(JobState::Running));
    assert!(StateMask::ALL.contains(JobState::Unknown));
}

#[test]
fn internal_flags_insert_remove() {
    let mut flags = InternalFlags::default();
    assert!(!flags.contains(InternalFlags::DELETED));

    flags.insert(InternalFlags::DELETED);
    flags.insert(InternalFlags::FLUSHING);
    assert!(flags.contains(InternalFlags::DELETED));
    assert!(flags.contains(InternalFlags::FLUSHING));

    flags.remove(InternalFlags::FLUSHING);
    assert!(flags.contains(InternalFlags::DELETED));
    assert!(!flags.contains(InternalFlags::FLUSHING));
}

#[parameterized(
    bare = { "gpu", Some(("gpu", 1)) },
    counted = { "gpu:4", Some(("gpu", 4)) },
    zero = { "gpu:0", None },
    empty = { "", None },
    bad_count = { "gpu:x", None },
)]
fn resource_request_parse(input: &str, expected: Option<(&str, u32)>) {
    let parsed = ResourceRequest::parse(input);
    match expected {
        Some((name, count)) => {
            let req = parsed.unwrap();
            assert_eq!(req.name, name);
            assert_eq!(req.count, count);
        }
        None => assert!(parsed.is_none()),
    }
}

#[test]
fn resource_request_display_round_trips() {
    let req = ResourceRequest::parse("lic:3").unwrap();
    assert_eq!(ResourceRequest::parse(&req.to_string()), Some(req));
}

#[test]
fn terminal_states() {
    assert!(JobState::Completed.is_terminal());
    assert!(JobState::Exited.is_terminal());
    assert!(!JobState::Running.is_terminal());
    assert!(!JobState::Unknown.is_terminal());
}

const ALL_STATES: [JobState; 7] = [
    JobState::Running,
    JobState::Pending,
    JobState::Deferred,
    JobState::Holding,
    JobState::Completed,
    JobState::Exited,
    JobState::Unknown,
];

proptest! {
    // A mask built from any subset of states contains exactly that subset.
    #[test]
    fn mask_contains_exactly_its_states(included in proptest::collection::vec(any::<bool>(), 7)) {
        let mut mask = StateMask::default();
        for (state, include) in ALL_STATES.iter().zip(&included) {
            if *include {
                mask = mask.with(*state);
            }
        }
        for (state, include) in ALL_STATES.iter().zip(&included) {
            prop_assert_eq!(mask.contains(*state), *include);
        }
    }

    // Filters never confuse distinct states: one state's mask matches no
    // other state.
    #[test]
    fn single_state_masks_are_disjoint(a in 0usize..7, b in 0usize..7) {
        let mask = StateMask::from(ALL_STATES[a]);
        prop_assert_eq!(mask.contains(ALL_STATES[b]), a == b);
    }
}
