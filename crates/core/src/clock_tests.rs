// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn fake_clock_advances() {
    let clock = FakeClock::new();
    let start = clock.now();
    let start_ms = clock.epoch_ms();

    clock.advance(Duration::from_secs(5));

    assert_eq!(clock.now() - start, Duration::from_secs(5));
    assert_eq!(clock.epoch_ms() - start_ms, 5000);
}

#[test]
fn fake_clock_epoch_secs_derives_from_ms() {
    let clock = FakeClock::new();
    clock.set_epoch_ms(12_345_678);
    assert_eq!(clock.epoch_secs(), 12_345);
}

#[test]
fn system_clock_is_monotonic() {
    let clock = SystemClock;
    let a = clock.now();
    let b = clock.now();
    assert!(b >= a);
}
