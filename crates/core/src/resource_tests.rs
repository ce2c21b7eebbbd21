// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn available_never_underflows() {
    let mut res = Resource {
        name: "gpu".into(),
        count: 2,
        in_use: 0,
        internal: InternalFlags::default(),
        revision: 0,
        dirty: false,
    };
    assert_eq!(res.available(), 2);

    res.in_use = 2;
    assert_eq!(res.available(), 0);

    // in_use beyond count is an invariant violation elsewhere, but
    // available() must still not underflow.
    res.in_use = 3;
    assert_eq!(res.available(), 0);
}
