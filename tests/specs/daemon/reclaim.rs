//! Jobid allocation and reclaim specs.

use crate::prelude::*;
use gq_core::ErrorKind;
use gq_daemon::protocol::{Request, Response};

/// Fill the id space, delete one job, and watch its id come back only
/// after the deletion is flushed to disk.
#[test]
fn deleted_id_returns_after_flush() {
    let mut c = controller_with(|config| config.max_jobid = 3);
    c.add_queue("q1", 1);

    let first = c.submit("a");
    c.submit("b");
    c.submit("c");

    // Space exhausted.
    let response = c.engine.handle_client(
        ALICE,
        Request::AddJob {
            submit: gq_daemon::protocol::JobSubmission {
                name: "d".into(),
                args: vec!["/bin/true".into()],
                ..Default::default()
            },
        },
    );
    assert!(matches!(
        response,
        Ok(Response::Error {
            kind: ErrorKind::OutOfMemory,
            ..
        })
    ));

    // Deleting alone is not enough: the deletion is still dirty.
    let response = c.request(ALICE, Request::DelJob { jobid: first });
    assert_eq!(response, Response::Ok);
    let response = c.engine.handle_client(
        ALICE,
        Request::AddJob {
            submit: gq_daemon::protocol::JobSubmission {
                name: "d".into(),
                args: vec!["/bin/true".into()],
                ..Default::default()
            },
        },
    );
    assert!(matches!(
        response,
        Ok(Response::Error {
            kind: ErrorKind::OutOfMemory,
            ..
        })
    ));

    // After a save cycle the deletion is durable and the id frees up.
    c.checkpoint();
    let reclaimed = c.submit("d");
    assert_eq!(reclaimed, first);
}

/// Ids rotate forward instead of reusing the lowest free id.
#[test]
fn ids_rotate_through_the_space() {
    let mut c = controller();
    c.add_queue("q1", 1);

    let a = c.submit("a");
    let b = c.submit("b");
    assert_eq!((a, b), (1, 2));

    // Delete job 1 and flush; the next submission still takes 3.
    c.request(ALICE, Request::DelJob { jobid: a });
    c.checkpoint();
    c.engine.cleanup_tick().unwrap();

    assert_eq!(c.submit("c"), 3);
}
