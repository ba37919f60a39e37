// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Two processes on one host: discovery handshake, service status
//! transitions, clock synchronization to the candidate, message
//! exchange, and peer-loss teardown.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use o2::{ArgView, Process, Status};

fn unique_ensemble(tag: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{}-{}-{}", tag, std::process::id(), nanos)
}

/// Poll both processes until `done` or the deadline.
fn pump(
    p1: &mut Process,
    p2: &mut Process,
    timeout: Duration,
    mut done: impl FnMut(&mut Process, &mut Process) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        p1.poll().expect("poll p1");
        p2.poll().expect("poll p2");
        if done(p1, p2) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn discovery_sync_exchange_and_loss() {
    let ensemble = unique_ensemble("two-proc");
    let mut p1 = Process::initialize(&ensemble).expect("init p1");
    let mut p2 = Process::initialize(&ensemble).expect("init p2");

    // P2 offers the service; P1 provides the clock.
    p2.add_service("echo").expect("service");
    let heard: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let heard = Rc::clone(&heard);
        p2.add_method(
            "/echo/x",
            Some("i"),
            false,
            true,
            Box::new(move |_outbox, d| {
                heard
                    .borrow_mut()
                    .push(d.args.expect("argv")[0].i32().expect("int"));
            }),
        )
        .expect("method");
    }
    p1.set_clock(None).expect("p1 is the clock candidate");

    // Unknown, then discovered without sync, then fully synced.
    assert_eq!(p1.status("echo"), None);
    assert!(
        pump(&mut p1, &mut p2, Duration::from_secs(5), |p1, _| {
            p1.status("echo").is_some()
        }),
        "p1 should discover p2's service within 5s"
    );
    assert!(
        p1.status("echo").expect("discovered") >= Status::RemoteNoTime,
        "remote before sync: {:?}",
        p1.status("echo")
    );

    assert!(
        pump(&mut p1, &mut p2, Duration::from_secs(5), |p1, p2| {
            p1.status("echo") == Some(Status::Remote) && p2.time().is_some()
        }),
        "p2 should sync to p1's clock and report it within 5s"
    );

    // Once synced, the two global clocks agree to within a coarse
    // bound (loopback RTT is microseconds; the bound absorbs noise).
    let g1 = p1.time().expect("master time");
    let g2 = p2.time().expect("synced time");
    assert!((g1 - g2).abs() < 0.2, "clocks agree: {} vs {}", g1, g2);

    // Best-effort exchange lands on p2's handler.
    p1.send_args("/echo/x", 0.0, &[ArgView::Int32(42)])
        .expect("send");
    assert!(
        pump(&mut p1, &mut p2, Duration::from_secs(2), |_, _| {
            !heard.borrow().is_empty()
        }),
        "message should arrive within 2s"
    );
    assert_eq!(heard.borrow().as_slice(), [42]);

    // Reliable exchange too.
    p1.send_cmd_args("/echo/x", 0.0, &[ArgView::Int32(43)])
        .expect("send cmd");
    assert!(
        pump(&mut p1, &mut p2, Duration::from_secs(2), |_, _| {
            heard.borrow().len() == 2
        }),
        "reliable message should arrive within 2s"
    );

    // Kill p2; its TCP teardown must erase the service on p1 quickly.
    p2.finish();
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut gone = false;
    while Instant::now() < deadline {
        p1.poll().expect("poll p1");
        if p1.status("echo").is_none() {
            gone = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(gone, "service should vanish within 2s of peer loss");
    let err = p1
        .send_args("/echo/x", 0.0, &[ArgView::Int32(44)])
        .expect_err("routing to a lost peer fails");
    assert_eq!(err.code(), -1);
}

#[test]
fn lowest_candidate_id_wins_election() {
    let ensemble = unique_ensemble("two-master");
    let mut p1 = Process::initialize(&ensemble).expect("init p1");
    let mut p2 = Process::initialize(&ensemble).expect("init p2");
    p1.set_clock(None).expect("candidate 1");
    p2.set_clock(None).expect("candidate 2");

    assert!(
        pump(&mut p1, &mut p2, Duration::from_secs(5), |p1, p2| {
            p1.time().is_some() && p2.time().is_some()
        }),
        "both sides should have global time within 5s"
    );

    // Whoever has the lower id is the reference; the other probes it.
    let (master, follower) = if p1.peer_id() < p2.peer_id() {
        (&p1, &p2)
    } else {
        (&p2, &p1)
    };
    assert!(
        master.roundtrip().is_none(),
        "the master does not probe anyone"
    );
    assert!(
        follower.roundtrip().is_some(),
        "the follower keeps a sync sample ring against the master"
    );
}
