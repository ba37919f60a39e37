// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! End-to-end dispatch scenarios on a single process: immediate local
//! delivery, pattern fan-out, typespec gating, and the timed-send
//! guard.

use std::cell::RefCell;
use std::rc::Rc;

use o2::{ArgView, Error, Process, Status, TimeBase};
use o2::msg::codec::encode_message;

fn unique(name: &str) -> String {
    format!("{}-{}", name, std::process::id())
}

#[test]
fn local_immediate_dispatch() {
    let mut p = Process::initialize(&unique("disp-imm")).expect("init");
    p.add_service("synth").expect("service");
    let got = Rc::new(RefCell::new(None));
    {
        let got = Rc::clone(&got);
        p.add_method(
            "/synth/vol",
            Some("f"),
            false,
            true,
            Box::new(move |_outbox, d| {
                *got.borrow_mut() = d.args.expect("argv")[0].f32();
            }),
        )
        .expect("method");
    }
    p.send_args("/synth/vol", 0.0, &[ArgView::Float(0.5)])
        .expect("send succeeds");
    assert_eq!(*got.borrow(), Some(0.5));
}

#[test]
fn pattern_invokes_both_methods_in_install_order() {
    let mut p = Process::initialize(&unique("disp-pattern")).expect("init");
    p.add_service("s").expect("service");
    let order = Rc::new(RefCell::new(Vec::new()));
    for name in ["a", "b"] {
        let order = Rc::clone(&order);
        p.add_method(
            &format!("/s/{}", name),
            Some("i"),
            false,
            true,
            Box::new(move |_outbox, d| {
                order
                    .borrow_mut()
                    .push((name, d.args.expect("argv")[0].i32().expect("int")));
            }),
        )
        .expect("method");
    }
    p.send_args("/s/*", 0.0, &[ArgView::Int32(7)]).expect("send");
    assert_eq!(order.borrow().as_slice(), [("a", 7), ("b", 7)]);
}

#[test]
fn timed_send_before_sync_fails_and_never_dispatches() {
    let mut p = Process::initialize(&unique("disp-timed")).expect("init");
    p.add_service("synth").expect("service");
    let hits = Rc::new(RefCell::new(0u32));
    {
        let hits = Rc::clone(&hits);
        p.add_method(
            "/synth/x",
            Some("i"),
            false,
            false,
            Box::new(move |_, _| *hits.borrow_mut() += 1),
        )
        .expect("method");
    }
    let err = p
        .send_args("/synth/x", 5.0, &[ArgView::Int32(1)])
        .expect_err("timed send without sync");
    assert!(matches!(err, Error::NoClock));
    assert_eq!(err.code(), -1);

    // The message was freed, not filed; nothing fires later either.
    for _ in 0..5 {
        p.poll().expect("poll");
    }
    assert_eq!(*hits.borrow(), 0);
}

#[test]
fn typespec_mismatch_skips_strict_methods() {
    let mut p = Process::initialize(&unique("disp-spec")).expect("init");
    p.add_service("s").expect("service");
    let hits = Rc::new(RefCell::new(Vec::new()));
    {
        let hits = Rc::clone(&hits);
        p.add_method(
            "/s/x",
            Some("i"),
            false,
            true,
            Box::new(move |_, d| hits.borrow_mut().push(d.types.to_string())),
        )
        .expect("method");
    }
    // Wrong typetag, no coercion allowed: dropped silently.
    p.send_args("/s/x", 0.0, &[ArgView::Str("seven")])
        .expect("send itself succeeds");
    assert!(hits.borrow().is_empty());
    // Exact match passes.
    p.send_args("/s/x", 0.0, &[ArgView::Int32(7)]).expect("send");
    assert_eq!(hits.borrow().as_slice(), ["i"]);
}

#[test]
fn status_reflects_lifecycle() {
    let mut p = Process::initialize(&unique("disp-status")).expect("init");
    assert_eq!(p.status("synth"), None);
    p.add_service("synth").expect("service");
    assert_eq!(p.status("synth"), Some(Status::LocalNoTime));
    assert!(p.status("synth").expect("known") < Status::Local);
    p.set_clock(None).expect("become candidate");
    assert_eq!(p.status("synth"), Some(Status::Local));
    p.remove_service("synth").expect("remove");
    assert_eq!(p.status("synth"), None);
}

#[test]
fn global_schedule_requires_sync_then_works() {
    let mut p = Process::initialize(&unique("disp-gsched")).expect("init");
    p.add_service("s").expect("service");
    let hits = Rc::new(RefCell::new(0u32));
    {
        let hits = Rc::clone(&hits);
        p.add_method(
            "/s/x",
            None,
            false,
            false,
            Box::new(move |_, _| *hits.borrow_mut() += 1),
        )
        .expect("method");
    }
    let msg = encode_message(1.0, "/s/x", &[]).expect("encode");
    assert!(matches!(
        p.schedule(TimeBase::Global, msg),
        Err(Error::NoClock)
    ));

    p.set_clock(None).expect("set clock");
    let due = p.time().expect("global time defined");
    let msg = encode_message(due + 0.03, "/s/x", &[]).expect("encode");
    p.schedule(TimeBase::Global, msg).expect("accepted");
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while *hits.borrow() == 0 && std::time::Instant::now() < deadline {
        p.poll().expect("poll");
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    assert_eq!(*hits.borrow(), 1);
}
