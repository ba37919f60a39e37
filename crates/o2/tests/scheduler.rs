// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Scheduler behavior over simulated local time: hundreds of messages
//! in scrambled order across many wheel turns, delivered exactly once
//! and in timestamp order, never early.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use o2::msg::codec::encode_message;
use o2::{ArgView, Process, TimeBase, TimeSource};

struct ScriptedClock(Rc<Cell<f64>>);

impl TimeSource for ScriptedClock {
    fn now(&mut self) -> f64 {
        self.0.get()
    }
}

#[test]
fn three_hundred_messages_across_wheel_wraps() {
    let t = Rc::new(Cell::new(0.0));
    let mut p = Process::builder(&format!("sched-wrap-{}", std::process::id()))
        .local_clock(Box::new(ScriptedClock(Rc::clone(&t))))
        .build()
        .expect("init");
    p.add_service("t").expect("service");

    // (timestamp, local time at delivery) per invocation.
    let delivered: Rc<RefCell<Vec<(f64, f64)>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let delivered = Rc::clone(&delivered);
        p.add_method(
            "/t/x",
            Some("i"),
            false,
            true,
            Box::new(move |outbox, d| {
                delivered
                    .borrow_mut()
                    .push((d.msg.timestamp(), outbox.local_time()));
            }),
        )
        .expect("method");
    }

    // 300 timestamps spread over 10s (many 1.28s wheel turns), filed
    // in a scrambled but deterministic order.
    let mut stamps: Vec<f64> = (0..300)
        .map(|i| 0.01 + f64::from((i * 7919) % 9990) / 1000.0)
        .collect();
    for &ts in &stamps {
        let msg = encode_message(ts, "/t/x", &[ArgView::Int32(1)]).expect("encode");
        p.schedule(TimeBase::Local, msg).expect("schedule");
    }

    // Drive simulated time past the horizon at a 200 Hz virtual rate.
    let mut now = 0.0;
    while now < 11.0 {
        now += 0.005;
        t.set(now);
        p.poll().expect("poll");
    }

    let delivered = delivered.borrow();
    assert_eq!(delivered.len(), 300, "every message delivered exactly once");
    for window in delivered.windows(2) {
        assert!(
            window[0].0 <= window[1].0,
            "non-decreasing timestamps: {:?}",
            window
        );
    }
    for &(ts, at) in delivered.iter() {
        assert!(at >= ts, "never early: ts {} delivered at {}", ts, at);
    }

    stamps.sort_by(f64::total_cmp);
    let got: Vec<f64> = delivered.iter().map(|&(ts, _)| ts).collect();
    assert_eq!(got, stamps, "the delivered set is the scheduled set");
}

#[test]
fn handler_scheduling_chains_without_recursion() {
    let t = Rc::new(Cell::new(0.0));
    let mut p = Process::builder(&format!("sched-chain-{}", std::process::id()))
        .local_clock(Box::new(ScriptedClock(Rc::clone(&t))))
        .build()
        .expect("init");
    p.add_service("tick").expect("service");

    let fired: Rc<RefCell<Vec<f64>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let fired = Rc::clone(&fired);
        // Each firing schedules the next, one beat later, from inside
        // the handler: the poll loop must defer, not recurse.
        p.add_method(
            "/tick/beat",
            None,
            false,
            false,
            Box::new(move |outbox, d| {
                fired.borrow_mut().push(d.msg.timestamp());
                if fired.borrow().len() < 5 {
                    let next = encode_message(d.msg.timestamp() + 0.25, "/tick/beat", &[])
                        .expect("encode");
                    outbox.schedule(TimeBase::Local, next);
                }
            }),
        )
        .expect("method");
    }

    let first = encode_message(0.25, "/tick/beat", &[]).expect("encode");
    p.schedule(TimeBase::Local, first).expect("schedule");

    let mut now = 0.0;
    while now < 2.0 {
        now += 0.005;
        t.set(now);
        p.poll().expect("poll");
    }
    assert_eq!(
        fired.borrow().as_slice(),
        [0.25, 0.5, 0.75, 1.0, 1.25],
        "a metronome built from handler-side scheduling"
    );
}
