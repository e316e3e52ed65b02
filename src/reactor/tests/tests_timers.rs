#[cfg(test)]
mod tests {
    use crate::reactor::{
        ALL_EVENTS, CALL_AFTER_SLEEP, DONT_WAIT, Reactor, TIME_EVENTS, TimerAction,
    };
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Instant;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    #[test]
    fn test_one_shot_timer_fires_in_window_finalizer_once() {
        init_tracing();

        let mut reactor = Reactor::new(16).unwrap();
        let started = Instant::now();
        let fired_at: Rc<RefCell<Option<Instant>>> = Rc::new(RefCell::new(None));
        let finalized = Rc::new(RefCell::new(0u32));

        let fired_h = Rc::clone(&fired_at);
        let finalized_h = Rc::clone(&finalized);
        reactor.create_timer(
            50,
            Reactor::timer_handler(move |_reactor, _id| {
                *fired_h.borrow_mut() = Some(Instant::now());
                TimerAction::NoMore
            }),
            Some(Box::new(move |_reactor| {
                *finalized_h.borrow_mut() += 1;
            })),
        );

        while fired_at.borrow().is_none() {
            reactor.process_events(ALL_EVENTS | CALL_AFTER_SLEEP);
        }

        let elapsed = fired_at.borrow().unwrap().duration_since(started).as_millis();
        assert!(
            (50..=80).contains(&elapsed),
            "timer fired after {elapsed} ms"
        );
        assert_eq!(*finalized.borrow(), 1);

        // Further passes must not fire the handler or finalizer again.
        reactor.process_events(TIME_EVENTS | DONT_WAIT);
        assert_eq!(*finalized.borrow(), 1);
    }

    #[test]
    fn test_periodic_timer_reschedules_until_done() {
        init_tracing();

        let mut reactor = Reactor::new(16).unwrap();
        let ticks = Rc::new(RefCell::new(0u32));

        let ticks_h = Rc::clone(&ticks);
        reactor.create_timer(
            5,
            Reactor::timer_handler(move |_reactor, _id| {
                let mut t = ticks_h.borrow_mut();
                *t += 1;
                if *t >= 3 {
                    TimerAction::NoMore
                } else {
                    TimerAction::Again(5)
                }
            }),
            None,
        );

        while *ticks.borrow() < 3 {
            reactor.process_events(ALL_EVENTS | CALL_AFTER_SLEEP);
        }
        assert_eq!(*ticks.borrow(), 3);
    }

    #[test]
    fn test_delete_timer_runs_finalizer_not_handler() {
        init_tracing();

        let mut reactor = Reactor::new(16).unwrap();
        let finalized = Rc::new(RefCell::new(0u32));

        let finalized_h = Rc::clone(&finalized);
        let id = reactor.create_timer(
            10_000,
            Reactor::timer_handler(|_, _| unreachable!("deleted timer fired")),
            Some(Box::new(move |_| *finalized_h.borrow_mut() += 1)),
        );

        assert!(reactor.delete_timer(id));
        assert!(!reactor.delete_timer(id));

        // The tombstone is reaped (and the finalizer run) on the next pass.
        reactor.process_events(TIME_EVENTS | DONT_WAIT);
        assert_eq!(*finalized.borrow(), 1);
        reactor.process_events(TIME_EVENTS | DONT_WAIT);
        assert_eq!(*finalized.borrow(), 1);
    }

    #[test]
    fn test_timer_created_mid_pass_waits_for_next_pass() {
        init_tracing();

        let mut reactor = Reactor::new(16).unwrap();
        let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let log_outer = Rc::clone(&log);
        reactor.create_timer(
            0,
            Reactor::timer_handler(move |reactor, _id| {
                log_outer.borrow_mut().push("outer");
                let log_inner = Rc::clone(&log_outer);
                reactor.create_timer(
                    0,
                    Reactor::timer_handler(move |_, _| {
                        log_inner.borrow_mut().push("inner");
                        TimerAction::NoMore
                    }),
                    None,
                );
                TimerAction::NoMore
            }),
            None,
        );

        reactor.process_events(TIME_EVENTS | DONT_WAIT);
        assert_eq!(*log.borrow(), vec!["outer"]);
        reactor.process_events(TIME_EVENTS | DONT_WAIT);
        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_handler_deleting_itself_is_not_rescheduled() {
        init_tracing();

        let mut reactor = Reactor::new(16).unwrap();
        let calls = Rc::new(RefCell::new(0u32));

        let calls_h = Rc::clone(&calls);
        reactor.create_timer(
            0,
            Reactor::timer_handler(move |reactor, id| {
                *calls_h.borrow_mut() += 1;
                reactor.delete_timer(id);
                // The tombstone wins over the reschedule request.
                TimerAction::Again(0)
            }),
            None,
        );

        reactor.process_events(TIME_EVENTS | DONT_WAIT);
        reactor.process_events(TIME_EVENTS | DONT_WAIT);
        reactor.process_events(TIME_EVENTS | DONT_WAIT);
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn test_hooks_run_around_poll_before_timers() {
        init_tracing();

        let mut reactor = Reactor::new(16).unwrap();
        let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let log_b = Rc::clone(&log);
        reactor.set_before_sleep(move |_| log_b.borrow_mut().push("before"));
        let log_a = Rc::clone(&log);
        reactor.set_after_sleep(move |_| log_a.borrow_mut().push("after"));

        let log_t = Rc::clone(&log);
        reactor.create_timer(
            0,
            Reactor::timer_handler(move |_, _| {
                log_t.borrow_mut().push("timer");
                TimerAction::NoMore
            }),
            None,
        );

        reactor.process_events(ALL_EVENTS | CALL_AFTER_SLEEP);
        assert_eq!(*log.borrow(), vec!["before", "after", "timer"]);
    }

    #[test]
    fn test_stop_exits_run_loop() {
        init_tracing();

        let mut reactor = Reactor::new(16).unwrap();
        reactor.create_timer(
            0,
            Reactor::timer_handler(|reactor, _| {
                reactor.stop();
                TimerAction::NoMore
            }),
            None,
        );
        // Returns because the timer stops the loop.
        reactor.run();
    }
}
