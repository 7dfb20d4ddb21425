//! Integration tests for zones, tasks and the host adapters.
//!
//! Everything goes through the public API: zones are forked from a fresh
//! runtime per test and tasks are fired the way a host would fire them.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use zone_rt::host::{EventLoop, EventTarget};
use zone_rt::specs::{TaskTracker, sync_test_zone_spec};
use zone_rt::zone::{HasTaskState, HostHooks, TaskData};
use zone_rt::{
    EventLoopConfig, Runtime, RuntimeConfig, Task, TaskState, TaskType, Zone, ZoneError,
    ZoneResult, ZoneSpec,
};

type Log = Rc<RefCell<Vec<String>>>;

fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

fn setup() -> (Runtime, EventLoop) {
    let runtime = Runtime::new();
    let event_loop = EventLoop::new(&runtime, EventLoopConfig::default()).unwrap();
    (runtime, event_loop)
}

/// Macro task whose host registration does nothing; the test fires it by hand.
fn schedule_manual(zone: &Zone, source: &str, data: TaskData, log: &Log) -> ZoneResult<Task> {
    let sink = log.clone();
    let label = source.to_string();
    zone.schedule_macro_task(
        source,
        move |_| {
            sink.borrow_mut().push(format!("ran {label}"));
            Ok(())
        },
        data,
        HostHooks::new().on_schedule(|_| Ok(())).on_cancel(|_| Ok(())),
    )
}

// ── Context propagation ─────────────────────────────────────────────

#[test]
fn timer_callback_sees_scheduling_zone() {
    let (runtime, event_loop) = setup();
    let scheduler = runtime.root().fork(ZoneSpec::new("scheduler")).unwrap();
    let bystander = runtime.root().fork(ZoneSpec::new("bystander")).unwrap();
    let seen = Rc::new(RefCell::new(None));

    let sink = seen.clone();
    let rt = runtime.clone();
    scheduler
        .run(|| {
            event_loop.set_timeout(
                move |_| {
                    *sink.borrow_mut() = Some(rt.current());
                    Ok(())
                },
                Duration::from_millis(10),
            )
        })
        .unwrap();

    // The host fires the timer while an unrelated zone is current.
    bystander
        .run(|| {
            event_loop
                .advance(Duration::from_millis(10))
                .map_err(ZoneError::callback)
        })
        .unwrap();

    assert_eq!(seen.borrow().clone(), Some(scheduler));
    assert_eq!(runtime.current(), runtime.root());
}

#[test]
fn listener_and_microtask_keep_their_zones() {
    let (runtime, event_loop) = setup();
    let target = EventTarget::new(&runtime, "button").unwrap();
    let zone = runtime.root().fork(ZoneSpec::new("handler")).unwrap();
    let log = new_log();

    let sink = log.clone();
    let rt = runtime.clone();
    let el = event_loop.clone();
    zone.run(|| {
        target.add_event_listener("click", move |_| {
            sink.borrow_mut().push(format!("listener in {}", rt.current().name()));
            let inner = sink.clone();
            let rt = rt.clone();
            el.queue_microtask(move |_| {
                inner
                    .borrow_mut()
                    .push(format!("microtask in {}", rt.current().name()));
                Ok(())
            })?;
            Ok(())
        })
    })
    .unwrap();

    target.dispatch("click", &());
    assert_eq!(
        log.borrow().as_slice(),
        ["listener in handler", "microtask in handler"]
    );
}

// ── Stack restoration ───────────────────────────────────────────────

#[test]
fn current_zone_restored_after_nested_errors() {
    let runtime = Runtime::new();
    let a = runtime.root().fork(ZoneSpec::new("a")).unwrap();
    let b = a.fork(ZoneSpec::new("b")).unwrap();

    let result = a.run(|| {
        let inner = b.run(|| -> ZoneResult<()> {
            assert_eq!(runtime.current(), b);
            Err(ZoneError::callback("inner failure"))
        });
        assert!(inner.is_err());
        assert_eq!(runtime.current(), a);
        b.run(|| a.run(|| Ok(runtime.current())))
    });

    assert_eq!(result.unwrap(), a);
    assert_eq!(runtime.current(), runtime.root());
}

#[test]
fn recursive_runs_unwind_fully() {
    let runtime = Runtime::new();
    let zone = runtime.root().fork(ZoneSpec::new("recursive")).unwrap();

    fn descend(runtime: &Runtime, zone: &Zone, depth: u32) -> ZoneResult<u32> {
        if depth == 0 {
            return Err(ZoneError::callback("bottom"));
        }
        zone.run(|| descend(runtime, zone, depth - 1))
    }

    assert!(descend(&runtime, &zone, 16).is_err());
    assert_eq!(runtime.current(), runtime.root());
    assert!(runtime.current_frame().is_none());
}

// ── Hook inheritance ────────────────────────────────────────────────

#[test]
fn child_without_hooks_behaves_like_parent() {
    let runtime = Runtime::new();
    let log = new_log();

    let invoke_log = log.clone();
    let schedule_log = log.clone();
    let parent = runtime
        .root()
        .fork(
            ZoneSpec::new("parent")
                .on_invoke(move |delegate, current, target, invocation, source| {
                    invoke_log
                        .borrow_mut()
                        .push(format!("invoke {} via {}", target.name(), current.name()));
                    delegate.invoke(target, invocation, source)
                })
                .on_schedule_task(move |delegate, current, target, task| {
                    schedule_log
                        .borrow_mut()
                        .push(format!("schedule {} via {}", target.name(), current.name()));
                    delegate.schedule_task(target, task)
                }),
        )
        .unwrap();
    let child = parent.fork(ZoneSpec::new("child")).unwrap();

    child.run(|| Ok(())).unwrap();
    schedule_manual(&child, "child.task", TaskData::default(), &log).unwrap();

    assert_eq!(
        log.borrow().as_slice(),
        ["invoke child via parent", "schedule child via parent"]
    );
}

#[test]
fn child_hook_runs_before_parent_hook() {
    let runtime = Runtime::new();
    let calls = new_log();

    let outer = calls.clone();
    let parent = runtime
        .root()
        .fork(ZoneSpec::new("parent").on_invoke(move |d, _, t, inv, s| {
            outer.borrow_mut().push("parent".to_string());
            d.invoke(t, inv, s)
        }))
        .unwrap();
    let inner = calls.clone();
    let child = parent
        .fork(ZoneSpec::new("child").on_invoke(move |d, _, t, inv, s| {
            inner.borrow_mut().push("child".to_string());
            d.invoke(t, inv, s)
        }))
        .unwrap();

    child.run(|| Ok(())).unwrap();
    // The child delegates to its parent, so both hooks run, child first.
    assert_eq!(calls.borrow().as_slice(), ["child", "parent"]);
}

// ── Task identity ───────────────────────────────────────────────────

#[test]
fn foreign_zone_cannot_run_or_cancel_task() {
    let runtime = Runtime::new();
    let owner = runtime.root().fork(ZoneSpec::new("owner")).unwrap();
    let stranger = runtime.root().fork(ZoneSpec::new("stranger")).unwrap();
    let log = new_log();
    let task = schedule_manual(&owner, "owned", TaskData::default(), &log).unwrap();

    let run_err = stranger.run_task(&task, None).unwrap_err();
    assert_eq!(
        run_err.to_string(),
        "A task can only be run in the zone of creation! (Creation: owner; Execution: stranger)"
    );
    let cancel_err = stranger.cancel_task(&task).unwrap_err();
    assert!(matches!(cancel_err, ZoneError::WrongZone { action: "cancelled", .. }));

    assert_eq!(task.state(), TaskState::Scheduled);
    assert!(log.borrow().is_empty());
}

#[test]
fn cannot_reschedule_into_descendant() {
    let runtime = Runtime::new();
    let parent = runtime.root().fork(ZoneSpec::new("parent")).unwrap();
    let child = parent.fork(ZoneSpec::new("child")).unwrap();
    let log = new_log();
    let task = schedule_manual(&parent, "moving", TaskData::default(), &log).unwrap();
    parent.cancel_task(&task).unwrap();

    let err = child.schedule_task(task).unwrap_err();
    assert!(matches!(err, ZoneError::RescheduleIntoDescendant { .. }));
}

// ── Microtask queue ─────────────────────────────────────────────────

#[test]
fn microtasks_run_fifo_and_drain_to_exhaustion() {
    let (runtime, event_loop) = setup();
    let log = new_log();

    let sink = log.clone();
    let el = event_loop.clone();
    event_loop
        .set_timeout(
            move |_| {
                for label in ["x", "y"] {
                    let sink = sink.clone();
                    let el2 = el.clone();
                    el.queue_microtask(move |_| {
                        sink.borrow_mut().push(label.to_string());
                        if label == "x" {
                            let nested = sink.clone();
                            el2.queue_microtask(move |_| {
                                nested.borrow_mut().push("x.child".to_string());
                                Ok(())
                            })?;
                        }
                        Ok(())
                    })?;
                }
                sink.borrow_mut().push("timer".to_string());
                Ok(())
            },
            Duration::ZERO,
        )
        .unwrap();

    event_loop.advance(Duration::ZERO).unwrap();
    assert_eq!(log.borrow().as_slice(), ["timer", "x", "y", "x.child"]);
    assert!(!runtime.has_pending_microtasks());
}

#[test]
fn outermost_task_invoke_drains_queue() {
    let runtime = Runtime::new();
    let zone = runtime.root().fork(ZoneSpec::new("host")).unwrap();
    let log = new_log();

    let sink = log.clone();
    let rt = runtime.clone();
    let task = zone
        .schedule_event_task(
            "manual.event",
            move |_| {
                let sink = sink.clone();
                rt.current().schedule_micro_task(
                    "then",
                    move |_| {
                        sink.borrow_mut().push("micro".to_string());
                        Ok(())
                    },
                    TaskData::default(),
                    HostHooks::new(),
                )?;
                Ok(())
            },
            TaskData::default(),
            HostHooks::new().on_schedule(|_| Ok(())),
        )
        .unwrap();

    task.invoke(None).unwrap();
    assert_eq!(log.borrow().as_slice(), ["micro"]);
    // Queued from inside a task frame, so no separate drain was requested.
    assert!(!runtime.drain_requested());
}

// ── Task-count zero crossings ───────────────────────────────────────

fn watcher(runtime: &Runtime, log: &Log) -> Zone {
    let sink = log.clone();
    runtime
        .root()
        .fork(ZoneSpec::new("watcher").on_has_task(
            move |_, _, target, state: HasTaskState| {
                sink.borrow_mut().push(format!(
                    "{} {} micro={} macro={}",
                    target.name(),
                    state.change,
                    state.micro_task,
                    state.macro_task
                ));
                Ok(())
            },
        ))
        .unwrap()
}

#[test]
fn has_task_fires_on_first_and_last_microtask() {
    let runtime = Runtime::new();
    let log = new_log();
    let zone = watcher(&runtime, &log);
    let child = zone.fork(ZoneSpec::new("child")).unwrap();

    for _ in 0..2 {
        child
            .schedule_micro_task("micro", |_| Ok(()), TaskData::default(), HostHooks::new())
            .unwrap();
    }
    assert_eq!(
        log.borrow().as_slice(),
        [
            "child microTask micro=true macro=false",
            "watcher microTask micro=true macro=false",
        ]
    );
    assert_eq!(zone.delegate().task_count(TaskType::MicroTask), 2);

    runtime.drain_micro_task_queue().unwrap();
    assert_eq!(log.borrow().len(), 4);
    assert_eq!(log.borrow()[2], "child microTask micro=false macro=false");
    assert_eq!(log.borrow()[3], "watcher microTask micro=false macro=false");
    assert_eq!(zone.delegate().task_count(TaskType::MicroTask), 0);
}

#[test]
fn has_task_fires_when_last_timer_is_canceled() {
    let (runtime, event_loop) = setup();
    let log = new_log();
    let zone = watcher(&runtime, &log);

    let first = zone
        .run(|| event_loop.set_timeout(|_| Ok(()), Duration::from_millis(5)))
        .unwrap();
    let second = zone
        .run(|| event_loop.set_timeout(|_| Ok(()), Duration::from_millis(5)))
        .unwrap();
    assert_eq!(log.borrow().as_slice(), ["watcher macroTask micro=false macro=true"]);

    event_loop.clear_timer(&first).unwrap();
    assert_eq!(log.borrow().len(), 1);
    event_loop.clear_timer(&second).unwrap();
    assert_eq!(
        log.borrow().last().map(String::as_str),
        Some("watcher macroTask micro=false macro=false")
    );
}

// ── Scheduling scenarios ────────────────────────────────────────────

#[test]
fn schedule_hook_logs_once_and_task_runs_once() {
    let runtime = Runtime::new();
    let log = new_log();
    let hook_log = log.clone();
    let zone = runtime
        .root()
        .fork(ZoneSpec::new("logging").on_schedule_task(move |delegate, _, target, task| {
            hook_log
                .borrow_mut()
                .push(format!("scheduled {}", task.source()));
            delegate.schedule_task(target, task)
        }))
        .unwrap();

    let task = schedule_manual(&zone, "test", TaskData::default(), &log).unwrap();
    assert_eq!(log.borrow().as_slice(), ["scheduled test"]);

    zone.run_task(&task, None).unwrap();
    assert_eq!(log.borrow().as_slice(), ["scheduled test", "ran test"]);
    // A finished one-shot task is not armed again.
    zone.run_task(&task, None).unwrap();
    assert_eq!(log.borrow().len(), 2);
}

#[test]
fn one_shot_and_periodic_run_counts() {
    let runtime = Runtime::new();
    let zone = runtime.root().fork(ZoneSpec::new("counts")).unwrap();
    let log = new_log();

    let once = schedule_manual(&zone, "once", TaskData::delayed(Duration::from_millis(1)), &log)
        .unwrap();
    zone.run_task(&once, None).unwrap();
    assert_eq!(once.state(), TaskState::NotScheduled);
    assert_eq!(once.run_count(), 0);

    let repeating =
        schedule_manual(&zone, "repeat", TaskData::periodic(Duration::from_millis(1)), &log)
            .unwrap();
    zone.run_task(&repeating, None).unwrap();
    zone.run_task(&repeating, None).unwrap();
    assert_eq!(repeating.state(), TaskState::Scheduled);
    assert_eq!(repeating.run_count(), 2);
}

#[test]
fn reentrant_run_task_settles_once() {
    let runtime = Runtime::new();
    let log = new_log();
    let zone = watcher(&runtime, &log);

    let slot: Rc<RefCell<Option<Task>>> = Rc::new(RefCell::new(None));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let (me, counts) = (slot.clone(), seen.clone());
    let task = zone
        .schedule_macro_task(
            "reentrant",
            move |_| {
                let task = me.borrow().clone().expect("task stored before it runs");
                counts.borrow_mut().push((task.state(), task.run_count()));
                if task.run_count() == 1 {
                    task.zone().expect("scheduled task has a zone").run_task(&task, None)?;
                }
                Ok(())
            },
            TaskData::default(),
            HostHooks::new().on_schedule(|_| Ok(())).on_cancel(|_| Ok(())),
        )
        .unwrap();
    *slot.borrow_mut() = Some(task.clone());

    zone.run_task(&task, None).unwrap();

    // Only the outer run moves the task through its states.
    assert_eq!(
        seen.borrow().as_slice(),
        [(TaskState::Running, 1), (TaskState::Running, 2)]
    );
    assert_eq!(task.state(), TaskState::NotScheduled);
    assert_eq!(zone.delegate().task_count(TaskType::MacroTask), 0);
    assert_eq!(
        log.borrow().as_slice(),
        [
            "watcher macroTask micro=false macro=true",
            "watcher macroTask micro=false macro=false",
        ]
    );
}

#[test]
fn run_guarded_rethrows_without_handler() {
    let runtime = Runtime::new();
    let zone = runtime.root().fork(ZoneSpec::new("plain")).unwrap();
    let err = zone
        .run_guarded(|| -> ZoneResult<()> { Err(ZoneError::callback("E")) })
        .unwrap_err();
    assert_eq!(err.to_string(), "E");
}

#[test]
fn sibling_invoke_hooks_are_isolated() {
    let runtime = Runtime::new();
    let output = new_log();

    let tagged = |tag: &'static str| {
        let sink = output.clone();
        runtime
            .root()
            .fork(ZoneSpec::new(tag).on_invoke(move |d, _, t, inv, s| {
                sink.borrow_mut().push(format!("[{tag}]"));
                d.invoke(t, inv, s)
            }))
            .unwrap()
    };
    let left = tagged("left");
    let right = tagged("right");

    let say = |out: &Log| -> ZoneResult<()> {
        out.borrow_mut().push("hello".to_string());
        Ok(())
    };
    left.run(|| say(&output)).unwrap();
    right.run(|| say(&output)).unwrap();

    assert_eq!(
        output.borrow().as_slice(),
        ["[left]", "hello", "[right]", "hello"]
    );
}

// ── Error routing ───────────────────────────────────────────────────

#[test]
fn handle_error_can_swallow_task_errors() {
    let runtime = Runtime::new();
    let handled = new_log();
    let sink = handled.clone();
    let zone = runtime
        .root()
        .fork(ZoneSpec::new("forgiving").on_handle_error(move |_, _, _, err| {
            sink.borrow_mut().push(err.to_string());
            false
        }))
        .unwrap();

    let task = zone
        .schedule_macro_task(
            "failing",
            |_| Err(ZoneError::callback("task failed")),
            TaskData::default(),
            HostHooks::new().on_schedule(|_| Ok(())),
        )
        .unwrap();

    zone.run_task(&task, None).unwrap();
    assert_eq!(handled.borrow().as_slice(), ["task failed"]);
    assert_eq!(task.state(), TaskState::NotScheduled);
}

#[test]
fn failing_schedule_hook_leaves_task_unknown() {
    let runtime = Runtime::new();
    let zone = runtime.root().fork(ZoneSpec::new("host")).unwrap();
    let task = Task::new(
        TaskType::MacroTask,
        "broken",
        Rc::new(|_: Option<&dyn std::any::Any>| Ok(())),
        TaskData::default(),
        HostHooks::new().on_schedule(|_| Err(ZoneError::callback("host refused"))),
    );

    let err = zone.schedule_task(task.clone()).unwrap_err();
    assert_eq!(err.to_string(), "host refused");
    assert_eq!(task.state(), TaskState::Unknown);
}

#[test]
fn failing_cancel_hook_leaves_task_unknown() {
    let runtime = Runtime::new();
    let handled = new_log();
    let sink = handled.clone();
    let zone = runtime
        .root()
        .fork(
            ZoneSpec::new("stubborn")
                .on_cancel_task(|_, _, _, _| Err(ZoneError::callback("cannot cancel")))
                .on_handle_error(move |_, _, _, err| {
                    sink.borrow_mut().push(err.to_string());
                    true
                }),
        )
        .unwrap();
    let log = new_log();
    let task = schedule_manual(&zone, "pinned", TaskData::default(), &log).unwrap();

    let err = zone.cancel_task(&task).unwrap_err();
    assert_eq!(err.to_string(), "cannot cancel");
    assert_eq!(task.state(), TaskState::Unknown);
    assert_eq!(handled.borrow().as_slice(), ["cannot cancel"]);
}

#[test]
fn macro_task_without_schedule_fn_is_rejected() {
    let runtime = Runtime::new();
    let err = runtime
        .root()
        .schedule_macro_task("bare", |_| Ok(()), TaskData::default(), HostHooks::new())
        .unwrap_err();
    assert_eq!(err.to_string(), "Task is missing scheduleFn: macroTask 'bare'");
}

#[test]
fn cancel_without_cancel_fn_is_rejected() {
    let runtime = Runtime::new();
    let task = runtime
        .root()
        .schedule_macro_task(
            "sticky",
            |_| Ok(()),
            TaskData::default(),
            HostHooks::new().on_schedule(|_| Ok(())),
        )
        .unwrap();
    let err = runtime.root().cancel_task(&task).unwrap_err();
    assert!(matches!(err, ZoneError::NotCancelable { .. }));
    assert_eq!(task.state(), TaskState::Unknown);
}

#[test]
fn canceled_timer_fired_late_is_skipped() {
    let runtime = Runtime::new();
    let zone = runtime.root().fork(ZoneSpec::new("late")).unwrap();
    let log = new_log();
    let task = schedule_manual(&zone, "late", TaskData::default(), &log).unwrap();
    zone.cancel_task(&task).unwrap();

    zone.run_task(&task, None).unwrap();
    assert!(log.borrow().is_empty());
    assert_eq!(task.state(), TaskState::NotScheduled);
}

// ── Built-in specs and configuration ────────────────────────────────

#[test]
fn tracker_and_sync_test_compose() {
    let (runtime, event_loop) = setup();
    let tracker = TaskTracker::new();
    let tracked = runtime.root().fork(tracker.zone_spec()).unwrap();
    let sync = tracked.fork(sync_test_zone_spec("compose")).unwrap();

    let err = sync
        .run(|| event_loop.set_timeout(|_| Ok(()), Duration::from_millis(1)))
        .unwrap_err();
    assert!(matches!(err, ZoneError::SyncTestViolation { .. }));
    assert!(tracker.is_empty());

    tracked
        .run(|| event_loop.set_timeout(|_| Ok(()), Duration::from_millis(1)))
        .unwrap();
    assert_eq!(tracker.tasks_for(TaskType::MacroTask).len(), 1);
    event_loop.run_until_idle().unwrap();
    assert!(tracker.is_empty());
}

#[test]
fn runtime_config_from_lookup_drives_runtime() {
    let config = RuntimeConfig::from_lookup(|key| match key {
        "ZONE_RT_ROOT_NAME" => Some("app".to_string()),
        "ZONE_RT_DISABLE_PATCHES" => Some("queue_microtask".to_string()),
        _ => None,
    })
    .unwrap();
    let runtime = Runtime::with_config(config);
    let event_loop = EventLoop::new(&runtime, EventLoopConfig::default()).unwrap();
    let zone = runtime.root().fork(ZoneSpec::new("ignored")).unwrap();

    let task = zone.run(|| event_loop.queue_microtask(|_| Ok(()))).unwrap();
    assert_eq!(runtime.root().name(), "app");
    assert_eq!(task.zone(), Some(runtime.root()));
    assert!(!runtime.is_patch_loaded("queue_microtask"));
}

#[test]
fn task_snapshot_reports_zone_and_state() {
    let (runtime, event_loop) = setup();
    let zone = runtime.root().fork(ZoneSpec::new("snap")).unwrap();
    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();
    let task = zone
        .run(|| {
            event_loop.set_interval(
                move |_| {
                    flag.set(true);
                    Ok(())
                },
                Duration::from_millis(3),
            )
        })
        .unwrap();

    let value = serde_json::to_value(task.snapshot()).unwrap();
    assert_eq!(value["zone"], "snap");
    assert_eq!(value["state"], "scheduled");
    assert_eq!(value["source"], "setInterval");
    assert_eq!(value["data"]["handleId"], 1);
    assert!(!fired.get());
}
