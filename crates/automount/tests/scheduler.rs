use automount::sched::{Scheduler, TaskContext, TaskStatus, do_task_notify};
use nix::{
    sys::signal::{Signal, kill},
    unistd::getpid,
};
use std::{
    thread,
    time::{Duration, Instant},
};

#[derive(Default)]
struct Ctx {
    sched: Scheduler<Ctx>,
    statuses: Vec<(&'static str, TaskStatus)>,
}

impl TaskContext for Ctx {
    fn scheduler(&mut self) -> &mut Scheduler<Self> {
        &mut self.sched
    }
}

fn reap_all(ctx: &mut Ctx) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while ctx.sched.children() > 0 {
        assert!(Instant::now() < deadline, "children never exited");
        thread::sleep(Duration::from_millis(10));
        ctx.sched.sigchld();
    }
    do_task_notify(ctx);
}

// Both children live in one test so the wildcard waitpid in `sigchld`
// cannot reap a child belonging to another test.
#[test]
fn forked_tasks_report_exit_code_and_signal() {
    let mut ctx = Ctx::default();

    ctx.sched.run_task(
        true,
        || 2,
        Box::new(|c: &mut Ctx, st: TaskStatus| c.statuses.push(("exit", st))),
    );
    ctx.sched.run_task(
        true,
        || {
            let _ = kill(getpid(), Signal::SIGKILL);
            0
        },
        Box::new(|c: &mut Ctx, st: TaskStatus| c.statuses.push(("killed", st))),
    );
    assert_eq!(ctx.sched.children(), 2);

    reap_all(&mut ctx);

    ctx.statuses.sort_by_key(|(name, _)| *name);
    assert_eq!(
        ctx.statuses,
        vec![
            ("exit", TaskStatus { code: 2, signal: 0 }),
            ("killed", TaskStatus { code: 0, signal: 9 }),
        ]
    );
    assert_eq!(ctx.statuses[1].1.errno(), nix::errno::Errno::EINTR);
    assert_eq!(ctx.sched.pending(), 0);
}
