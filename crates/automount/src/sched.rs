//! Process and wait-channel task scheduler.
//!
//! Two primitives are offered on top of a single control thread:
//!
//! * [`Scheduler::run_task`] runs a closure in a forked child and queues a
//!   callback that receives its exit status once the child is reaped;
//! * [`Scheduler::sched_task`] parks a callback on a [`Wchan`] until some
//!   other part of the daemon calls [`Scheduler::wakeup`] on that channel.
//!
//! Jobs start out waiting, become ready when their child dies or their
//! channel is woken, and are dispatched in FIFO order by [`do_task_notify`].

use {
    crate::{mntfs::MntfsId, node::NodeId},
    log::{debug, error, warn},
    nix::{
        errno::Errno,
        sys::{
            signal::{SigSet, SigmaskHow, Signal, pthread_sigmask},
            wait::{WaitPidFlag, WaitStatus, waitpid},
        },
        unistd::{ForkResult, Pid, fork},
    },
    std::collections::VecDeque,
};

/// Something a job can sleep on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Wchan {
    /// A mount or unmount of this filesystem changed state
    Mntfs(MntfsId),
    /// A node was created, mounted or freed
    Node(NodeId),
}

/// Exit information handed to a job's callback.
///
/// Event-driven jobs always see a zero status.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskStatus {
    pub code: i32,
    pub signal: i32,
}

impl TaskStatus {
    pub fn success(&self) -> bool {
        self.code == 0 && self.signal == 0
    }

    /// Errno equivalent of a failed task. Killed tasks report `EINTR`.
    pub fn errno(&self) -> Errno {
        if self.signal != 0 {
            Errno::EINTR
        } else if self.code > 0 {
            Errno::from_raw(self.code)
        } else {
            Errno::EIO
        }
    }
}

pub type Callback<C> = Box<dyn FnOnce(&mut C, TaskStatus)>;

/// Implemented by the context that owns a scheduler so callbacks can be
/// handed the whole context.
pub trait TaskContext: Sized {
    fn scheduler(&mut self) -> &mut Scheduler<Self>;
}

struct Job<C> {
    pid: Option<Pid>,
    wchan: Option<Wchan>,
    status: TaskStatus,
    callback: Callback<C>,
}

pub struct Scheduler<C> {
    waiting: Vec<Job<C>>,
    ready: VecDeque<Job<C>>,
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl<C> Scheduler<C> {
    pub fn new() -> Scheduler<C> {
        Scheduler {
            waiting: Vec::new(),
            ready: VecDeque::new(),
        }
    }

    /// Park `callback` until `wchan` is woken.
    pub fn sched_task(&mut self, callback: Callback<C>, wchan: Wchan) {
        self.waiting.push(Job {
            pid: None,
            wchan: Some(wchan),
            status: TaskStatus::default(),
            callback,
        });
    }

    /// Make every job sleeping on `wchan` ready, preserving their order.
    pub fn wakeup(&mut self, wchan: Wchan) -> usize {
        let mut woken = 0;
        let mut i = 0;
        while i < self.waiting.len() {
            if self.waiting[i].wchan == Some(wchan) {
                let job = self.waiting.remove(i);
                self.ready.push_back(job);
                woken += 1;
            } else {
                i += 1;
            }
        }
        if woken == 0 {
            debug!("wakeup on {:?}: nobody waiting", wchan);
        }
        woken
    }

    /// Run `task` and arrange for `callback` to receive its exit status.
    ///
    /// With `background` the task runs in a forked child whose return value
    /// becomes the exit code; otherwise it runs here and the job is queued
    /// as ready immediately.
    #[allow(unsafe_code)]
    pub fn run_task<F>(&mut self, background: bool, task: F, callback: Callback<C>)
    where
        F: FnOnce() -> i32,
    {
        if !background {
            let code = task();
            self.ready.push_back(Job {
                pid: None,
                wchan: None,
                status: TaskStatus { code, signal: 0 },
                callback,
            });
            return;
        }

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        let mut old = SigSet::empty();
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut old)) {
            warn!("run_task: cannot block SIGCHLD: {}", e);
        }

        // The child only runs `task` and exits; it never returns into the
        // daemon.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old), None);
                unsafe { nix::libc::_exit(task()) }
            }
            Ok(ForkResult::Parent { child }) => {
                debug!("run_task: started child {}", child);
                self.waiting.push(Job {
                    pid: Some(child),
                    wchan: None,
                    status: TaskStatus::default(),
                    callback,
                });
            }
            Err(e) => {
                error!("run_task: fork: {}", e);
                self.ready.push_back(Job {
                    pid: None,
                    wchan: None,
                    status: TaskStatus {
                        code: e as i32,
                        signal: 0,
                    },
                    callback,
                });
            }
        }

        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old), None);
    }

    /// Reap every exited child and make the matching jobs ready.
    pub fn sigchld(&mut self) {
        loop {
            let (pid, status) =
                match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::Exited(pid, code)) => (pid, TaskStatus { code, signal: 0 }),
                    Ok(WaitStatus::Signaled(pid, sig, core)) => {
                        error!(
                            "Process {} exited with signal {}{}",
                            pid,
                            sig,
                            if core { " (core dumped)" } else { "" }
                        );
                        (
                            pid,
                            TaskStatus {
                                code: 0,
                                signal: sig as i32,
                            },
                        )
                    }
                    Ok(WaitStatus::StillAlive) => break,
                    Ok(_) => continue,
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => break,
                    Err(e) => {
                        error!("waitpid: {}", e);
                        break;
                    }
                };

            match self.waiting.iter().position(|j| j.pid == Some(pid)) {
                Some(i) => {
                    let mut job = self.waiting.remove(i);
                    job.status = status;
                    self.ready.push_back(job);
                }
                None => warn!("Unexpected child {} reaped", pid),
            }
        }
    }

    fn pop_ready(&mut self) -> Option<Job<C>> {
        self.ready.pop_front()
    }

    /// Jobs that have not run yet, waiting or ready.
    pub fn pending(&self) -> usize {
        self.waiting.len() + self.ready.len()
    }

    pub fn children(&self) -> usize {
        self.waiting.iter().filter(|j| j.pid.is_some()).count()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }
}

/// Dispatch ready jobs until the ready queue is empty.
///
/// The front of the queue is re-read after every callback, so jobs made
/// ready by a callback run after those that were already queued.
pub fn do_task_notify<C: TaskContext>(ctx: &mut C) -> usize {
    let mut count = 0;
    while let Some(job) = ctx.scheduler().pop_ready() {
        (job.callback)(ctx, job.status);
        count += 1;
    }
    count
}
