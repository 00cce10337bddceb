//! Wiring between a mux, the fd table and the scheduler: the io tasklet a
//! poller event wakes, the timeout task, and the thread-takeover protocol.

use std::sync::Arc;

use strand_sched::{Activity, FdHandler, FdTab, Scheduler, TaskAction, TaskRef, state, tid_bit};
use strand_timing::now_ms;
use tracing::debug;

use crate::{conn_stream::StreamLayer, mux::Mux};

pub type SharedMux = Arc<spin::Mutex<dyn Mux + Send>>;
pub type SharedUp = Arc<spin::Mutex<dyn StreamLayer + Send>>;

/// Handles created for one wired connection.
pub struct ConnWiring {
    pub fd: i32,
    pub tasklet: TaskRef,
    pub timer: TaskRef,
}

/// FD events just wake the connection's io tasklet; all protocol work runs
/// in the scheduler, not in the poller.
struct ConnIo {
    sched: Arc<Scheduler>,
    tasklet: TaskRef,
}

impl FdHandler for ConnIo {
    fn io_event(&self, _fd: i32) {
        self.sched.tasklet_wakeup(&self.tasklet);
    }
}

fn make_timer(
    sched: &Arc<Scheduler>,
    tab: &Arc<FdTab>,
    tid: usize,
    fd: i32,
    mux: SharedMux,
) -> TaskRef {
    let tab = tab.clone();
    let mux_for_timer = mux.clone();
    let timer = sched.task_new(
        tid_bit(tid),
        0,
        Arc::new(move |t: &TaskRef, _s: u32| {
            let now = now_ms();
            let (release, next) = {
                let mut m = mux_for_timer.lock();
                (m.timeout_fired(now), m.next_expire())
            };
            if release {
                debug!(fd, "connection timed out, releasing");
                tab.delete(fd);
                return TaskAction::Destroy;
            }
            t.set_expire(next);
            TaskAction::Keep
        }),
    );
    timer.set_expire(mux.lock().next_expire());
    timer
}

/// Wires a mux into the engine on thread `tid`. Must run on that thread so
/// the timer lands in the local wait queue. `after` runs after each io pass
/// with no lock held; the upper layer drains its pending wakes there.
pub fn wire_conn(
    sched: &Arc<Scheduler>,
    tab: &Arc<FdTab>,
    tid: usize,
    fd: i32,
    mux: SharedMux,
    up: SharedUp,
    after: Arc<dyn Fn() + Send + Sync>,
) -> ConnWiring {
    let timer = make_timer(sched, tab, tid, fd, mux.clone());

    let tasklet = {
        let sched2 = sched.clone();
        let tab2 = tab.clone();
        let mux2 = mux.clone();
        let timer2 = timer.clone();
        sched.tasklet_new(tid, Arc::new(move |_t: &TaskRef, _s: u32| {
            let alive = {
                let mut m = mux2.lock();
                let mut u = up.lock();
                m.wake(&mut *u)
            };
            after();
            if alive {
                let exp = mux2.lock().next_expire();
                timer2.set_expire(exp);
                sched2.task_queue(&timer2);
            } else {
                debug!(fd, "connection dead, releasing");
                Activity::bump(&sched2.activity(tid).conn_dead);
                tab2.delete(fd);
                sched2.task_destroy(&timer2);
            }
            TaskAction::Keep
        }))
    };

    tab.insert(fd, fd as u64, Arc::new(ConnIo { sched: sched.clone(), tasklet: tasklet.clone() }), tid_bit(tid));
    tab.want_recv(fd);
    sched.task_queue(&timer);

    ConnWiring { fd, tasklet, timer }
}

/// Moves a wired connection to another thread: CAS the fd's thread bits,
/// rebuild the io tasklet on the new thread, replace the timer task, then
/// re-subscribe to reads. On failure the connection is flagged errored and
/// the next wake tears it down.
pub fn takeover_conn(
    sched: &Arc<Scheduler>,
    tab: &Arc<FdTab>,
    wiring: ConnWiring,
    mux: SharedMux,
    up: SharedUp,
    after: Arc<dyn Fn() + Send + Sync>,
    new_tid: usize,
) -> Result<ConnWiring, ConnWiring> {
    if !mux.lock().takeover(tab, new_tid) {
        return Err(wiring);
    }
    let fd = wiring.fd;

    // the old timer dies; the old tasklet becomes unreachable once the fd
    // handler is replaced
    sched.task_destroy(&wiring.timer);

    let timer = make_timer(sched, tab, new_tid, fd, mux.clone());
    let tasklet = {
        let sched2 = sched.clone();
        let tab2 = tab.clone();
        let mux2 = mux.clone();
        let timer2 = timer.clone();
        sched.tasklet_new(new_tid, Arc::new(move |_t: &TaskRef, _s: u32| {
            let alive = {
                let mut m = mux2.lock();
                let mut u = up.lock();
                m.wake(&mut *u)
            };
            after();
            if alive {
                let exp = mux2.lock().next_expire();
                timer2.set_expire(exp);
                sched2.task_queue(&timer2);
            } else {
                Activity::bump(&sched2.activity(new_tid).conn_dead);
                tab2.delete(fd);
                sched2.task_destroy(&timer2);
            }
            TaskAction::Keep
        }))
    };

    tab.insert(fd, fd as u64, Arc::new(ConnIo { sched: sched.clone(), tasklet: tasklet.clone() }), tid_bit(new_tid));
    tab.want_recv(fd);
    // first fire re-queues the timer from its owning thread
    sched.task_wakeup(&timer, state::WOKEN_INIT);

    Ok(ConnWiring { fd, tasklet, timer })
}
