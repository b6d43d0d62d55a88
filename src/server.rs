// src/server.rs
//
// The reactor: owns the epoll set, accepts connections, classifies events,
// drives idle timeouts and shutdown. Client fds are registered one-shot, so
// whichever thread finishes a read or write must re-arm through `modfd`
// before anyone else can touch the connection.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use libc::c_int;

use crate::config::{ActorModel, Config};
use crate::db::DbPool;
use crate::error::{ServerError, ServerResult};
use crate::http_conn::{Direction, HttpConn, ProcessAction, ServeEnv, WriteOutcome};
use crate::queue::BlockQueue;
use crate::signals;
use crate::syscalls::{self, epoll_event, Epoll};
use crate::threadpool::{Job, WorkerPool};
use crate::timer::{TimerList, TIMESLOT};

/// Size of the connection table; slots are indexed by socket fd.
pub const MAX_FD: usize = 65536;
/// Events fetched per `epoll_wait`.
pub const MAX_EVENTS: usize = 10000;
const JOB_QUEUE_CAP: usize = 10000;

const BUSY_REPLY: &[u8] = b"Internal server busy";

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One connection-table entry. The mutex carries the state machine; the two
/// flags implement the timer/worker eviction handshake: `improv` marks a
/// worker as holding the connection, `timer_flag` defers an eviction to that
/// worker's exit.
pub struct ConnSlot {
    pub state: Mutex<HttpConn>,
    pub improv: AtomicBool,
    pub timer_flag: AtomicBool,
}

impl ConnSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(HttpConn::new()),
            improv: AtomicBool::new(false),
            timer_flag: AtomicBool::new(false),
        }
    }
}

/// Dense table indexed by socket fd, sized once at startup. Slots are
/// reinitialized on reuse, never freed.
pub struct ConnTable {
    slots: Box<[ConnSlot]>,
}

impl ConnTable {
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<ConnSlot> = (0..capacity).map(|_| ConnSlot::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn get(&self, slot: usize) -> &ConnSlot {
        &self.slots[slot]
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Shared state wired once at startup and passed by reference everywhere;
/// there are no singletons.
pub struct ServerCtx {
    pub epoll: Epoll,
    pub conns: ConnTable,
    pub users: Mutex<HashMap<String, String>>,
    pub db: DbPool,
    pub doc_root: PathBuf,
    pub conn_et: bool,
    pub model: ActorModel,
    pub user_count: AtomicUsize,
    pub timers: Mutex<TimerList>,
    pub jobs: Arc<BlockQueue<Job>>,
}

impl ServerCtx {
    fn serve_env(&self) -> ServeEnv<'_> {
        ServeEnv {
            doc_root: &self.doc_root,
            users: &self.users,
            backend: &self.db,
        }
    }

    /// Re-arm a one-shot client fd for its next direction. The only path by
    /// which anyone besides the reactor touches epoll state.
    pub fn modfd(&self, fd: c_int, ev: u32) {
        if let Err(e) = self
            .epoll
            .modify(fd, fd as u64, syscalls::conn_event_mask(ev, self.conn_et))
        {
            tracing::error!(fd, error = %e, "epoll rearm failed");
        }
    }

    pub fn enqueue(&self, slot: usize, direction: Direction) -> bool {
        self.jobs.push(Job { slot, direction }).is_ok()
    }

    /// Reset a connection's idle expiry after a successful read.
    pub fn bump_timer(&self, slot: usize) {
        self.timers
            .lock()
            .unwrap()
            .adjust(slot, now_secs() + 3 * TIMESLOT);
    }

    /// Take over a freshly accepted socket: initialize the slot, register
    /// one-shot readable, start its idle timer.
    pub fn register_connection(&self, fd: c_int, peer: SocketAddrV4) {
        let slot = fd as usize;
        let sl = self.conns.get(slot);
        sl.state.lock().unwrap().init(fd, peer, self.conn_et);
        sl.improv.store(false, Ordering::Release);
        sl.timer_flag.store(false, Ordering::Release);

        if let Err(e) = self.epoll.add(
            fd,
            fd as u64,
            syscalls::conn_event_mask(libc::EPOLLIN as u32, self.conn_et),
        ) {
            tracing::error!(fd, error = %e, "epoll registration failed");
            sl.state.lock().unwrap().take_fd();
            syscalls::close_fd(fd);
            return;
        }
        self.user_count.fetch_add(1, Ordering::AcqRel);
        self.timers
            .lock()
            .unwrap()
            .add(slot, now_secs() + 3 * TIMESLOT);
        tracing::info!(fd, peer = %peer, "client connected");
    }

    /// Evict a connection: unlink its timer, drop the epoll registration,
    /// close the socket. The slot stays allocated for reuse.
    pub fn close_connection(&self, slot: usize) {
        let (fd, peer) = {
            let mut conn = self.conns.get(slot).state.lock().unwrap();
            if !conn.is_active() {
                return;
            }
            (conn.take_fd(), conn.peer())
        };
        self.timers.lock().unwrap().remove(slot);
        let _ = self.epoll.delete(fd);
        syscalls::close_fd(fd);
        self.user_count.fetch_sub(1, Ordering::AcqRel);
        tracing::info!(fd, peer = ?peer, "connection closed");
    }

    fn process_and_rearm(&self, conn: &mut HttpConn) -> bool {
        match conn.process(&self.serve_env()) {
            ProcessAction::NeedMoreData => {
                self.modfd(conn.fd(), libc::EPOLLIN as u32);
                false
            }
            ProcessAction::ResponseReady => {
                self.modfd(conn.fd(), libc::EPOLLOUT as u32);
                false
            }
            ProcessAction::Close => true,
        }
    }

    fn write_and_rearm(&self, conn: &mut HttpConn) -> bool {
        match conn.write() {
            WriteOutcome::Again => {
                self.modfd(conn.fd(), libc::EPOLLOUT as u32);
                false
            }
            WriteOutcome::Complete { keep_alive: true } => {
                self.modfd(conn.fd(), libc::EPOLLIN as u32);
                false
            }
            WriteOutcome::Complete { keep_alive: false } | WriteOutcome::Error => true,
        }
    }

    /// Worker entry point. The improv/timer_flag handshake brackets the
    /// actual work so a concurrent eviction is deferred to this exit path
    /// instead of racing the worker.
    pub fn run_job(&self, job: Job) {
        let sl = self.conns.get(job.slot);
        sl.improv.store(true, Ordering::Release);

        let close = {
            let mut conn = sl.state.lock().unwrap();
            if !conn.is_active() {
                false
            } else {
                match (self.model, job.direction) {
                    // proactor: the reactor already did the socket read
                    (ActorModel::Proactor, _) => self.process_and_rearm(&mut conn),
                    (ActorModel::Reactor, Direction::Read) => {
                        if conn.read_once() {
                            self.bump_timer(job.slot);
                            self.process_and_rearm(&mut conn)
                        } else {
                            true
                        }
                    }
                    (ActorModel::Reactor, Direction::Write) => self.write_and_rearm(&mut conn),
                }
            }
        };
        if close {
            self.close_connection(job.slot);
        }

        sl.improv.store(false, Ordering::Release);
        if sl.timer_flag.swap(false, Ordering::AcqRel) {
            self.close_connection(job.slot);
        }
    }
}

/// Reactor-side readiness handling; one implementation per concurrency
/// model, chosen at startup. The connection state machine is identical in
/// both.
pub trait DispatchModel: Send + Sync {
    fn on_readable(&self, ctx: &ServerCtx, slot: usize);
    fn on_writable(&self, ctx: &ServerCtx, slot: usize);
}

/// The reactor thread performs the socket I/O and hands completed buffers
/// to the workers.
pub struct Proactor;

impl DispatchModel for Proactor {
    fn on_readable(&self, ctx: &ServerCtx, slot: usize) {
        let ok = {
            let mut conn = ctx.conns.get(slot).state.lock().unwrap();
            conn.is_active() && conn.read_once()
        };
        if !ok {
            ctx.close_connection(slot);
            return;
        }
        ctx.bump_timer(slot);
        if !ctx.enqueue(slot, Direction::Read) {
            tracing::warn!(slot, "job queue full, dropping request");
            ctx.close_connection(slot);
        }
    }

    fn on_writable(&self, ctx: &ServerCtx, slot: usize) {
        let close = {
            let mut conn = ctx.conns.get(slot).state.lock().unwrap();
            if !conn.is_active() {
                return;
            }
            ctx.write_and_rearm(&mut conn)
        };
        if close {
            ctx.close_connection(slot);
        }
    }
}

/// Workers perform the socket I/O themselves; the reactor only queues the
/// bare readiness event.
pub struct Reactor;

impl DispatchModel for Reactor {
    fn on_readable(&self, ctx: &ServerCtx, slot: usize) {
        if !ctx.enqueue(slot, Direction::Read) {
            tracing::warn!(slot, "job queue full, dropping request");
            ctx.close_connection(slot);
        }
    }

    fn on_writable(&self, ctx: &ServerCtx, slot: usize) {
        if !ctx.enqueue(slot, Direction::Write) {
            tracing::warn!(slot, "job queue full, dropping request");
            ctx.close_connection(slot);
        }
    }
}

pub fn dispatch_model(model: ActorModel) -> Box<dyn DispatchModel> {
    match model {
        ActorModel::Proactor => Box::new(Proactor),
        ActorModel::Reactor => Box::new(Reactor),
    }
}

pub struct WebServer {
    ctx: Arc<ServerCtx>,
    dispatch: Box<dyn DispatchModel>,
    pool: WorkerPool,
    listen_fd: c_int,
    sig_read_fd: c_int,
    listen_et: bool,
    stop: bool,
    timeout: bool,
}

impl WebServer {
    /// Wire every component: database pool, credentials preload, listen
    /// socket, epoll, signal bridge, worker pool. Any failure here is fatal.
    pub fn new(cfg: Config) -> ServerResult<Self> {
        let db = DbPool::connect(&cfg.database_url, cfg.sql_conns)?;
        let users = db.load_users()?;
        tracing::info!(users = users.len(), "credentials preloaded");

        let epoll = Epoll::new().map_err(ServerError::Epoll)?;
        let listen_fd = syscalls::create_listen_socket(cfg.port, cfg.graceful_linger)
            .map_err(ServerError::Listen)?;
        epoll
            .add(
                listen_fd,
                listen_fd as u64,
                syscalls::listen_event_mask(cfg.listen_et),
            )
            .map_err(ServerError::Epoll)?;

        let sig_read_fd = signals::install().map_err(ServerError::Signals)?;
        epoll
            .add(sig_read_fd, sig_read_fd as u64, libc::EPOLLIN as u32)
            .map_err(ServerError::Epoll)?;

        let jobs = Arc::new(BlockQueue::new(JOB_QUEUE_CAP));
        let ctx = Arc::new(ServerCtx {
            epoll,
            conns: ConnTable::new(MAX_FD),
            users: Mutex::new(users),
            db,
            doc_root: cfg.doc_root.clone(),
            conn_et: cfg.conn_et,
            model: cfg.model,
            user_count: AtomicUsize::new(0),
            timers: Mutex::new(TimerList::new()),
            jobs,
        });

        let pool = WorkerPool::spawn(Arc::clone(&ctx), cfg.worker_threads)?;
        signals::arm_alarm(TIMESLOT);
        tracing::info!(
            port = cfg.port,
            workers = cfg.worker_threads,
            model = ?cfg.model,
            "listening"
        );

        Ok(Self {
            ctx,
            dispatch: dispatch_model(cfg.model),
            pool,
            listen_fd,
            sig_read_fd,
            listen_et: cfg.listen_et,
            stop: false,
            timeout: false,
        })
    }

    /// The blocking event loop. Returns on SIGTERM (clean shutdown) or a
    /// fatal epoll error; per-connection failures never get here.
    pub fn run(&mut self) -> ServerResult<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        while !self.stop {
            let n = self.ctx.epoll.wait(&mut events, -1)?;
            for i in 0..n {
                let fd = events[i].u64 as c_int;
                let ev = events[i].events;

                if fd == self.listen_fd {
                    self.accept_clients();
                } else if fd == self.sig_read_fd && ev & libc::EPOLLIN as u32 != 0 {
                    self.drain_signals();
                } else if ev & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
                    // peer hung up or the socket errored out
                    self.ctx.close_connection(fd as usize);
                } else if ev & libc::EPOLLIN as u32 != 0 {
                    self.dispatch.on_readable(&self.ctx, fd as usize);
                } else if ev & libc::EPOLLOUT as u32 != 0 {
                    self.dispatch.on_writable(&self.ctx, fd as usize);
                }
            }

            if self.timeout {
                self.sweep_expired();
                signals::arm_alarm(TIMESLOT);
                self.timeout = false;
            }
        }
        self.shutdown();
        Ok(())
    }

    fn accept_clients(&self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => {
                    if (fd as usize) >= self.ctx.conns.capacity()
                        || self.ctx.user_count.load(Ordering::Acquire) >= MAX_FD
                    {
                        tracing::warn!(fd, "connection table full, rejecting");
                        let _ = syscalls::send_nonblocking(fd, BUSY_REPLY);
                        syscalls::close_fd(fd);
                    } else {
                        self.ctx.register_connection(fd, peer);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    break;
                }
            }
            if !self.listen_et {
                // LT: one accept per notification; epoll re-reports the rest
                break;
            }
        }
    }

    fn drain_signals(&mut self) {
        for sig in signals::drain(self.sig_read_fd) {
            match sig {
                libc::SIGALRM => self.timeout = true,
                libc::SIGTERM => {
                    tracing::info!("SIGTERM received");
                    self.stop = true;
                }
                _ => {}
            }
        }
    }

    /// Expire idle connections. A connection currently held by a worker gets
    /// `timer_flag` instead of an immediate close; the worker performs the
    /// close on its way out.
    fn sweep_expired(&self) {
        let expired = self.ctx.timers.lock().unwrap().tick(now_secs());
        for slot in expired {
            let sl = self.ctx.conns.get(slot);
            if sl.improv.load(Ordering::Acquire) {
                sl.timer_flag.store(true, Ordering::Release);
            } else {
                tracing::info!(slot, "idle timeout, evicting");
                self.ctx.close_connection(slot);
            }
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("draining workers");
        self.pool.shutdown();
        for slot in 0..self.ctx.conns.capacity() {
            self.ctx.close_connection(slot);
        }
        syscalls::close_fd(self.listen_fd);
        syscalls::close_fd(self.sig_read_fd);
        tracing::info!("shutdown complete");
    }
}
