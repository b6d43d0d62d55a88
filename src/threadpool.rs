// src/threadpool.rs

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::http_conn::Direction;
use crate::server::ServerCtx;

/// One unit of work for a worker: which connection, and which way the data
/// flows. In proactor mode the reactor has already performed the socket
/// read before queueing.
#[derive(Debug, Clone, Copy)]
pub struct Job {
    pub slot: usize,
    pub direction: Direction,
}

/// Fixed pool of workers draining the shared bounded job queue. Workers
/// never accept connections and never touch epoll state except through the
/// re-arm helper on a connection they currently hold.
pub struct WorkerPool {
    ctx: Arc<ServerCtx>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(ctx: Arc<ServerCtx>, threads: usize) -> io::Result<Self> {
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut handles = Vec::with_capacity(threads);

        for i in 0..threads {
            let worker_ctx = Arc::clone(&ctx);
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };

            let handle = thread::Builder::new()
                .name(format!("nocturne-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            tracing::debug!(worker = i, core = id.id, "worker pinned");
                        }
                    }
                    while let Some(job) = worker_ctx.jobs.pop() {
                        worker_ctx.run_job(job);
                    }
                    tracing::debug!(worker = i, "worker exiting");
                })?;
            handles.push(handle);
        }

        Ok(Self { ctx, handles })
    }

    /// Close the queue, let pending jobs drain, join every worker.
    pub fn shutdown(&mut self) {
        self.ctx.jobs.close();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
