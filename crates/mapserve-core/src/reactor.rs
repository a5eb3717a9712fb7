// src/reactor.rs
use crate::buffer::ReadStatus;
use crate::conn::{Conn, SlotState};
use crate::error::ServerResult;
use crate::pool::WorkerPool;
use crate::response::{Response, WriteProgress};
use crate::server::ServerContext;
use crate::slab::ConnRef;
use crate::syscalls::{EPOLLIN, EPOLLOUT, HANGUP_FLAGS, Interest, epoll_event};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};

/// Token of the listening socket; slot tokens never reach it.
pub const LISTENER_TOKEN: u64 = u64::MAX;

const MAX_EVENTS: usize = 1024;
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);
const METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// The single thread that owns readiness: it accepts, reads, writes and
/// tears down, and hands complete reads to the worker pool.
pub struct Reactor {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    pool: WorkerPool<ConnRef>,
    shutdown: Arc<AtomicBool>,
    events: Vec<epoll_event>,
}

impl Reactor {
    pub fn new(
        listener: TcpListener,
        ctx: Arc<ServerContext>,
        pool: WorkerPool<ConnRef>,
        shutdown: Arc<AtomicBool>,
    ) -> ServerResult<Self> {
        // Level-triggered: a backlog left behind is reported again.
        ctx.epoll.add(listener.as_raw_fd(), LISTENER_TOKEN, EPOLLIN)?;
        Ok(Self {
            listener,
            ctx,
            pool,
            shutdown,
            events: vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
        })
    }

    pub fn run(&mut self) -> ServerResult<()> {
        let timeout = self.ctx.config.poll_interval_ms.clamp(1, i32::MAX as u64) as i32;
        let idle = match self.ctx.config.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let mut last_prune = Instant::now();
        let mut last_metrics = last_prune;

        tracing::info!(
            addr = ?self.listener.local_addr().ok(),
            workers = self.pool.threads(),
            capacity = self.ctx.table.capacity(),
            "reactor running"
        );

        while !self.shutdown.load(Ordering::Acquire) {
            let now = match self.poll(timeout) {
                Ok(now) => now,
                Err(e) => {
                    tracing::error!(error = %e, "epoll wait failed");
                    self.stop();
                    return Err(e);
                }
            };

            if let Some(idle) = idle {
                if now.duration_since(last_prune) >= PRUNE_INTERVAL {
                    self.prune(now, idle);
                    last_prune = now;
                }
            }
            if now.duration_since(last_metrics) >= METRICS_INTERVAL {
                self.log_metrics();
                last_metrics = now;
            }
        }

        self.stop();
        Ok(())
    }

    /// Wait up to `timeout` ms once and handle every event reported.
    fn poll(&mut self, timeout: i32) -> ServerResult<Instant> {
        let n = self.ctx.epoll.wait(&mut self.events, timeout)?;
        let now = Instant::now();
        for i in 0..n {
            let event = self.events[i];
            let (token, flags) = (event.u64, event.events);
            if token == LISTENER_TOKEN {
                self.accept(now);
            } else {
                self.handle(ConnRef::from_token(token), flags, now);
            }
        }
        Ok(now)
    }

    fn accept(&self, now: Instant) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer, now),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr, now: Instant) {
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::warn!(%peer, error = %e, "cannot make socket non-blocking");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "TCP_NODELAY not set");
        }

        let fd = stream.as_raw_fd();
        let r = match self.ctx.table.allocate(stream, peer, now) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "rejecting connection");
                return;
            }
        };
        self.ctx.metrics.inc_conn();

        if let Err(e) = self.ctx.epoll.add(fd, r.token(), Interest::Read.one_shot()) {
            tracing::warn!(%peer, error = %e, "cannot register connection");
            if let Some(mut conn) = self.ctx.table.lock(r.index) {
                self.ctx.teardown(r.index, &mut conn);
            }
            return;
        }
        tracing::debug!(%peer, index = r.index, "accepted");
    }

    fn handle(&self, r: ConnRef, flags: u32, now: Instant) {
        let Some(mut conn) = self.ctx.table.lock(r.index) else {
            return;
        };
        if !r.matches(&conn) {
            self.ctx.metrics.inc_stale();
            tracing::trace!(index = r.index, "event for a closed connection");
            return;
        }

        if flags & HANGUP_FLAGS != 0 {
            tracing::trace!(peer = ?conn.peer(), flags, "peer hung up");
            self.ctx.teardown(r.index, &mut conn);
            return;
        }

        match conn.state {
            SlotState::Reading if flags & EPOLLIN != 0 => self.on_readable(r, conn, now),
            SlotState::Writing if flags & EPOLLOUT != 0 => self.on_writable(r, conn, now),
            state => tracing::trace!(index = r.index, ?state, flags, "unexpected event"),
        }
    }

    fn on_readable(&self, r: ConnRef, mut conn: MutexGuard<'_, Conn>, now: Instant) {
        match conn.read() {
            Ok(ReadStatus::Closed) => {
                tracing::trace!(peer = ?conn.peer(), "peer closed");
                self.ctx.teardown(r.index, &mut conn);
            }
            Err(e) => {
                tracing::debug!(peer = ?conn.peer(), error = %e, "read failed");
                self.ctx.teardown(r.index, &mut conn);
            }
            Ok(ReadStatus::Drained(0)) => self.ctx.rearm_or_close(r, &mut conn, Interest::Read),
            Ok(ReadStatus::Drained(_) | ReadStatus::Full(_)) => {
                conn.last_active = now;
                conn.state = SlotState::Queued;
                drop(conn);
                self.dispatch(r);
            }
        }
    }

    fn on_writable(&self, r: ConnRef, mut conn: MutexGuard<'_, Conn>, now: Instant) {
        let before = conn.response().map_or(0, Response::bytes_sent);
        let progress = conn.write();
        let after = conn.response().map_or(0, Response::bytes_sent);
        self.ctx.metrics.add_bytes(after.saturating_sub(before));
        conn.last_active = now;

        match progress {
            WriteProgress::WouldBlock => self.ctx.rearm_or_close(r, &mut conn, Interest::Write),
            WriteProgress::Failed(e) => {
                tracing::debug!(peer = ?conn.peer(), error = %e, "write failed");
                self.ctx.teardown(r.index, &mut conn);
            }
            WriteProgress::Complete => {
                let linger = conn.response().is_some_and(Response::keep_alive)
                    && !self.shutdown.load(Ordering::Acquire);
                if !linger {
                    self.ctx.teardown(r.index, &mut conn);
                    return;
                }

                if conn.reset_for_next() {
                    // Next request already buffered.
                    conn.state = SlotState::Queued;
                    drop(conn);
                    self.dispatch(r);
                } else {
                    conn.state = SlotState::Reading;
                    self.ctx.rearm_or_close(r, &mut conn, Interest::Read);
                }
            }
        }
    }

    /// Queue a slot already marked `Queued`. On a full queue the slot goes
    /// back to reading and the next bytes from the peer retry the dispatch.
    fn dispatch(&self, r: ConnRef) {
        let Err(r) = self.pool.submit(r) else {
            tracing::trace!(index = r.index, "dispatched");
            return;
        };

        self.ctx.metrics.inc_dropped();
        tracing::warn!(index = r.index, queued = self.pool.queued(), "request queue full, deferring");

        let Some(mut conn) = self.ctx.table.lock(r.index) else {
            return;
        };
        if !r.matches(&conn) || conn.state != SlotState::Queued {
            return;
        }
        conn.state = SlotState::Reading;
        self.ctx.rearm_or_close(r, &mut conn, Interest::Read);
    }

    /// Close connections waiting for request bytes longer than `idle`.
    /// Slots held by a worker are skipped.
    fn prune(&self, now: Instant, idle: Duration) {
        let mut pruned = 0usize;
        for index in 0..self.ctx.table.capacity() as u32 {
            let Some(mut conn) = self.ctx.table.try_lock(index) else {
                continue;
            };
            if conn.state == SlotState::Reading && now.duration_since(conn.last_active) > idle {
                tracing::debug!(peer = ?conn.peer(), "closing idle connection");
                self.ctx.teardown(index, &mut conn);
                pruned += 1;
            }
        }
        if pruned > 0 {
            tracing::info!(pruned, "pruned idle connections");
        }
    }

    fn log_metrics(&self) {
        let snap = self.ctx.metrics.snapshot();
        tracing::debug!(
            live = snap.live_conns,
            accepted = snap.accepted,
            requests = snap.requests,
            bytes_sent = snap.bytes_sent,
            dropped = snap.dropped,
            stale = snap.stale,
            "metrics"
        );
    }

    /// Stop the pool, then close every connection still open.
    fn stop(&mut self) {
        tracing::info!("shutting down");
        self.pool.shutdown();
        if let Err(e) = self.ctx.epoll.delete(self.listener.as_raw_fd()) {
            tracing::debug!(error = %e, "listener deregistration failed");
        }

        for index in 0..self.ctx.table.capacity() as u32 {
            if let Some(mut conn) = self.ctx.table.lock(index) {
                if conn.state != SlotState::Free {
                    self.ctx.teardown(index, &mut conn);
                }
            }
        }

        let snap = self.ctx.metrics.snapshot();
        tracing::info!(
            accepted = snap.accepted,
            requests = snap.requests,
            bytes_sent = snap.bytes_sent,
            dropped = snap.dropped,
            stale = snap.stale,
            "server stopped"
        );
    }
}
