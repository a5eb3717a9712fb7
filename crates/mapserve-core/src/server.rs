// src/server.rs
use crate::config::Config;
use crate::conn::{Conn, SlotState};
use crate::error::ServerResult;
use crate::http::HttpCode;
use crate::metrics::ServerMetrics;
use crate::pool::WorkerPool;
use crate::reactor::Reactor;
use crate::resolver::Resolver;
use crate::slab::{ConnRef, ConnectionTable};
use crate::syscalls::{Epoll, Interest};
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// State shared by the reactor thread and every worker.
pub struct ServerContext {
    pub epoll: Epoll,
    pub table: ConnectionTable,
    pub resolver: Resolver,
    pub metrics: ServerMetrics,
    pub config: Config,
}

impl ServerContext {
    pub fn new(config: Config) -> ServerResult<Self> {
        if !config.doc_root.is_dir() {
            tracing::warn!(doc_root = %config.doc_root.display(), "document root does not exist");
        }
        Ok(Self {
            epoll: Epoll::new()?,
            table: ConnectionTable::new(
                config.max_connections,
                config.read_buffer_size,
                config.max_upload_size,
            )?,
            resolver: Resolver::new(&config.doc_root, &config.upload_dir),
            metrics: ServerMetrics::new(),
            config,
        })
    }

    /// Re-enable the one-shot registration of `fd` in one direction.
    pub fn rearm(&self, fd: RawFd, conn: ConnRef, interest: Interest) -> ServerResult<()> {
        self.epoll.modify(fd, conn.token(), interest.one_shot())
    }

    /// Re-arm `conn`, or close it if the registration is gone.
    ///
    /// Called with the slot still locked: until the lock is released the
    /// slot cannot be torn down and its descriptor number cannot be reused,
    /// so the registration updated is always this connection's own.
    pub fn rearm_or_close(&self, r: ConnRef, conn: &mut Conn, interest: Interest) {
        let Some(fd) = conn.fd() else {
            return;
        };
        if let Err(e) = self.rearm(fd, r, interest) {
            tracing::warn!(index = r.index, error = %e, "re-arm failed, closing");
            self.teardown(r.index, conn);
        }
    }

    /// Deregister, close and free a connection. Its mapping and buffers go
    /// with it.
    pub fn teardown(&self, index: u32, conn: &mut Conn) {
        let peer = conn.peer();
        let served = conn.requests_served;
        let Some(stream) = self.table.release(index, conn) else {
            return;
        };
        if let Err(e) = self.epoll.delete(stream.as_raw_fd()) {
            tracing::debug!(index, error = %e, "epoll delete failed");
        }
        drop(stream);
        self.metrics.dec_conn();
        tracing::debug!(?peer, index, served, "connection closed");
    }

    /// Worker side of a dispatch: parse, resolve and build the response for
    /// a queued connection, then hand it back to the reactor.
    pub fn process(&self, r: ConnRef) {
        let Some(mut conn) = self.table.lock(r.index) else {
            return;
        };
        if !r.matches(&conn) || conn.state != SlotState::Queued {
            self.metrics.inc_stale();
            tracing::debug!(index = r.index, generation = r.generation, "dropping stale dispatch");
            return;
        }
        conn.state = SlotState::Processing;

        let code = match panic::catch_unwind(AssertUnwindSafe(|| conn.process(&self.resolver))) {
            Ok(code) => code,
            Err(_) => {
                tracing::error!(peer = ?conn.peer(), "request processing panicked");
                conn.fail(HttpCode::InternalError)
            }
        };

        let interest = if code == HttpCode::NoRequest {
            conn.state = SlotState::Reading;
            Interest::Read
        } else {
            self.metrics.inc_req();
            let req = conn.request();
            tracing::debug!(
                method = req.method.as_str(),
                path = %req.path,
                status = code.status(),
                "request resolved"
            );
            conn.state = SlotState::Writing;
            Interest::Write
        };

        self.rearm_or_close(r, &mut conn, interest);
    }
}

/// A bound listener plus its configuration, ready to run.
pub struct Server {
    listener: TcpListener,
    config: Config,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Bind `config.server_host:config.server_port`.
    pub fn bind(config: Config) -> ServerResult<Self> {
        let addr = config.server_addr();
        let listener = TcpListener::bind(&addr)?;
        tracing::info!(%addr, "listening");
        Self::from_listener(listener, config)
    }

    /// Serve on an already bound listener.
    pub fn from_listener(listener: TcpListener, config: Config) -> ServerResult<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Setting this flag makes [`Server::run`] drain and return.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run until the shutdown flag is set.
    ///
    /// The worker pool is created (and may fail) before the listener is
    /// registered, so no connection is accepted without workers to serve it.
    pub fn run(self) -> ServerResult<()> {
        let ctx = Arc::new(ServerContext::new(self.config)?);

        let worker_ctx = Arc::clone(&ctx);
        let pool = WorkerPool::new(
            ctx.config.worker_threads,
            ctx.config.max_requests,
            ctx.config.pin_workers,
            move |r: ConnRef| worker_ctx.process(r),
        )?;

        let mut reactor = Reactor::new(self.listener, ctx, pool, self.shutdown)?;
        reactor.run()
    }
}
