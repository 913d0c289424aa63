//! Network side of ingestion: a nonblocking TCP dispatcher and the
//! per-worker I/O job that parses measurement lines and feeds the
//! scheduler.
//!
//! Backpressure: when the dispatch queue is full the connection is parked on
//! a busy list and no more bytes are read from it until the parked line goes
//! through. Parked connections are retried before any new socket work.

use std::collections::VecDeque;
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;

use crate::catalog::millis_now;
use crate::line::{find_line_end, LineParser};
use crate::pool::Job;
use crate::scheduler::{IoWorkerState, Scheduler};

/// Accepts connections and hands them to I/O workers round-robin. Workers
/// drive the accept loop themselves; there is no dedicated acceptor thread.
pub struct ConnDispatcher {
    listener: Mutex<TcpListener>,
    accepted: Mutex<Vec<VecDeque<TcpStream>>>,
    closed: AtomicBool,
    local_addr: SocketAddr,
}

impl ConnDispatcher {
    pub fn bind(addr: SocketAddr, n_workers: usize) -> anyhow::Result<Arc<Self>> {
        let listener = TcpListener::bind(addr)
            .with_context(|| format!("bind ingest listener [addr={addr}]"))?;
        listener
            .set_nonblocking(true)
            .context("set listener nonblocking")?;
        let local_addr = listener.local_addr().context("listener local addr")?;
        Ok(Arc::new(Self {
            listener: Mutex::new(listener),
            accepted: Mutex::new((0..n_workers.max(1)).map(|_| VecDeque::new()).collect()),
            closed: AtomicBool::new(false),
            local_addr,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drain the accept backlog, spreading connections across workers.
    /// Returns whether anything was accepted.
    fn accept_ready(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let Ok(listener) = self.listener.try_lock() else {
            return false;
        };
        let mut any = false;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let mut accepted = self.accepted.lock().unwrap();
                    let target = (0..accepted.len())
                        .min_by_key(|&w| accepted[w].len())
                        .unwrap_or(0);
                    accepted[target].push_back(stream);
                    tracing::debug!(%peer, worker = target, "ingest connection accepted");
                    any = true;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    break;
                }
            }
        }
        any
    }

    fn take_accepted(&self, worker_id: usize) -> Vec<TcpStream> {
        let mut accepted = self.accepted.lock().unwrap();
        accepted
            .get_mut(worker_id)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for ConnDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnDispatcher")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

struct ConnContext {
    stream: TcpStream,
    peer: String,
    buf: Vec<u8>,
    /// Parse position within `buf`.
    pos: usize,
    /// Waiting for dispatch-queue space; no reads until the line goes in.
    waiting_on_queue: bool,
    eof: bool,
    dead: bool,
}

enum IoOutcome {
    NeedsRead,
    QueueFull,
    Disconnect,
}

pub struct NetworkIoJob {
    worker_id: usize,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<ConnDispatcher>,
    parser: LineParser,
    conns: Vec<ConnContext>,
    state: IoWorkerState,
    max_line: usize,
    last_maintenance_ms: i64,
}

impl NetworkIoJob {
    pub fn new(
        worker_id: usize,
        scheduler: Arc<Scheduler>,
        dispatcher: Arc<ConnDispatcher>,
        parser: LineParser,
    ) -> Self {
        let max_line = scheduler.config().max_measurement_size;
        Self {
            worker_id,
            scheduler,
            dispatcher,
            parser,
            conns: Vec::new(),
            state: IoWorkerState::new(worker_id),
            max_line,
            last_maintenance_ms: 0,
        }
    }

    /// Parse and publish complete lines buffered on the context.
    fn process_buffered(&mut self, ctx: &mut ConnContext) -> IoOutcome {
        loop {
            let Some(end) = find_line_end(&ctx.buf, ctx.pos) else {
                // No complete line; an oversized partial one is fatal for
                // the connection.
                if ctx.buf.len() - ctx.pos > self.max_line {
                    tracing::error!(peer = %ctx.peer, "measurement exceeds maximum size");
                    return IoOutcome::Disconnect;
                }
                ctx.buf.drain(..ctx.pos);
                ctx.pos = 0;
                return IoOutcome::NeedsRead;
            };
            let mut line = &ctx.buf[ctx.pos..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if line.is_empty() {
                ctx.pos = end + 1;
                continue;
            }
            if line.len() > self.max_line {
                tracing::error!(peer = %ctx.peer, "measurement exceeds maximum size");
                return IoOutcome::Disconnect;
            }
            match self.parser.parse(line) {
                Ok(parsed) => {
                    if !self.scheduler.try_commit_row(&mut self.state, &parsed) {
                        // Queue full or writer busy: keep the buffered bytes
                        // and come back before the next poll.
                        ctx.waiting_on_queue = true;
                        return IoOutcome::QueueFull;
                    }
                }
                Err(err) => {
                    tracing::error!(
                        peer = %ctx.peer,
                        error = %format!("{err:#}"),
                        "could not parse measurement, skipping line"
                    );
                }
            }
            ctx.pos = end + 1;
        }
    }

    /// Read whatever the socket has, then process it.
    fn handle_io(&mut self, ctx: &mut ConnContext) -> IoOutcome {
        if !ctx.eof {
            let mut chunk = [0u8; 4096];
            loop {
                match ctx.stream.read(&mut chunk) {
                    Ok(0) => {
                        ctx.eof = true;
                        break;
                    }
                    Ok(n) => {
                        ctx.buf.extend_from_slice(&chunk[..n]);
                        if ctx.buf.len() - ctx.pos > self.max_line * 2 {
                            break;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::debug!(peer = %ctx.peer, error = %err, "connection read failed");
                        return IoOutcome::Disconnect;
                    }
                }
            }
        }
        match self.process_buffered(ctx) {
            IoOutcome::NeedsRead if ctx.eof => IoOutcome::Disconnect,
            outcome => outcome,
        }
    }

    fn maintenance(&mut self) -> bool {
        let now = millis_now();
        if now - self.last_maintenance_ms <= self.scheduler.config().maintenance_interval_ms {
            return false;
        }
        let busy = self.scheduler.run_idle_maintenance(&mut self.state, now);
        if !busy {
            self.last_maintenance_ms = now;
        }
        busy
    }
}

impl Job for NetworkIoJob {
    fn run(&mut self, _worker_id: usize) -> bool {
        let mut busy = false;
        let mut conns = std::mem::take(&mut self.conns);

        // Parked connections go first; a still-full queue parks them again
        // and nothing new is attempted for them.
        for ctx in conns.iter_mut().filter(|c| c.waiting_on_queue && !c.dead) {
            ctx.waiting_on_queue = false;
            match self.process_buffered(ctx) {
                IoOutcome::QueueFull => break,
                IoOutcome::Disconnect => ctx.dead = true,
                IoOutcome::NeedsRead => {
                    busy = true;
                    if ctx.eof {
                        ctx.dead = true;
                    }
                }
            }
        }

        if self.dispatcher.accept_ready() {
            busy = true;
        }
        for stream in self.dispatcher.take_accepted(self.worker_id) {
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string());
            conns.push(ConnContext {
                stream,
                peer,
                buf: Vec::with_capacity(4096),
                pos: 0,
                waiting_on_queue: false,
                eof: false,
                dead: false,
            });
            busy = true;
        }

        if self.dispatcher.is_closed() {
            for ctx in conns.iter_mut() {
                ctx.dead = true;
            }
        }

        for i in 0..conns.len() {
            let ctx = &mut conns[i];
            if ctx.dead || ctx.waiting_on_queue {
                continue;
            }
            match self.handle_io(ctx) {
                IoOutcome::NeedsRead => {}
                IoOutcome::QueueFull => busy = true,
                IoOutcome::Disconnect => {
                    tracing::debug!(peer = %conns[i].peer, "ingest connection closed");
                    conns[i].dead = true;
                    busy = true;
                }
            }
        }
        conns.retain(|c| !c.dead);
        self.conns = conns;

        if self.maintenance() {
            busy = true;
        }
        busy
    }

    fn on_close(&mut self) {
        tracing::info!(worker = self.worker_id, "network IO worker closing");
        self.conns.clear();
    }
}

impl std::fmt::Debug for NetworkIoJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkIoJob")
            .field("worker_id", &self.worker_id)
            .field("connections", &self.conns.len())
            .finish()
    }
}
