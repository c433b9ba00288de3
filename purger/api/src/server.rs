use crate::Body;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper_util::{
    rt::TokioIo,
    server::{conn::auto, graceful::GracefulShutdown},
    service::TowerToHyperService,
};
use parking_lot::Mutex;
use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{net::TcpListener, sync::oneshot, task::JoinSet};
use tracing::{debug, info, instrument, warn};

/// Delay before accepting again after an accept error, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum Error {
    #[error("server has not been started")]
    NotStarted,

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server has already been stopped")]
    AlreadyStopped,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Serves HTTP/1 and cleartext HTTP/2 until stopped.
///
/// A server runs at most once. It stops when [`Server::stop`] is called or when the process begins
/// draining, after which in-flight requests are given up to the shutdown timeout to complete. Requests
/// still running after the timeout are cancelled.
#[derive(Debug)]
pub struct Server {
    addr: SocketAddr,
    shutdown_timeout: Duration,
    state: Mutex<State>,
}

#[derive(Debug)]
enum State {
    Pending,
    Running {
        local_addr: SocketAddr,
        shutdown: oneshot::Sender<()>,
    },
    Stopped,
}

/// Runs connection and HTTP/2 stream tasks so that they can be aborted together.
#[derive(Clone, Debug, Default)]
struct Tasks(Arc<Mutex<JoinSet<()>>>);

// === impl Server ===

impl Server {
    pub fn new(addr: SocketAddr, shutdown_timeout: Duration) -> Self {
        Self {
            addr,
            shutdown_timeout,
            state: Mutex::new(State::Pending),
        }
    }

    /// The address the server is bound to, once it is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *self.state.lock() {
            State::Running { local_addr, .. } => Some(local_addr),
            State::Pending | State::Stopped => None,
        }
    }

    /// Initiates a graceful shutdown of a running server.
    pub fn stop(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, State::Stopped) {
            State::Pending => {
                *state = State::Pending;
                Err(Error::NotStarted)
            }
            State::Running { shutdown, .. } => {
                // The server may already be draining, in which case the receiver is gone.
                let _ = shutdown.send(());
                Ok(())
            }
            State::Stopped => Err(Error::AlreadyStopped),
        }
    }

    /// Binds the server's address and serves `svc` until the server is stopped or `drain` is
    /// signaled.
    #[instrument(skip_all, fields(addr = %self.addr))]
    pub async fn serve<S>(&self, svc: S, drain: drain::Watch) -> Result<(), Error>
    where
        S: tower::Service<Request<Incoming>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let listener = {
            match *self.state.lock() {
                State::Pending => {}
                State::Running { .. } => return Err(Error::AlreadyRunning),
                State::Stopped => return Err(Error::AlreadyStopped),
            }

            let listener = TcpListener::bind(self.addr)
                .await
                .map_err(|source| Error::Bind {
                    addr: self.addr,
                    source,
                })?;
            let local_addr = listener.local_addr().map_err(|source| Error::Bind {
                addr: self.addr,
                source,
            })?;

            let mut state = self.state.lock();
            if !matches!(*state, State::Pending) {
                return Err(Error::AlreadyRunning);
            }
            *state = State::Running {
                local_addr,
                shutdown: shutdown_tx,
            };
            info!(%local_addr, "HTTP server listening");
            listener
        };

        let tasks = Tasks::default();
        let builder = auto::Builder::new(tasks.clone());
        let graceful = GracefulShutdown::new();
        let drained = drain.signaled();
        tokio::pin!(drained);

        let release = loop {
            tokio::select! {
                res = listener.accept() => {
                    let (io, client) = match res {
                        Ok(conn) => conn,
                        Err(error) => {
                            warn!(%error, "Failed to accept connection");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let conn = builder.serve_connection_with_upgrades(
                        TokioIo::new(io),
                        TowerToHyperService::new(svc.clone()),
                    );
                    let conn = graceful.watch(conn.into_owned());
                    tasks.reap();
                    tasks.spawn(async move {
                        if let Err(error) = conn.await {
                            debug!(%client, %error, "Connection closed");
                        }
                    });
                }

                _ = &mut shutdown_rx => {
                    info!("Stopping HTTP server");
                    break None;
                }

                release = &mut drained => {
                    info!("Draining HTTP server");
                    break Some(release);
                }
            }
        };
        drop(listener);

        let timeout = self.shutdown_timeout;
        let shutdown = async move {
            tokio::select! {
                _ = graceful.shutdown() => debug!("All connections closed"),
                _ = tokio::time::sleep(timeout) => {
                    warn!(?timeout, "Timed out waiting for connections to close");
                    tasks.abort().await;
                }
            }
        };
        match release {
            Some(release) => release.release_after(shutdown).await,
            None => shutdown.await,
        }

        *self.state.lock() = State::Stopped;
        info!("HTTP server stopped");
        Ok(())
    }
}

// === impl Tasks ===

impl Tasks {
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.0.lock().spawn(fut);
    }

    /// Drops the handles of completed tasks.
    fn reap(&self) {
        let mut tasks = self.0.lock();
        while tasks.try_join_next().is_some() {}
    }

    /// Cancels all running tasks and waits for them to be dropped.
    async fn abort(&self) {
        let mut tasks = std::mem::take(&mut *self.0.lock());
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

impl<F> hyper::rt::Executor<F> for Tasks
where
    F: Future<Output = ()> + Send + 'static,
{
    fn execute(&self, fut: F) {
        self.spawn(fut);
    }
}
