//! Standalone relay server: accepts connections on a port and relays each one
//! to a fixed target on a bounded pool of worker threads.

use crate::config::TunnelConfig;
use crate::error::{ProxyError, Result};
use crate::message::{HttpRequest, HttpResponse};
use crate::pool::WorkerPool;
use crate::relay::RelayConnection;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Points where a relayed exchange can be inspected or rewritten.
///
/// Both run on the worker thread, once per exchange, and default to doing
/// nothing.
pub trait RelayHooks: Send + Sync {
    /// Called after the request has been retargeted, before it is forwarded.
    fn on_request(&self, _request: &mut HttpRequest) {}

    /// Called after the response has been re-framed, before it is returned.
    fn on_response(&self, _response: &mut HttpResponse) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl RelayHooks for NoopHooks {}

pub struct TunnelServer {
    config: Arc<TunnelConfig>,
    hooks: Arc<dyn RelayHooks>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    listener: Mutex<Option<Arc<TcpListener>>>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
}

impl TunnelServer {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config: Arc::new(config),
            hooks: Arc::new(NoopHooks),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            listener: Mutex::new(None),
            pool: Mutex::new(None),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn RelayHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the server is listening on, once `start` has bound it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.listener).as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Binds the listening socket and runs the accept loop on the calling
    /// thread until [`TunnelServer::stop`] is called.
    ///
    /// Returns once the workers have finished their last relay. A `stop`
    /// that arrives before the socket is bound still ends this run.
    pub fn start(&self) -> Result<()> {
        let result = self.serve();
        self.stop_requested.store(false, Ordering::SeqCst);
        result
    }

    fn serve(&self) -> Result<()> {
        self.config.validate()?;

        let listener = Arc::new(bind_listener(self.config.listen_port, self.config.accept_backlog)?);
        let pool = Arc::new(WorkerPool::new(self.config.worker_pool_size)?);

        *lock(&self.pool) = Some(Arc::clone(&pool));
        *lock(&self.listener) = Some(Arc::clone(&listener));
        self.running.store(true, Ordering::SeqCst);
        // stop() sets the flag before clearing `running`; either it sees the
        // published listener or this check sees the flag
        if self.stop_requested.load(Ordering::SeqCst) {
            self.running.store(false, Ordering::SeqCst);
        }

        log::info!(
            "Tunnel listening on {} with {} workers, relaying to {}:{}",
            listener.local_addr()?,
            pool.size(),
            self.config.target_host,
            self.config.target_port
        );

        let result = self.accept_loop(&listener, &pool);

        self.running.store(false, Ordering::SeqCst);
        lock(&self.listener).take();
        drop(listener);
        pool.shutdown();
        pool.join();

        log::info!("Tunnel on port {} stopped", self.config.listen_port);
        result
    }

    fn accept_loop(&self, listener: &TcpListener, pool: &WorkerPool) -> Result<()> {
        while self.is_running() {
            let stream = match listener.accept() {
                Ok((stream, peer)) => {
                    log::debug!("Accepted connection from {}", peer);
                    stream
                }
                Err(e) if !self.is_running() => {
                    log::debug!("Accept interrupted by shutdown: {}", e);
                    break;
                }
                Err(e) => {
                    log::error!("Failed to accept connection: {}", e);
                    return Err(ProxyError::Accept(e));
                }
            };

            if !self.is_running() {
                drop(stream);
                break;
            }

            if let Err(e) = SockRef::from(&stream).set_keepalive(false) {
                log::debug!("Could not disable keep-alive: {}", e);
            }

            let connection = RelayConnection::new(stream, Arc::clone(&self.config), Arc::clone(&self.hooks));
            if pool
                .execute(move || {
                    let _ = connection.run();
                })
                .is_err()
            {
                break;
            }
        }
        Ok(())
    }

    /// Stops accepting connections and returns without waiting for relays
    /// already in progress. Called before `start` has bound its socket, it
    /// makes that `start` return as soon as it binds.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        if let Some(pool) = lock(&self.pool).take() {
            pool.shutdown();
        }

        if let Some(listener) = lock(&self.listener).take() {
            if SockRef::from(&*listener).shutdown(Shutdown::Both).is_err() {
                // some platforms refuse to shut down a listener; wake accept instead
                if let Ok(addr) = listener.local_addr() {
                    let _ = TcpStream::connect((Ipv4Addr::LOCALHOST, addr.port()));
                }
            }
        }
        log::info!("Tunnel stop requested");
    }
}

fn bind_listener(port: u16, backlog: u32) -> Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let bind_failed = |source: io::Error| ProxyError::Bind {
        address: addr.to_string(),
        source,
    };

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(bind_failed)?;
    socket.set_reuse_address(true).map_err(bind_failed)?;
    socket.bind(&addr.into()).map_err(bind_failed)?;
    socket
        .listen(i32::try_from(backlog).unwrap_or(i32::MAX))
        .map_err(bind_failed)?;

    Ok(socket.into())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
