//! The accepting side: exposes a named server to every connected slave.
//!
//! Each connection gets its own view of the server. With security enabled the
//! view is a [`RestrictedNamedServer`] driven by that connection's
//! [`MasterAuthenticator`]: it starts with the default-account policies and
//! switches to an account's policies once that account logs in. Services a
//! slave binds are registered on the shared server and withdrawn when the
//! connection goes away.

use crate::connection::{Connection, RequestHandler, Role};
use crate::crypto_socket::CryptoSocket;
use crate::message::{NetRequest, NetResponse};
use crate::registry::{ConnectionEntry, ConnectionRegistry};
use crate::socket::{Socket, StreamSocket};
use crate::{WireError, WireResult};
use async_trait::async_trait;
use kgr_kernel::{NamedServer, Pipe, RestrictedNamedServer, Service};
use kgr_security::{AuthenticatorFactory, CredentialMaster, Crypto, Key, MasterAuthenticator};
use kgr_types::config::{NetConfig, SecurityConfig};
use kgr_types::{KgrError, KgrPath, KgrResult};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Encryption and login settings for a master.
pub struct MasterSecurity {
    pub factory: AuthenticatorFactory,
    pub crypto: Arc<dyn Crypto>,
    /// Key every connection starts with.
    pub default_key: Key,
}

impl MasterSecurity {
    /// Derive the default key from the configured default password.
    pub fn from_config(
        crypto: Arc<dyn Crypto>,
        credentials: Arc<CredentialMaster>,
        config: &SecurityConfig,
    ) -> WireResult<Self> {
        let default_key = crypto.derive_key(&config.default_password, &config.salt)?;
        Ok(Self {
            factory: AuthenticatorFactory::for_master(
                Arc::clone(&crypto),
                config.salt.clone(),
                credentials,
            ),
            crypto,
            default_key,
        })
    }
}

/// Serves a named server to remote slaves.
pub struct MasterNetServer {
    server: Arc<dyn NamedServer>,
    config: NetConfig,
    security: Option<MasterSecurity>,
    registry: ConnectionRegistry,
    local_addr: Option<SocketAddr>,
    stop: watch::Sender<bool>,
}

impl MasterNetServer {
    /// A master that only serves sockets handed to [`accept_socket`].
    ///
    /// [`accept_socket`]: MasterNetServer::accept_socket
    pub fn new(
        server: Arc<dyn NamedServer>,
        config: NetConfig,
        security: Option<MasterSecurity>,
    ) -> Arc<Self> {
        Arc::new(Self::build(server, config, security, None))
    }

    /// Bind `config.listen_addr` and start accepting connections.
    pub async fn start(
        server: Arc<dyn NamedServer>,
        config: NetConfig,
        security: Option<MasterSecurity>,
    ) -> WireResult<(Arc<Self>, tokio::task::JoinHandle<()>)> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "KGR: listening on {} (security {})",
            local_addr,
            if security.is_some() { "on" } else { "off" }
        );

        let master = Arc::new(Self::build(server, config, security, Some(local_addr)));
        let master_clone = Arc::clone(&master);
        let accept_handle = tokio::spawn(async move {
            master_clone.accept_loop(listener).await;
        });
        Ok((master, accept_handle))
    }

    fn build(
        server: Arc<dyn NamedServer>,
        config: NetConfig,
        security: Option<MasterSecurity>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            server,
            config,
            security,
            registry: ConnectionRegistry::new(),
            local_addr,
            stop,
        }
    }

    /// Address the listener is bound to, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn server(&self) -> &Arc<dyn NamedServer> {
        &self.server
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut stop = self.stop.subscribe();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = stop.changed() => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!("KGR: inbound connection from {}", addr);
                    let socket: Arc<dyn Socket> = Arc::new(StreamSocket::from_tcp(stream));
                    if let Err(e) = self.accept_socket(socket, addr.to_string()) {
                        warn!("KGR: rejected connection from {}: {}", addr, e);
                    }
                }
                Err(e) => {
                    error!("KGR: accept error: {}", e);
                }
            }
        }
        info!("KGR: accept loop stopped");
    }

    /// Serve one already-connected socket.
    pub fn accept_socket(
        &self,
        socket: Arc<dyn Socket>,
        peer: String,
    ) -> WireResult<Arc<Connection>> {
        let (socket, restricted, auth) = match &self.security {
            Some(security) => {
                let crypto_socket = CryptoSocket::new(
                    socket,
                    Arc::clone(&security.crypto),
                    security.default_key.clone(),
                )?;
                let restricted = Arc::new(RestrictedNamedServer::deny_all(Arc::clone(
                    &self.server,
                )));
                let auth = security
                    .factory
                    .new_master(crypto_socket.encryption(), Some(Arc::clone(&restricted)))?;
                let socket: Arc<dyn Socket> = crypto_socket;
                (socket, Some(restricted), Some(auth))
            }
            None => (socket, None, None),
        };

        let view: Arc<dyn NamedServer> = match &restricted {
            Some(restricted) => Arc::clone(restricted) as Arc<dyn NamedServer>,
            None => Arc::clone(&self.server),
        };
        let session = Arc::new(MasterSession {
            server: Arc::clone(&self.server),
            view,
            auth,
            bound: Mutex::new(BTreeSet::new()),
            registry: self.registry.clone(),
        });
        let conn = Connection::start(socket, self.config.clone(), peer, Role::Master, session);
        self.registry.add(ConnectionEntry::new(Arc::clone(&conn)));
        if conn.is_closed() {
            self.registry.remove(conn.id());
        }
        info!(conn = %conn.id(), peer = %conn.peer(), "KGR: slave connected");
        Ok(conn)
    }

    /// Stop accepting and close every live connection.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        for entry in self.registry.all() {
            entry.connection().close().await;
        }
    }
}

// ─── Per-connection state ───────────────────────────────────────────────────

struct MasterSession {
    /// The shared, unrestricted server.
    server: Arc<dyn NamedServer>,
    /// What this connection is allowed to see.
    view: Arc<dyn NamedServer>,
    auth: Option<Arc<MasterAuthenticator>>,
    /// Paths this connection has bound.
    bound: Mutex<BTreeSet<KgrPath>>,
    registry: ConnectionRegistry,
}

impl MasterSession {
    fn bound(&self) -> std::sync::MutexGuard<'_, BTreeSet<KgrPath>> {
        self.bound.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn authenticator(&self) -> KgrResult<&Arc<MasterAuthenticator>> {
        self.auth
            .as_ref()
            .ok_or_else(|| KgrError::InvalidInput("authentication is not enabled".to_string()))
    }
}

#[async_trait]
impl RequestHandler for MasterSession {
    async fn handle(&self, conn: &Arc<Connection>, request: NetRequest) -> KgrResult<NetResponse> {
        match request {
            NetRequest::Connect { service } => {
                let pipe = self.view.connect(&service).await?;
                // Held until the slave has its end in place.
                let id = conn.attach_new_pipe(pipe, false)?;
                conn.expire_unless_activated(id, conn.config().response_timeout());
                debug!(conn = %conn.id(), pipe = id, path = %service, "KGR: connect");
                Ok(NetResponse::Connected { pipe: id })
            }
            NetRequest::Bind { service } => {
                let remote = Arc::new(RemoteService {
                    conn: Arc::downgrade(conn),
                    path: service.clone(),
                });
                self.view.register(&service, remote).await?;
                info!(conn = %conn.id(), path = %service, "KGR: slave bound service");
                self.bound().insert(service);
                Ok(NetResponse::Ack)
            }
            NetRequest::Bound { service } => Ok(NetResponse::Registered {
                registered: self.view.registered(&service).await?,
            }),
            NetRequest::Unbind { service } => {
                if !self.bound().contains(&service) {
                    return Err(KgrError::NotFound(format!(
                        "{service} is not bound by this connection"
                    )));
                }
                self.view.deregister(&service).await?;
                self.bound().remove(&service);
                info!(conn = %conn.id(), path = %service, "KGR: slave unbound service");
                Ok(NetResponse::Ack)
            }
            NetRequest::AuthRequest => Ok(NetResponse::Challenge {
                nonce: self.authenticator()?.initiate_login(),
            }),
            NetRequest::AuthResponse { account, token } => {
                let auth = Arc::clone(self.authenticator()?);
                let name = account.clone();
                tokio::task::spawn_blocking(move || auth.continue_login(&name, &token))
                    .await
                    .map_err(|e| KgrError::Internal(format!("login task failed: {e}")))??;
                info!(conn = %conn.id(), account = %account, "KGR: slave logged in");
                self.registry.set_account(conn.id(), Some(account));
                Ok(NetResponse::Ack)
            }
            other @ (NetRequest::ConnectBack { .. } | NetRequest::Ping) => Err(
                KgrError::InvalidInput(format!("unexpected request from slave: {other:?}")),
            ),
        }
    }

    async fn closed(&self, conn: &Arc<Connection>, _reason: &KgrError) {
        let bound = std::mem::take(&mut *self.bound());
        for path in bound {
            if let Err(e) = self.server.deregister(&path).await {
                debug!(
                    conn = %conn.id(),
                    path = %path,
                    error = %e,
                    "KGR: bound service already gone"
                );
            }
        }
        self.registry.remove(conn.id());
    }
}

/// A service bound by a slave. Attaching forwards the pipe over the wire.
struct RemoteService {
    conn: Weak<Connection>,
    path: KgrPath,
}

#[async_trait]
impl Service for RemoteService {
    async fn attach(&self, pipe: Box<dyn Pipe>) -> KgrResult<()> {
        let Some(conn) = self.conn.upgrade() else {
            pipe.close();
            return Err(KgrError::AttachFailed(format!(
                "{} is served by a closed connection",
                self.path
            )));
        };
        let id = conn.attach_new_pipe(pipe, false)?;
        let reply = conn
            .request(NetRequest::ConnectBack {
                pipe: id,
                service: self.path.clone(),
            })
            .await;
        match reply {
            Ok(NetResponse::Ack) => {
                conn.activate(id);
                Ok(())
            }
            Ok(other) => {
                conn.abandon_pipe(id);
                Err(KgrError::Protocol(format!(
                    "unexpected reply to connect_back: {other:?}"
                )))
            }
            Err(WireError::Remote { code, message }) => {
                // The slave never attached, so the id is ours to reuse.
                conn.discard_pipe(id);
                Err(KgrError::AttachFailed(
                    crate::message::error_from_code(code, message).to_string(),
                ))
            }
            Err(e) => {
                conn.abandon_pipe(id);
                Err(KgrError::AttachFailed(e.to_string()))
            }
        }
    }
}
