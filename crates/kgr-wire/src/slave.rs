//! The connecting side: a [`NamedServer`] whose services live on a master.
//!
//! `connect` opens a logical pipe to a service on the master. `register`
//! keeps the service locally and binds its path on the master, which then
//! forwards every connection to that path back here.

use crate::connection::{Connection, RequestHandler, Role};
use crate::crypto_socket::CryptoSocket;
use crate::message::{NetNotification, NetRequest, NetResponse};
use crate::socket::{Socket, StreamSocket};
use crate::{WireError, WireResult};
use async_trait::async_trait;
use kgr_kernel::{LocalNamedServer, LocalPipe, NamedServer, Pipe, Service};
use kgr_security::{AuthenticatorFactory, CredentialSlave, Crypto, Key, SlaveAuthenticator};
use kgr_types::config::{NetConfig, SecurityConfig};
use kgr_types::{KgrError, KgrPath, KgrResult};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Encryption and login settings for a slave.
pub struct SlaveSecurity {
    pub factory: AuthenticatorFactory,
    pub crypto: Arc<dyn Crypto>,
    /// Key the connection starts with. Must match the master's.
    pub default_key: Key,
}

impl SlaveSecurity {
    /// Derive the default key from the configured default password.
    pub fn from_config(
        crypto: Arc<dyn Crypto>,
        credentials: Arc<CredentialSlave>,
        config: &SecurityConfig,
    ) -> WireResult<Self> {
        let default_key = crypto.derive_key(&config.default_password, &config.salt)?;
        Ok(Self {
            factory: AuthenticatorFactory::for_slave(
                Arc::clone(&crypto),
                config.salt.clone(),
                credentials,
            ),
            crypto,
            default_key,
        })
    }
}

/// A named server reached over one connection to a master.
pub struct SlaveNetServer {
    conn: Arc<Connection>,
    local: Arc<LocalNamedServer>,
    auth: Option<Arc<SlaveAuthenticator>>,
}

impl SlaveNetServer {
    /// Dial `addr` and start serving.
    pub async fn connect(
        addr: &str,
        config: NetConfig,
        security: Option<SlaveSecurity>,
    ) -> WireResult<Arc<Self>> {
        info!("KGR: connecting to master at {}", addr);
        let stream = tokio::time::timeout(config.inactivity_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| WireError::Timeout(format!("connecting to {addr}")))??;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        Self::from_socket(Arc::new(StreamSocket::from_tcp(stream)), peer, config, security)
    }

    /// Serve over an already-connected socket.
    pub fn from_socket(
        socket: Arc<dyn Socket>,
        peer: String,
        config: NetConfig,
        security: Option<SlaveSecurity>,
    ) -> WireResult<Arc<Self>> {
        let (socket, auth) = match security {
            Some(security) => {
                let crypto_socket =
                    CryptoSocket::new(socket, security.crypto, security.default_key)?;
                let auth = security.factory.new_slave(crypto_socket.encryption())?;
                let socket: Arc<dyn Socket> = crypto_socket;
                (socket, Some(auth))
            }
            None => (socket, None),
        };
        let local = Arc::new(LocalNamedServer::new());
        let session = Arc::new(SlaveSession {
            local: Arc::clone(&local),
        });
        let conn = Connection::start(socket, config, peer, Role::Slave, session);
        Ok(Arc::new(Self { conn, local, auth }))
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Services registered from this side.
    pub fn local_server(&self) -> &Arc<LocalNamedServer> {
        &self.local
    }

    /// Log in as `account`, whose credentials must be known locally.
    ///
    /// On success both ends switch to the account's key and the master
    /// applies the account's policies to this connection.
    pub async fn authorize(&self, account: &str) -> KgrResult<()> {
        let auth = Arc::clone(self.auth.as_ref().ok_or_else(|| {
            KgrError::InvalidInput("authentication is not enabled".to_string())
        })?);
        // Argon2 keeps both ends busy; give the round trips the idle budget.
        let deadline = self.conn.config().inactivity_timeout();

        let nonce = match self
            .conn
            .request_within(NetRequest::AuthRequest, deadline)
            .await?
        {
            NetResponse::Challenge { nonce } => nonce,
            other => return Err(unexpected("auth_request", &other)),
        };

        let name = account.to_string();
        let pending = Arc::clone(&auth);
        let token = tokio::task::spawn_blocking(move || pending.initiate_login(&name, &nonce))
            .await
            .map_err(|e| KgrError::Internal(format!("login task failed: {e}")))??;

        let reply = self
            .conn
            .request_within(
                NetRequest::AuthResponse {
                    account: account.to_string(),
                    token,
                },
                deadline,
            )
            .await;
        match reply {
            Ok(NetResponse::Ack) => {
                auth.continue_login(true)?;
                info!(account = %account, "KGR: logged in");
                Ok(())
            }
            Ok(other) => {
                abandon_login(&auth, account);
                Err(unexpected("auth_response", &other))
            }
            Err(e) => {
                abandon_login(&auth, account);
                Err(e.into())
            }
        }
    }

    /// Account this connection is logged in as.
    pub fn account(&self) -> Option<String> {
        self.auth.as_ref().and_then(|auth| auth.account())
    }

    pub async fn close(&self) {
        self.conn.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }
}

/// Drop the pending login after the master said no.
fn abandon_login(auth: &SlaveAuthenticator, account: &str) {
    if let Err(e) = auth.continue_login(false) {
        debug!(account = %account, error = %e, "KGR: login abandoned");
    }
}

fn unexpected(request: &str, response: &NetResponse) -> KgrError {
    KgrError::Protocol(format!("unexpected reply to {request}: {response:?}"))
}

#[async_trait]
impl NamedServer for SlaveNetServer {
    async fn connect(&self, path: &KgrPath) -> KgrResult<Box<dyn Pipe>> {
        let reply = self
            .conn
            .request(NetRequest::Connect {
                service: path.clone(),
            })
            .await?;
        let NetResponse::Connected { pipe } = reply else {
            return Err(unexpected("connect", &reply));
        };
        let (app, net) = LocalPipe::pair();
        self.conn.attach_pipe(pipe, Box::new(net), true)?;
        self.conn.notify(NetNotification::Activate { pipe });
        debug!(pipe, path = %path, "KGR: remote pipe open");
        Ok(Box::new(app))
    }

    async fn register(&self, path: &KgrPath, service: Arc<dyn Service>) -> KgrResult<()> {
        self.local.register(path, service).await?;
        let reply = self
            .conn
            .request(NetRequest::Bind {
                service: path.clone(),
            })
            .await;
        match reply {
            Ok(NetResponse::Ack) => Ok(()),
            Ok(other) => {
                let _ = self.local.deregister(path).await;
                Err(unexpected("bind", &other))
            }
            Err(e) => {
                let _ = self.local.deregister(path).await;
                Err(e.into())
            }
        }
    }

    async fn registered(&self, path: &KgrPath) -> KgrResult<bool> {
        match self
            .conn
            .request(NetRequest::Bound {
                service: path.clone(),
            })
            .await?
        {
            NetResponse::Registered { registered } => Ok(registered),
            other => Err(unexpected("bound", &other)),
        }
    }

    async fn deregister(&self, path: &KgrPath) -> KgrResult<()> {
        match self
            .conn
            .request(NetRequest::Unbind {
                service: path.clone(),
            })
            .await?
        {
            NetResponse::Ack => self.local.deregister(path).await,
            other => Err(unexpected("unbind", &other)),
        }
    }
}

/// Answers the master's requests.
struct SlaveSession {
    local: Arc<LocalNamedServer>,
}

#[async_trait]
impl RequestHandler for SlaveSession {
    async fn handle(&self, conn: &Arc<Connection>, request: NetRequest) -> KgrResult<NetResponse> {
        match request {
            NetRequest::ConnectBack { pipe, service } => {
                let end = self.local.connect(&service).await?;
                conn.attach_pipe(pipe, end, true)?;
                debug!(pipe, path = %service, "KGR: master connected back");
                Ok(NetResponse::Ack)
            }
            other => Err(KgrError::InvalidInput(format!(
                "unexpected request from master: {other:?}"
            ))),
        }
    }

    async fn closed(&self, conn: &Arc<Connection>, reason: &KgrError) {
        info!(peer = %conn.peer(), reason = %reason, "KGR: disconnected from master");
    }
}
