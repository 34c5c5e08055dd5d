//! Integration tests for master/slave networking.
//!
//! A real master listens on an ephemeral TCP port and real slaves dial it.
//! Services run inline on the thread that delivers their data, so no
//! executor is needed beyond the test runtime. The heartbeat test scripts the
//! master side by hand to get a peer that answers once and then goes quiet.

use async_trait::async_trait;
use bytes::BytesMut;
use kgr_kernel::{
    ContextFlow, ContextManager, ContextService, LocalNamedServer, NamedServer, Pipe, Service,
    ServiceContext,
};
use kgr_security::{AesGcmCrypto, CredentialMaster, CredentialSlave, Crypto};
use kgr_types::config::{AccountPolicies, KdfConfig, NetConfig, SecurityConfig};
use kgr_types::{ErrorKind, KgrPath, KgrResult, KgrValue, RestrictionPolicy};
use kgr_wire::message::{decode_frame, encode_frame, NetFrameKind};
use kgr_wire::{
    MasterNetServer, MasterSecurity, NetFrame, NetNotification, NetRequest, NetResponse,
    SlaveNetServer, SlaveSecurity, Socket, StreamSocket,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Echo;

impl ServiceContext for Echo {
    fn run(&mut self, pipe: &dyn Pipe) -> KgrResult<ContextFlow> {
        while let Some(message) = pipe.read_optional() {
            pipe.write(message)?;
        }
        Ok(ContextFlow::Continue)
    }
}

fn echo_service() -> Arc<dyn Service> {
    let manager = ContextManager::new();
    let runner = manager.clone();
    manager.set_activation_listener(Some(Arc::new(move || runner.run())));
    Arc::new(ContextService::new(manager, || {
        Ok(Box::new(Echo) as Box<dyn ServiceContext>)
    }))
}

fn p(s: &str) -> KgrPath {
    KgrPath::parse(s).unwrap()
}

fn net_config() -> NetConfig {
    NetConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        request_timeout_ms: 1_000,
        response_timeout_ms: 2_000,
        ..NetConfig::default()
    }
}

fn security_config() -> SecurityConfig {
    SecurityConfig {
        enabled: true,
        salt: "integration-salt".to_string(),
        default_password: "shared-default".to_string(),
        kdf: KdfConfig {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        },
    }
}

fn crypto() -> Arc<dyn Crypto> {
    Arc::new(AesGcmCrypto::new(security_config().kdf))
}

async fn echo_server() -> Arc<LocalNamedServer> {
    let server = Arc::new(LocalNamedServer::new());
    server.register(&p("/echo"), echo_service()).await.unwrap();
    server.register(&p("/secret/echo"), echo_service()).await.unwrap();
    server
}

async fn start_master(
    server: Arc<LocalNamedServer>,
    security: Option<MasterSecurity>,
) -> Arc<MasterNetServer> {
    let (master, _handle) = MasterNetServer::start(server, net_config(), security)
        .await
        .unwrap();
    master
}

async fn dial(master: &MasterNetServer, security: Option<SlaveSecurity>) -> Arc<SlaveNetServer> {
    let addr = master.local_addr().unwrap().to_string();
    SlaveNetServer::connect(&addr, net_config(), security)
        .await
        .unwrap()
}

/// Write `message` and wait for the echo.
async fn round_trip(
    pipe: Box<dyn Pipe>,
    message: KgrValue,
) -> (Box<dyn Pipe>, KgrResult<Option<KgrValue>>) {
    tokio::task::spawn_blocking(move || {
        let reply = pipe
            .write(message)
            .and_then(|_| pipe.read_wait(Duration::from_secs(5)));
        (pipe, reply)
    })
    .await
    .unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ---------------------------------------------------------------------------
// Plain connections
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_echo() {
    let master = start_master(echo_server().await, None).await;
    let slave = dial(&master, None).await;

    assert!(slave.registered(&p("/echo")).await.unwrap());
    assert!(!slave.registered(&p("/missing")).await.unwrap());

    let pipe = slave.connect(&p("/echo")).await.unwrap();
    let (pipe, reply) = round_trip(pipe, KgrValue::dictionary().with("n", 1)).await;
    assert_eq!(reply.unwrap(), Some(KgrValue::dictionary().with("n", 1)));
    let (pipe, reply) = round_trip(pipe, "again".into()).await;
    assert_eq!(reply.unwrap(), Some(KgrValue::from("again")));

    assert!(eventually(|| master.registry().all()[0].pipe_count() == 1).await);
    pipe.close();
    assert!(eventually(|| master.registry().all()[0].pipe_count() == 0).await);
    assert!(eventually(|| slave.connection().pipe_count() == 0).await);

    let err = slave.connect(&p("/missing")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    slave.close().await;
    assert!(eventually(|| master.registry().is_empty()).await);
    master.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slave_bound_service_reached_from_another_slave() {
    let server = Arc::new(LocalNamedServer::new());
    let master = start_master(Arc::clone(&server), None).await;
    let provider = dial(&master, None).await;
    let consumer = dial(&master, None).await;

    provider.register(&p("/remote/echo"), echo_service()).await.unwrap();
    assert!(server.registered(&p("/remote/echo")).await.unwrap());
    assert!(consumer.registered(&p("/remote/echo")).await.unwrap());

    let pipe = consumer.connect(&p("/remote/echo")).await.unwrap();
    let (pipe, reply) = round_trip(pipe, KgrValue::Int(42)).await;
    assert_eq!(reply.unwrap(), Some(KgrValue::Int(42)));
    pipe.close();

    // Only the binding connection may withdraw it.
    let err = consumer.deregister(&p("/remote/echo")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    provider.deregister(&p("/remote/echo")).await.unwrap();
    assert!(!server.registered(&p("/remote/echo")).await.unwrap());
    assert!(!provider.local_server().registered(&p("/remote/echo")).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bound_service_dropped_with_connection() {
    let server = Arc::new(LocalNamedServer::new());
    let master = start_master(Arc::clone(&server), None).await;
    let provider = dial(&master, None).await;
    provider.register(&p("/transient"), echo_service()).await.unwrap();
    assert!(server.registered(&p("/transient")).await.unwrap());

    provider.close().await;
    assert!(eventually(|| master.registry().is_empty()).await);
    assert!(!server.registered(&p("/transient")).await.unwrap());
}

/// Takes its time before accepting a pipe, then holds on to it.
struct SlowAttach {
    delay: Duration,
    held: Arc<Mutex<Vec<Box<dyn Pipe>>>>,
}

#[async_trait]
impl Service for SlowAttach {
    async fn attach(&self, pipe: Box<dyn Pipe>) -> KgrResult<()> {
        tokio::time::sleep(self.delay).await;
        self.held.lock().unwrap().push(pipe);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_answered_too_late_is_released() {
    let config = NetConfig {
        response_timeout_ms: 200,
        ..net_config()
    };
    let held = Arc::new(Mutex::new(Vec::new()));
    let server = echo_server().await;
    server
        .register(
            &p("/slow"),
            Arc::new(SlowAttach {
                delay: Duration::from_millis(500),
                held: Arc::clone(&held),
            }),
        )
        .await
        .unwrap();
    let (master, _accept) = MasterNetServer::start(server, config.clone(), None)
        .await
        .unwrap();
    let addr = master.local_addr().unwrap().to_string();
    let slave = SlaveNetServer::connect(&addr, config, None).await.unwrap();

    let err = slave.connect(&p("/slow")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    // The master's answer arrives after the slave gave up; both ends let go.
    assert!(eventually(|| held.lock().unwrap().len() == 1).await);
    assert!(eventually(|| held.lock().unwrap()[0].is_closed()).await);
    assert!(eventually(|| master.registry().all()[0].pipe_count() == 0).await);
    assert!(eventually(|| slave.connection().pipe_count() == 0).await);

    let pipe = slave.connect(&p("/echo")).await.unwrap();
    let (_pipe, reply) = round_trip(pipe, "still usable".into()).await;
    assert_eq!(reply.unwrap(), Some(KgrValue::from("still usable")));
    master.shutdown().await;
}

// ---------------------------------------------------------------------------
// Security
// ---------------------------------------------------------------------------

fn secured_master_parts() -> (Arc<CredentialMaster>, MasterSecurity) {
    let crypto = crypto();
    let credentials = Arc::new(CredentialMaster::new(Arc::clone(&crypto)));
    credentials
        .new_account(
            "alice",
            Some("wonderland"),
            AccountPolicies {
                access: RestrictionPolicy::Whitelist(vec![p("/secret")]),
                modification: RestrictionPolicy::deny_all(),
            },
        )
        .unwrap();
    credentials.enable_default_account(AccountPolicies {
        access: RestrictionPolicy::Whitelist(vec![p("/echo")]),
        modification: RestrictionPolicy::deny_all(),
    });
    let security =
        MasterSecurity::from_config(crypto, Arc::clone(&credentials), &security_config()).unwrap();
    (credentials, security)
}

fn slave_security(password: &str) -> SlaveSecurity {
    let crypto = crypto();
    let credentials = Arc::new(CredentialSlave::new());
    credentials.new_account("alice", password).unwrap();
    SlaveSecurity::from_config(crypto, credentials, &security_config()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_anonymous_then_login_switches_policies() {
    let (_credentials, security) = secured_master_parts();
    let master = start_master(echo_server().await, Some(security)).await;
    let slave = dial(&master, Some(slave_security("wonderland"))).await;

    // Anonymous: the default account sees /echo only.
    let pipe = slave.connect(&p("/echo")).await.unwrap();
    let (pipe, reply) = round_trip(pipe, "anon".into()).await;
    assert_eq!(reply.unwrap(), Some(KgrValue::from("anon")));
    pipe.close();
    let err = slave.connect(&p("/secret/echo")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
    assert!(!slave.registered(&p("/secret/echo")).await.unwrap());

    slave.authorize("alice").await.unwrap();
    assert_eq!(slave.account().as_deref(), Some("alice"));
    assert!(eventually(|| master.registry().all()[0].account.as_deref() == Some("alice")).await);

    // Traffic now runs under the account key and the account's policies.
    let pipe = slave.connect(&p("/secret/echo")).await.unwrap();
    let (_pipe, reply) = round_trip(pipe, "inside".into()).await;
    assert_eq!(reply.unwrap(), Some(KgrValue::from("inside")));
    let err = slave.connect(&p("/echo")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);

    let err = slave
        .register(&p("/secret/mine"), echo_service())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_password_keeps_connection_anonymous() {
    let (_credentials, security) = secured_master_parts();
    let master = start_master(echo_server().await, Some(security)).await;
    let slave = dial(&master, Some(slave_security("looking-glass"))).await;

    let err = slave.authorize("alice").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
    assert_eq!(slave.account(), None);

    // Still on the default key, still under default policies.
    let err = slave.connect(&p("/secret/echo")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
    let pipe = slave.connect(&p("/echo")).await.unwrap();
    let (_pipe, reply) = round_trip(pipe, "still here".into()).await;
    assert_eq!(reply.unwrap(), Some(KgrValue::from("still here")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_local_account_is_rejected_locally() {
    let (_credentials, security) = secured_master_parts();
    let master = start_master(echo_server().await, Some(security)).await;
    let slave = dial(&master, Some(slave_security("wonderland"))).await;

    let err = slave.authorize("bob").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!slave.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mismatched_default_key_fails_connection() {
    let (_credentials, security) = secured_master_parts();
    let master = start_master(echo_server().await, Some(security)).await;

    let mut config = security_config();
    config.default_password = "something-else".to_string();
    let other = SlaveSecurity::from_config(crypto(), Arc::new(CredentialSlave::new()), &config)
        .unwrap();
    let slave = dial(&master, Some(other)).await;

    let err = slave.connect(&p("/echo")).await.unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::ConnectionFailed | ErrorKind::Protocol | ErrorKind::Timeout
    ));
    assert!(eventually(|| slave.is_closed()).await);
}

#[tokio::test]
async fn test_login_without_security_is_rejected() {
    let master = start_master(echo_server().await, None).await;
    let slave = dial(&master, None).await;
    let err = slave.authorize("alice").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Read from `socket` until one whole frame has arrived.
async fn next_frame(socket: &dyn Socket, buf: &mut BytesMut) -> NetFrame {
    loop {
        if let Some(frame) = decode_frame(buf, u32::MAX).unwrap() {
            return frame;
        }
        let bytes = socket.read(4096).await.unwrap();
        assert!(!bytes.is_empty(), "peer hung up");
        buf.extend_from_slice(&bytes);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_master_times_out_pending_read() {
    let config = NetConfig {
        request_timeout_ms: 1_000,
        response_timeout_ms: 2_000,
        inactivity_timeout_ms: 50,
        inactivity_threshold_ms: 150,
        ..NetConfig::default()
    };
    let (scripted, theirs) = StreamSocket::pair(64 * 1024);
    let slave = SlaveNetServer::from_socket(Arc::new(theirs), "scripted".into(), config, None)
        .unwrap();

    // Answer the connect, then never say anything again.
    let script = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        let frame = next_frame(&scripted, &mut buf).await;
        assert!(matches!(
            frame.kind,
            NetFrameKind::Request(NetRequest::Connect { .. })
        ));
        let reply = NetFrame::response(frame.id, NetResponse::Connected { pipe: 0 });
        scripted.write(&encode_frame(&reply).unwrap()).await.unwrap();
        let first = next_frame(&scripted, &mut buf).await;
        (scripted, first)
    });

    let pipe = slave.connect(&p("/anything")).await.unwrap();
    let started = std::time::Instant::now();
    let read = tokio::task::spawn_blocking(move || pipe.read()).await.unwrap();
    assert_eq!(read.unwrap_err().kind(), ErrorKind::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(slave.is_closed());
    assert_eq!(slave.connection().closed().await.kind(), ErrorKind::Timeout);

    // The slave probed before giving up; the first thing after the connect
    // is either the activation or the ping.
    let (_scripted, first) = script.await.unwrap();
    assert!(matches!(
        first.kind,
        NetFrameKind::Notification(_) | NetFrameKind::Request(NetRequest::Ping)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipe_id_chosen_by_master_is_taken_as_is() {
    let (scripted, theirs) = StreamSocket::pair(64 * 1024);
    let slave =
        SlaveNetServer::from_socket(Arc::new(theirs), "scripted".into(), net_config(), None)
            .unwrap();

    let script = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        let frame = next_frame(&scripted, &mut buf).await;
        let reply = NetFrame::response(frame.id, NetResponse::Connected { pipe: u64::MAX });
        scripted.write(&encode_frame(&reply).unwrap()).await.unwrap();
        let activate = next_frame(&scripted, &mut buf).await;
        let data = NetFrame::notification(NetNotification::Send {
            pipe: u64::MAX,
            data: KgrValue::from("hello"),
        });
        scripted.write(&encode_frame(&data).unwrap()).await.unwrap();
        (scripted, activate)
    });

    let pipe = slave.connect(&p("/far")).await.unwrap();
    let (_scripted, activate) = script.await.unwrap();
    assert!(matches!(
        activate.kind,
        NetFrameKind::Notification(NetNotification::Activate { pipe }) if pipe == u64::MAX
    ));
    let got = tokio::task::spawn_blocking(move || pipe.read_wait(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(got.unwrap(), Some(KgrValue::from("hello")));
    assert_eq!(slave.connection().pipe_count(), 1);
}
