//! kgr CLI: run a master or talk to one.
//!
//! `kgr serve` starts a master with an echo service; `kgr call` dials a master
//! as a slave, optionally logs in, and performs one request/reply exchange.

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{anyhow, bail, Context};
use clap::Parser;
use kgr_kernel::{
    ContextFlow, ContextManager, ContextManagerHandle, ContextService, LocalNamedServer,
    NamedServer, Pipe, ServiceContext,
};
use kgr_security::{AesGcmCrypto, CredentialMaster, CredentialSlave, Crypto};
use kgr_types::config::KgrConfig;
use kgr_types::{KgrPath, KgrResult, KgrValue};
use kgr_wire::{MasterNetServer, MasterSecurity, SlaveNetServer, SlaveSecurity};
use std::sync::Arc;
use tracing::info;

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);
    let config = kgr_kernel::config::load_config(cli.config.as_deref());

    match cli.command {
        Commands::Serve { listen } => cmd_serve(config, listen).await,
        Commands::Call {
            addr,
            service,
            message,
            account,
            password,
        } => cmd_call(config, addr, &service, &message, account, password).await,
    }
}

// ─── serve ──────────────────────────────────────────────────────────────────

/// Writes every message straight back.
struct EchoContext;

impl ServiceContext for EchoContext {
    fn run(&mut self, pipe: &dyn Pipe) -> KgrResult<ContextFlow> {
        while let Some(message) = pipe.read_optional() {
            pipe.write(message)?;
        }
        Ok(ContextFlow::Continue)
    }
}

fn crypto_for(config: &KgrConfig) -> Arc<dyn Crypto> {
    Arc::new(AesGcmCrypto::new(config.security.kdf))
}

async fn cmd_serve(mut config: KgrConfig, listen: Option<String>) -> anyhow::Result<()> {
    if let Some(listen) = listen {
        config.network.listen_addr = listen;
    }

    let contexts =
        ContextManagerHandle::start(ContextManager::new(), tokio::runtime::Handle::current());
    let echo = ContextService::new(contexts.manager().clone(), || {
        Ok(Box::new(EchoContext) as Box<dyn ServiceContext>)
    });
    let server = Arc::new(LocalNamedServer::new());
    server
        .register(&KgrPath::parse("/echo")?, Arc::new(echo))
        .await?;

    let security = if config.security.enabled {
        let crypto = crypto_for(&config);
        let credentials =
            Arc::new(CredentialMaster::from_config(Arc::clone(&crypto), &config)?);
        for entry in config.accounts.iter().filter(|a| a.password.is_none()) {
            if let Some(account) = credentials.get_by_name(&entry.name) {
                println!(
                    "generated password for {}: {}",
                    entry.name,
                    account.password().as_str()
                );
            }
        }
        Some(MasterSecurity::from_config(crypto, credentials, &config.security)?)
    } else {
        None
    };

    let (master, accept) = MasterNetServer::start(server, config.network.clone(), security).await?;
    let addr = master
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| config.network.listen_addr.clone());
    println!("kgr master listening on {addr}");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down");
    master.shutdown().await;
    accept.abort();
    contexts.close().await;
    Ok(())
}

// ─── call ───────────────────────────────────────────────────────────────────

fn parse_message(raw: &str) -> KgrValue {
    serde_json::from_str(raw).unwrap_or_else(|_| KgrValue::from(raw))
}

async fn cmd_call(
    config: KgrConfig,
    addr: Option<String>,
    service: &str,
    message: &str,
    account: Option<String>,
    password: Option<String>,
) -> anyhow::Result<()> {
    let addr = addr.unwrap_or_else(|| config.network.listen_addr.clone());
    let path = KgrPath::parse(service)?;

    let security = if config.security.enabled {
        let credentials = Arc::new(CredentialSlave::new());
        if let (Some(account), Some(password)) = (&account, &password) {
            credentials.new_account(account, password)?;
        }
        Some(SlaveSecurity::from_config(crypto_for(&config), credentials, &config.security)?)
    } else {
        if account.is_some() {
            bail!("--account needs [security] enabled = true in the config");
        }
        None
    };

    let slave = SlaveNetServer::connect(&addr, config.network.clone(), security)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    if let Some(account) = &account {
        slave
            .authorize(account)
            .await
            .with_context(|| format!("logging in as {account}"))?;
    }

    let pipe = slave
        .connect(&path)
        .await
        .with_context(|| format!("connecting to {path}"))?;
    pipe.write(parse_message(message))?;

    let wait = config.network.inactivity_timeout();
    let reply = tokio::task::spawn_blocking(move || {
        let reply = pipe.read_wait(wait);
        pipe.close();
        reply
    })
    .await?
    .map_err(|e| anyhow!("reading reply: {e}"))?;

    match reply {
        Some(value) => println!("{}", serde_json::to_string(&value)?),
        None => bail!("no reply from {path} within {} ms", wait.as_millis()),
    }
    slave.close().await;
    Ok(())
}
