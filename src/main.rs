use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use clap::Parser;
use ldap_exchange_gateway::exchange::ExchangeSessionFactory;
use ldap_exchange_gateway::ldap::{LdapConnectionHandler, DEFAULT_LDAP_PORT};
use ldap_exchange_gateway::server::GatewayListener;
use ldap_exchange_gateway::{tls, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

#[derive(Parser)]
#[command(name = "ldap-exchange-gateway")]
#[command(about = "LDAP directory gateway - resolves address book searches against an Exchange Global Address List")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Listen port (overrides config)
    #[arg(short = 'l', long, value_name = "PORT")]
    listen: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_exchange_gateway={},info", log_level))
        .init();

    info!("Starting LDAP Exchange gateway");

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    if let Some(port) = args.listen {
        config.listen.port = port;
    }
    let config = Arc::new(config);

    info!("Configuration loaded:");
    info!("  Exchange URL: {}", config.gateway.url);
    info!(
        "  Listen: {}:{}",
        config.listen.bind_address.as_deref().unwrap_or("0.0.0.0"),
        if config.listen.port == 0 {
            DEFAULT_LDAP_PORT
        } else {
            config.listen.port
        }
    );
    info!("  Allow remote: {}", config.listen.allow_remote);

    let tls_acceptor = match config.tls.as_ref() {
        Some(tls_config) => {
            tls::install_crypto_provider();
            let server_config = tls::load_server_config(tls_config)?;
            info!("TLS enabled for listener");
            Some(Arc::new(ArcSwap::from_pointee(TlsAcceptor::from(
                server_config,
            ))))
        }
        None => None,
    };

    let factory = Arc::new(ExchangeSessionFactory::new(Arc::clone(&config))?);
    let handler = Arc::new(LdapConnectionHandler::new(factory, &config));
    let listener = GatewayListener::bind(&config, DEFAULT_LDAP_PORT, tls_acceptor, handler).await?;

    tokio::select! {
        result = listener.serve() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested, closing listener");
            Ok(())
        }
    }
}
