pub mod ber;
pub mod config;
pub mod error;
pub mod exchange;
pub mod http_client;
pub mod ldap;
pub mod server;
pub mod tls;

#[cfg(test)]
mod testutil;

pub use config::Config;
pub use error::{GatewayError, Result};
pub use exchange::{ExchangeSessionFactory, GalSession, SessionFactory};
pub use http_client::ExchangeHttpClient;
pub use ldap::LdapConnectionHandler;
pub use server::{ConnectionHandler, GatewayListener};
