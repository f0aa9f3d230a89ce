//! Exchange session layer: credential validation and Global Address List
//! lookups over the shared HTTP facade.
//!
//! The LDAP core only depends on the `SessionFactory` / `GalSession` seams;
//! the concrete implementation resolves searches through the galfind /
//! gallookup commands of the Exchange public folder interface.

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::http_client::{build_http_error, ExchangeHttpClient};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// One GAL person record: Exchange code to value.
pub type Person = HashMap<String, String>;

#[async_trait]
pub trait GalSession: Send + Sync {
    /// Case-insensitive GAL search on one indexed Exchange code
    /// (AN, FN, LN, DN, TL, CP, OF, DP), keyed by account name.
    async fn gal_find(&self, code: &str, value: &str) -> Result<HashMap<String, Person>>;

    /// Fill extended fields (first, initials, last, street, state, zip,
    /// country, department, mobile) in place.
    async fn gal_lookup(&self, person: &mut Person) -> Result<()>;
}

impl std::fmt::Debug for dyn GalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn GalSession")
    }
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn acquire(&self, user: &str, password: &str) -> Result<Arc<dyn GalSession>>;

    fn release(&self, session: &Arc<dyn GalSession>);
}

struct CachedSession {
    password: String,
    session: Arc<ExchangeSession>,
}

pub struct ExchangeSessionFactory {
    config: Arc<Config>,
    /// Process-wide pool handle; per-user clients share it.
    http: ExchangeHttpClient,
    sessions: Mutex<HashMap<String, CachedSession>>,
}

impl ExchangeSessionFactory {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let http = ExchangeHttpClient::new(&config)?;
        Ok(Self {
            config,
            http,
            sessions: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl SessionFactory for ExchangeSessionFactory {
    async fn acquire(&self, user: &str, password: &str) -> Result<Arc<dyn GalSession>> {
        {
            let sessions = self.sessions.lock().expect("session cache poisoned");
            if let Some(cached) = sessions.get(user) {
                if cached.password == password {
                    debug!("reusing Exchange session for {}", user);
                    return Ok(cached.session.clone());
                }
            }
        }

        let client = self.http.with_credentials(user, password);
        let response = client
            .execute_follow_redirects(&self.config.gateway.url)
            .await?;
        let status = response.status();
        drop(response);
        if status.as_u16() == 401 || status.as_u16() == 403 {
            debug!("Exchange rejected credentials for {}", user);
            return Err(GatewayError::AuthFailed);
        }
        if !status.is_success() {
            return Err(build_http_error(status));
        }

        info!("Exchange session opened for {}", user);
        let session = Arc::new(ExchangeSession::new(
            client,
            self.config.gateway.url.clone(),
            user,
        ));
        let mut sessions = self.sessions.lock().expect("session cache poisoned");
        sessions.insert(
            user.to_string(),
            CachedSession {
                password: password.to_string(),
                session: session.clone(),
            },
        );
        Ok(session)
    }

    fn release(&self, session: &Arc<dyn GalSession>) {
        let mut sessions = self.sessions.lock().expect("session cache poisoned");
        sessions.retain(|user, cached| {
            let same = Arc::as_ptr(&cached.session) as *const () == Arc::as_ptr(session) as *const ();
            if same {
                debug!("closing Exchange session for {}", user);
            }
            !same
        });
    }
}

pub struct ExchangeSession {
    client: ExchangeHttpClient,
    cmd_base_url: String,
    user: String,
}

impl ExchangeSession {
    pub fn new(client: ExchangeHttpClient, base_url: String, user: &str) -> Self {
        let cmd_base_url = format!("{}/public/", base_url.trim_end_matches('/'));
        Self {
            client,
            cmd_base_url,
            user: user.to_string(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    async fn execute_command(&self, command: &str, code: &str, value: &str) -> Result<String> {
        let url = reqwest::Url::parse_with_params(&self.cmd_base_url, &[("Cmd", command), (code, value)])
            .map_err(|e| GatewayError::protocol(format!("invalid gateway url: {}", e)))?;
        let response = self.client.execute_follow_redirects(url.as_str()).await?;
        let status = response.status();
        if !status.is_success() {
            drop(response);
            return Err(build_http_error(status));
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl GalSession for ExchangeSession {
    async fn gal_find(&self, code: &str, value: &str) -> Result<HashMap<String, Person>> {
        let body = self.execute_command("galfind", code, value).await?;
        let mut persons = HashMap::new();
        for person in parse_gal_items(&body)? {
            if let Some(account) = person.get("AN") {
                persons.insert(account.clone(), person);
            }
        }
        debug!("galfind {}={} returned {} records", code, value, persons.len());
        Ok(persons)
    }

    async fn gal_lookup(&self, person: &mut Person) -> Result<()> {
        let Some(email) = person.get("EM").cloned() else {
            return Ok(());
        };
        let body = self.execute_command("gallookup", "ADDR", &email).await?;
        if let Some(details) = parse_gal_items(&body)?.into_iter().next() {
            for (key, value) in details {
                person.insert(key, value);
            }
        }
        Ok(())
    }
}

/// Parse the `<item>` elements of a galfind / gallookup response; each
/// child element name is an Exchange code.
fn parse_gal_items(xml: &str) -> Result<Vec<Person>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut current: Option<Person> = None;
    let mut field: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if name == "item" {
                    current = Some(Person::new());
                } else if current.is_some() {
                    field = Some(name);
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(person), Some(name)) = (current.as_mut(), field.as_deref()) {
                    let text = t
                        .unescape()
                        .map_err(|e| GatewayError::protocol(format!("invalid galfind body: {}", e)))?
                        .to_string();
                    person.insert(name.to_string(), text);
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if name == "item" {
                    if let Some(person) = current.take() {
                        items.push(person);
                    }
                } else {
                    field = None;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(GatewayError::protocol(format!(
                    "invalid galfind body: {}",
                    e
                )))
            }
            _ => {}
        }
    }
    Ok(items)
}
