//! LDAP front-end: per-connection state machine, request dispatch, filter
//! translation and entry serialization against the Exchange GAL.
//!
//! Only the subset spoken by common mail clients is implemented: simple
//! bind, unbind and search with present / substring filters. Searches are
//! answered from the Global Address List of the bound Exchange session;
//! Root DSE and the base context are served without a session.

use crate::ber::{BerReader, BerWriter, ASN_CONTEXT, ASN_SEQUENCE, ASN_SET};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::exchange::{GalSession, Person, SessionFactory};
use crate::server::{ClientStream, ConnectionHandler};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

pub const DEFAULT_LDAP_PORT: u16 = 389;

/// Served naming context.
const BASE_CONTEXT: &str = "ou=people";

const LDAP_VERSION3: i32 = 3;

// request operations
const LDAP_REQ_BIND: u8 = 0x60;
const LDAP_REQ_UNBIND: u8 = 0x42;
const LDAP_REQ_SEARCH: u8 = 0x63;

// response operations
const LDAP_REP_BIND: u8 = 0x61;
const LDAP_REP_SEARCH: u8 = 0x64;
const LDAP_REP_RESULT: u8 = 0x65;

// result codes
const LDAP_SUCCESS: i32 = 0;
const LDAP_SIZE_LIMIT_EXCEEDED: i32 = 4;
const LDAP_INVALID_CREDENTIALS: i32 = 49;
const LDAP_OTHER: i32 = 80;

// filter operators (only OR, SUBSTRINGS and PRESENT are supported)
const LDAP_FILTER_OR: u8 = 0xA1;
const LDAP_FILTER_SUBSTRINGS: u8 = 0xA4;
const LDAP_FILTER_PRESENT: u8 = 0x87;

const SCOPE_BASE_OBJECT: i32 = 0;

/// Hard ceiling on search results; the client limit is clamped to it and
/// 0 means "default".
const MAX_SIZE_LIMIT: i32 = 100;

/// Detailed gallookup enrichment only below this result count.
const GAL_LOOKUP_THRESHOLD: usize = 10;

/// LDAP attribute to Exchange code, in emission order.
const ATTRIBUTE_MAP: &[(&str, &str)] = &[
    ("uid", "AN"),
    ("mail", "EM"),
    ("displayName", "DN"),
    ("telephoneNumber", "PH"),
    ("l", "OFFICE"),
    ("company", "CP"),
    ("title", "TL"),
    ("cn", "DN"),
    ("givenName", "first"),
    ("initials", "initials"),
    ("sn", "last"),
    ("street", "street"),
    ("st", "state"),
    ("postalCode", "zip"),
    ("c", "country"),
    ("departement", "department"),
    ("mobile", "mobile"),
];

/// Lowercased LDAP filter attribute to Exchange search code. Mail is
/// searched as first name: addresses are assumed to start with it.
static CRITERIA_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("mail", "FN"),
        ("displayname", "DN"),
        ("cn", "DN"),
        ("givenname", "FN"),
        ("sn", "LN"),
        ("title", "TL"),
        ("company", "CP"),
        ("o", "CP"),
        ("l", "OF"),
        ("department", "DP"),
    ])
});

/// Attribute values are single strings or lists; nothing else is legal.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    Single(String),
    Multi(Vec<String>),
}

pub struct LdapConnectionHandler {
    factory: Arc<dyn SessionFactory>,
    gateway_url: String,
    read_timeout: Duration,
}

impl LdapConnectionHandler {
    pub fn new(factory: Arc<dyn SessionFactory>, config: &Config) -> Self {
        Self {
            factory,
            gateway_url: config.gateway.url.clone(),
            read_timeout: Duration::from_secs(config.listen.client_so_timeout),
        }
    }
}

#[async_trait]
impl ConnectionHandler for LdapConnectionHandler {
    fn protocol_name(&self) -> &'static str {
        "LDAP"
    }

    async fn handle(&self, stream: ClientStream, peer: SocketAddr) -> anyhow::Result<()> {
        let mut connection = LdapConnection {
            stream,
            peer,
            factory: Arc::clone(&self.factory),
            gateway_url: self.gateway_url.clone(),
            read_timeout: self.read_timeout,
            ldap_version: LDAP_VERSION3,
            session: None,
        };
        connection.run().await;
        Ok(())
    }
}

struct LdapConnection {
    stream: ClientStream,
    peer: SocketAddr,
    factory: Arc<dyn SessionFactory>,
    gateway_url: String,
    read_timeout: Duration,
    /// Learned from the Bind request; selects response string encoding.
    ldap_version: i32,
    session: Option<Arc<dyn GalSession>>,
}

impl LdapConnection {
    fn is_ldap_v3(&self) -> bool {
        self.ldap_version == LDAP_VERSION3
    }

    async fn run(&mut self) {
        loop {
            let frame = match self.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(GatewayError::Transport(e)) if e.kind() == io::ErrorKind::TimedOut => {
                    debug!("closing connection to {} on timeout", self.peer);
                    break;
                }
                Err(GatewayError::Transport(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    // truncated frame: close without a response
                    break;
                }
                Err(e) => {
                    debug!("closing connection to {}: {}", self.peer, e);
                    break;
                }
            };
            if self.handle_request(&frame).await.is_err() {
                break;
            }
        }
        if let Some(session) = self.session.take() {
            self.factory.release(&session);
        }
    }

    /// Read one framed BER message (header included). Returns None on a
    /// clean EOF between messages.
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut tag = [0u8; 1];
        let read = match timeout(self.read_timeout, self.stream.read(&mut tag)).await {
            Ok(result) => result?,
            Err(_) => return Err(timeout_error()),
        };
        if read == 0 {
            return Ok(None);
        }
        if tag[0] != ASN_SEQUENCE {
            return Err(GatewayError::protocol(format!(
                "expected SEQUENCE frame, got 0x{:02X}",
                tag[0]
            )));
        }

        let mut frame = vec![tag[0]];
        let mut length_byte = [0u8; 1];
        self.read_exact_timed(&mut length_byte).await?;
        frame.push(length_byte[0]);

        let mut body_length = length_byte[0] as usize;
        if length_byte[0] & 0x80 != 0 {
            let count = (length_byte[0] & 0x7F) as usize;
            if count == 0 || count > 4 {
                return Err(GatewayError::protocol("invalid frame length encoding"));
            }
            let mut length_bytes = vec![0u8; count];
            self.read_exact_timed(&mut length_bytes).await?;
            frame.extend_from_slice(&length_bytes);
            body_length = length_bytes
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        }

        let mut body = vec![0u8; body_length];
        self.read_exact_timed(&mut body).await?;
        frame.extend_from_slice(&body);
        Ok(Some(frame))
    }

    async fn read_exact_timed(&mut self, buf: &mut [u8]) -> Result<()> {
        match timeout(self.read_timeout, self.stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(GatewayError::Transport(e)),
            Err(_) => Err(timeout_error()),
        }
    }

    /// Dispatch one request; on failure a best-effort error result is
    /// sent before the connection is torn down.
    async fn handle_request(&mut self, frame: &[u8]) -> Result<()> {
        let mut current_message_id = 0;
        match self.process_request(frame, &mut current_message_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(send_error) = self
                    .send_client(current_message_id, LDAP_REP_RESULT, LDAP_OTHER, &e.to_string())
                    .await
                {
                    debug!("failed to send error response: {}", send_error);
                }
                Err(e)
            }
        }
    }

    async fn process_request(&mut self, frame: &[u8], current_message_id: &mut i32) -> Result<()> {
        let mut reader = BerReader::new(frame);
        reader.parse_seq()?;
        *current_message_id = reader.parse_int()?;
        let (operation, _) = reader.parse_seq()?;
        let message_id = *current_message_id;

        match operation {
            LDAP_REQ_BIND => self.handle_bind(message_id, &mut reader).await,
            LDAP_REQ_UNBIND => {
                debug!("LDAP unbind from {}", self.peer);
                if let Some(session) = self.session.take() {
                    self.factory.release(&session);
                }
                Ok(())
            }
            LDAP_REQ_SEARCH => self.handle_search(message_id, &mut reader).await,
            other => {
                debug!("unsupported operation 0x{:02X}", other);
                self.send_client(message_id, LDAP_REP_RESULT, LDAP_OTHER, "Unsupported operation")
                    .await
            }
        }
    }

    async fn handle_bind(&mut self, message_id: i32, reader: &mut BerReader<'_>) -> Result<()> {
        let ldap_version = reader.parse_int()?;
        let utf8 = ldap_version == LDAP_VERSION3;
        let user_name = reader.parse_string(utf8)?;
        let password = reader.parse_string_with_tag(ASN_CONTEXT, utf8)?;
        self.ldap_version = ldap_version;

        if !user_name.is_empty() && !password.is_empty() {
            debug!("LDAP bind {}", user_name);
            match self.factory.acquire(&user_name, &password).await {
                Ok(session) => {
                    self.session = Some(session);
                    self.send_client(message_id, LDAP_REP_BIND, LDAP_SUCCESS, "").await
                }
                Err(e) => {
                    debug!("bind failed for {}: {}", user_name, e);
                    self.send_client(message_id, LDAP_REP_BIND, LDAP_INVALID_CREDENTIALS, "")
                        .await
                }
            }
        } else {
            debug!("LDAP anonymous bind");
            self.send_client(message_id, LDAP_REP_BIND, LDAP_SUCCESS, "").await
        }
    }

    async fn handle_search(&mut self, message_id: i32, reader: &mut BerReader<'_>) -> Result<()> {
        let utf8 = self.is_ldap_v3();
        let dn = reader.parse_string(utf8)?;
        let scope = reader.parse_enumeration()?;
        let _deref_aliases = reader.parse_enumeration()?;
        let mut size_limit = reader.parse_int()?;
        if size_limit <= 0 || size_limit > MAX_SIZE_LIMIT {
            size_limit = MAX_SIZE_LIMIT;
        }
        let size_limit = size_limit as usize;
        let _time_limit = reader.parse_int()?;
        let _types_only = reader.parse_boolean()?;
        let mut size = 0;
        debug!(
            "LDAP search base={} scope={} sizelimit={}",
            dn, scope, size_limit
        );

        if scope == SCOPE_BASE_OBJECT {
            if dn.is_empty() {
                size = 1;
                self.send_root_dse(message_id).await?;
            } else if dn == BASE_CONTEXT {
                size = 1;
                self.send_base_context(message_id).await?;
            } else if dn.starts_with("uid=") && dn.contains(',') {
                if let Some(session) = self.session.clone() {
                    // single entry lookup by account name
                    let uid = dn["uid=".len()..].split(',').next().unwrap_or_default();
                    let mut persons = session.gal_find("AN", uid).await?;
                    size = persons.len();
                    self.send_persons(message_id, session.as_ref(), &mut persons)
                        .await?;
                }
            }
        } else if dn.eq_ignore_ascii_case(BASE_CONTEXT) {
            if let Some(session) = self.session.clone() {
                let criteria = self.parse_filter(reader)?;
                let mut persons: HashMap<String, Person> = HashMap::new();
                if criteria.get("objectclass").map(String::as_str) == Some("*") {
                    // full search: the GAL has no wildcard, sweep one
                    // indexed query per initial letter
                    for letter in 'A'..'Z' {
                        if persons.len() < size_limit {
                            for person in
                                session.gal_find("AN", &letter.to_string()).await?.into_values()
                            {
                                merge_person(&mut persons, person);
                                if persons.len() == size_limit {
                                    break;
                                }
                            }
                        }
                        if persons.len() == size_limit {
                            break;
                        }
                    }
                } else {
                    for (code, value) in &criteria {
                        if persons.len() < size_limit {
                            for person in session.gal_find(code, value).await?.into_values() {
                                merge_person(&mut persons, person);
                                if persons.len() == size_limit {
                                    break;
                                }
                            }
                        }
                        if persons.len() == size_limit {
                            break;
                        }
                    }
                }
                size = persons.len();
                debug!("LDAP search found {} results", size);
                self.send_persons(message_id, session.as_ref(), &mut persons)
                    .await?;
            }
        }

        if size == size_limit {
            self.send_client(message_id, LDAP_REP_RESULT, LDAP_SIZE_LIMIT_EXCEEDED, "")
                .await
        } else {
            self.send_client(message_id, LDAP_REP_RESULT, LDAP_SUCCESS, "").await
        }
    }

    /// Translate the request filter into Exchange search criteria.
    /// Supported shapes: (objectClass=*), a substring filter, or an OR of
    /// substring filters; everything else is logged and dropped.
    fn parse_filter(&self, reader: &mut BerReader<'_>) -> Result<HashMap<String, String>> {
        let utf8 = self.is_ldap_v3();
        let mut criteria = HashMap::new();
        if reader.peek_byte()? == LDAP_FILTER_PRESENT {
            let attribute_name = reader
                .parse_string_with_tag(LDAP_FILTER_PRESENT, utf8)?
                .to_lowercase();
            if attribute_name == "objectclass" {
                criteria.insert(attribute_name, "*".to_string());
            } else {
                warn!("Unsupported filter attribute: {}", attribute_name);
            }
        } else {
            let (filter_type, length) = reader.parse_seq()?;
            let end = reader.parse_position() + length;
            if filter_type == LDAP_FILTER_OR {
                while reader.parse_position() < end && reader.bytes_left() > 0 {
                    let (filter_operator, inner_length) = reader.parse_seq()?;
                    let inner_end = reader.parse_position() + inner_length;
                    if filter_operator == LDAP_FILTER_SUBSTRINGS {
                        self.parse_simple_filter(reader, &mut criteria)?;
                    } else {
                        warn!("Unsupported filter operator: 0x{:02X}", filter_operator);
                    }
                    // trailing substring components are ignored
                    if reader.parse_position() < inner_end {
                        reader.parse_raw(inner_end - reader.parse_position())?;
                    }
                }
            } else if filter_type == LDAP_FILTER_SUBSTRINGS {
                self.parse_simple_filter(reader, &mut criteria)?;
            } else {
                warn!("Unsupported filter type: 0x{:02X}", filter_type);
            }
        }
        Ok(criteria)
    }

    /// One substring filter: only the first component is used, as a
    /// prefix, whatever its mode tag says (the GAL only matches prefixes).
    fn parse_simple_filter(
        &self,
        reader: &mut BerReader<'_>,
        criteria: &mut HashMap<String, String>,
    ) -> Result<()> {
        let utf8 = self.is_ldap_v3();
        let attribute_name = reader.parse_string(utf8)?.to_lowercase();
        reader.parse_seq()?;
        let filter_mode = reader.peek_byte()?;
        let value = reader.parse_string_with_tag(filter_mode, utf8)?;
        match CRITERIA_MAP.get(attribute_name.as_str()) {
            Some(exchange_attribute) => {
                criteria.insert(exchange_attribute.to_string(), value);
            }
            None => warn!("Unsupported filter attribute: {}", attribute_name),
        }
        Ok(())
    }

    /// Convert persons to LDAP attributes and send one entry per person.
    async fn send_persons(
        &mut self,
        message_id: i32,
        session: &dyn GalSession,
        persons: &mut HashMap<String, Person>,
    ) -> Result<()> {
        // detailed information only for small result sets
        let enrich = persons.len() <= GAL_LOOKUP_THRESHOLD;
        for person in persons.values_mut() {
            if enrich {
                session.gal_lookup(person).await?;
            }
            let mut attributes = Vec::new();
            for (ldap_attribute, exchange_attribute) in ATTRIBUTE_MAP {
                if let Some(value) = person.get(*exchange_attribute) {
                    attributes.push((
                        ldap_attribute.to_string(),
                        AttributeValue::Single(value.clone()),
                    ));
                }
            }
            let uid = person.get("AN").cloned().unwrap_or_default();
            let dn = format!("uid={},{}", uid, BASE_CONTEXT);
            self.send_entry(message_id, &dn, &attributes).await?;
        }
        Ok(())
    }

    async fn send_root_dse(&mut self, message_id: i32) -> Result<()> {
        let attributes = vec![
            (
                "objectClass".to_string(),
                AttributeValue::Single("top".to_string()),
            ),
            (
                "namingContexts".to_string(),
                AttributeValue::Single(BASE_CONTEXT.to_string()),
            ),
        ];
        self.send_entry(message_id, "Root DSE", &attributes).await
    }

    async fn send_base_context(&mut self, message_id: i32) -> Result<()> {
        let attributes = vec![
            (
                "objectClass".to_string(),
                AttributeValue::Multi(vec!["top".to_string(), "organizationalUnit".to_string()]),
            ),
            (
                "description".to_string(),
                AttributeValue::Single(format!("DavMail Gateway LDAP for {}", self.gateway_url)),
            ),
        ];
        self.send_entry(message_id, BASE_CONTEXT, &attributes).await
    }

    async fn send_entry(
        &mut self,
        message_id: i32,
        dn: &str,
        attributes: &[(String, AttributeValue)],
    ) -> Result<()> {
        let utf8 = self.is_ldap_v3();
        let mut ber = BerWriter::new();
        ber.begin_seq(ASN_SEQUENCE);
        ber.encode_int(message_id);
        ber.begin_seq(LDAP_REP_SEARCH);
        ber.encode_string(dn, utf8);
        ber.begin_seq(ASN_SEQUENCE);
        for (name, value) in attributes {
            ber.begin_seq(ASN_SEQUENCE);
            ber.encode_string(name, utf8);
            ber.begin_seq(ASN_SET);
            match value {
                AttributeValue::Single(v) => ber.encode_string(v, utf8),
                AttributeValue::Multi(values) => {
                    for v in values {
                        ber.encode_string(v, utf8);
                    }
                }
            }
            ber.end_seq();
            ber.end_seq();
        }
        ber.end_seq();
        ber.end_seq();
        ber.end_seq();
        self.send_response(ber).await
    }

    async fn send_client(
        &mut self,
        message_id: i32,
        response_operation: u8,
        status: i32,
        message: &str,
    ) -> Result<()> {
        let utf8 = self.is_ldap_v3();
        let mut ber = BerWriter::new();
        ber.begin_seq(ASN_SEQUENCE);
        ber.encode_int(message_id);
        ber.begin_seq(response_operation);
        ber.encode_enumerated(status);
        // matched DN
        ber.encode_string("", utf8);
        // error message
        ber.encode_string(message, utf8);
        ber.end_seq();
        ber.end_seq();
        self.send_response(ber).await
    }

    /// Each response is one complete BER message, written and flushed as a
    /// unit: partial messages never interleave on the wire.
    async fn send_response(&mut self, ber: BerWriter) -> Result<()> {
        self.stream.write_all(ber.as_slice()).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Merge a GAL record by account name; a duplicate AN across queries
/// overwrites the earlier record (AN is unique, the overwrite is benign).
fn merge_person(persons: &mut HashMap<String, Person>, person: Person) {
    let account_name = person.get("AN").cloned().unwrap_or_default();
    persons.insert(account_name, person);
}

fn timeout_error() -> GatewayError {
    GatewayError::Transport(io::Error::new(
        io::ErrorKind::TimedOut,
        "client read timeout",
    ))
}
