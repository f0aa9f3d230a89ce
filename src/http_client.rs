//! Shared HTTP client toward Exchange.
//!
//! All Exchange-facing code goes through one pooled client with uniform
//! configuration: fixed IE-6 User-Agent (the backend only returns XML to
//! Internet Explorer), redirects followed manually with a hop cap, basic
//! credentials toward the origin, optional proxy with `DOMAIN\user`
//! detection. WebDAV helpers (SEARCH, PROPFIND, DELETE) require the
//! status codes Exchange actually produces and translate its quirks
//! (440 means forbidden).

use crate::config::Config;
use crate::error::{GatewayError, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use reqwest::{Method, Response, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Forced User-Agent: Exchange returns XML only to Internet Explorer.
pub const IE_USER_AGENT: &str = "Mozilla/4.0 (compatible; MSIE 6.0; Windows NT 5.1; SV1)";
/// Maximum redirect hops followed by execute_follow_redirects.
pub const MAX_REDIRECTS: usize = 10;
/// Idle pooled connections are closed after one minute.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_IDLE_PER_HOST: usize = 100;

/// One response element of a WebDAV 207 Multi-Status body.
#[derive(Debug, Default, Clone)]
pub struct MultiStatusResponse {
    pub href: String,
    pub status: Option<String>,
    pub properties: HashMap<String, String>,
}

impl MultiStatusResponse {
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

pub struct ExchangeHttpClient {
    client: reqwest::Client,
    credentials: Option<(String, String)>,
}

impl ExchangeHttpClient {
    /// Client without origin credentials (status probes, pre-auth checks).
    /// Built once at startup; the connection pool behind it is process-wide
    /// and torn down when the last handle is dropped.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            credentials: None,
        })
    }

    /// Handle over the same pool, sending basic credentials with every
    /// request.
    pub fn with_credentials(&self, user: &str, password: &str) -> Self {
        Self {
            client: self.client.clone(),
            credentials: Some((user.to_string(), password.to_string())),
        }
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, Some(password)),
            None => builder,
        }
    }

    /// HTTP status for the given URL; authentication disabled, connection
    /// always returned to the pool.
    pub async fn get_status(&self, url: &str) -> Result<u16> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        release(response).await;
        Ok(status)
    }

    /// GET with manual redirect following. The pool never follows
    /// redirects itself; each 30x hop releases its connection before the
    /// next request. Fails with TooManyRedirects past the hop cap.
    pub async fn execute_follow_redirects(&self, url: &str) -> Result<Response> {
        debug!("GET {}", url);
        let mut current = self.request(Method::GET, url).send().await?;
        let mut redirect_count = 0;
        while redirect_count < MAX_REDIRECTS && is_redirect(current.status()) {
            let Some(location) = redirect_location(&current) else {
                break;
            };
            release(current).await;
            redirect_count += 1;
            debug!("following redirect {} to {}", redirect_count, location);
            current = self.request(Method::GET, &location).send().await?;
        }
        if is_redirect(current.status()) && redirect_location(&current).is_some() {
            release(current).await;
            return Err(GatewayError::TooManyRedirects);
        }
        Ok(current)
    }

    /// WebDAV SEARCH with an SQL-like query; requires 207 Multi-Status.
    pub async fn execute_search(&self, path: &str, search_request: &str) -> Result<Vec<MultiStatusResponse>> {
        let body = format!(
            "<?xml version=\"1.0\"?>\n\
             <d:searchrequest xmlns:d=\"DAV:\">\n        \
             <d:sql>{}</d:sql>\n\
             </d:searchrequest>",
            xml_escape(search_request)
        );
        let request = self
            .request(dav_method("SEARCH"), path)
            .header(CONTENT_TYPE, HeaderValue::from_static("text/xml; charset=utf-8"))
            .body(body);
        self.execute_dav(request).await
    }

    /// WebDAV PROPFIND with the given depth and property names.
    pub async fn execute_propfind(
        &self,
        path: &str,
        depth: u32,
        properties: &[&str],
    ) -> Result<Vec<MultiStatusResponse>> {
        let mut body = String::from("<?xml version=\"1.0\"?>\n<d:propfind xmlns:d=\"DAV:\"><d:prop>");
        for property in properties {
            body.push_str("<d:");
            body.push_str(property);
            body.push_str("/>");
        }
        body.push_str("</d:prop></d:propfind>");
        let request = self
            .request(dav_method("PROPFIND"), path)
            .header("Depth", depth.to_string())
            .header(CONTENT_TYPE, HeaderValue::from_static("text/xml; charset=utf-8"))
            .body(body);
        self.execute_dav(request).await
    }

    /// DELETE; an already-gone resource (404) is not an error.
    pub async fn execute_delete(&self, path: &str) -> Result<u16> {
        let response = self.request(Method::DELETE, path).send().await?;
        let status = response.status();
        release(response).await;
        if status != StatusCode::OK && status != StatusCode::NOT_FOUND {
            return Err(build_http_error(status));
        }
        Ok(StatusCode::OK.as_u16())
    }

    /// Execute a DAV request, requiring 207 and parsing the multistatus
    /// body. The connection is released on every path.
    pub async fn execute_dav(&self, request: reqwest::RequestBuilder) -> Result<Vec<MultiStatusResponse>> {
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() != 207 {
            release(response).await;
            return Err(build_http_error(status));
        }
        let body = response.text().await?;
        parse_multistatus(&body)
    }
}

fn build_client(config: &Config) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(IE_USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST);

    if let Some(proxy_config) = config.proxy.as_ref().filter(|p| p.enable_proxy) {
        if let Some(host) = proxy_config.proxy_host.as_deref().filter(|h| !h.is_empty()) {
            let port = proxy_config.proxy_port.unwrap_or(80);
            let mut proxy = reqwest::Proxy::all(format!("http://{}:{}", host, port))?;
            if let Some(user) = proxy_config.proxy_user.as_deref().filter(|u| !u.is_empty()) {
                let password = proxy_config.proxy_password.as_deref().unwrap_or("");
                // windows domain in the proxy user name ("DOMAIN\user");
                // the origin never sees NTLM, only the proxy credentials do
                let user = match user.split_once('\\') {
                    Some((domain, bare)) if !domain.is_empty() => {
                        debug!("proxy user carries domain {}", domain);
                        bare
                    }
                    _ => user,
                };
                proxy = proxy.basic_auth(user, password);
            }
            builder = builder.proxy(proxy);
        } else {
            warn!("proxy enabled but no proxy host configured");
        }
    }

    Ok(builder.build()?)
}

/// Drain a response so its connection goes back to the pool.
async fn release(response: Response) {
    let _ = response.bytes().await;
}

fn dav_method(name: &'static str) -> Method {
    Method::from_bytes(name.as_bytes()).expect("valid HTTP method token")
}

pub fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307)
}

fn redirect_location(response: &Response) -> Option<String> {
    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    // resolve relative Location against the request URL
    match response.url().join(location) {
        Ok(url) => Some(url.to_string()),
        Err(_) => Some(location.to_string()),
    }
}

/// Translate an HTTP failure status; 440 means forbidden on Exchange.
pub fn build_http_error(status: StatusCode) -> GatewayError {
    if status.as_u16() == 440 {
        GatewayError::Backend {
            status: 403,
            message: "Forbidden".to_string(),
        }
    } else {
        GatewayError::Backend {
            status: status.as_u16(),
            message: status.canonical_reason().unwrap_or("Unknown").to_string(),
        }
    }
}

pub fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Parse a DAV 207 Multi-Status body into per-resource responses.
pub fn parse_multistatus(xml: &str) -> Result<Vec<MultiStatusResponse>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut responses = Vec::new();
    let mut current: Option<MultiStatusResponse> = None;
    let mut in_prop = false;
    let mut element: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match name.as_str() {
                    "response" => current = Some(MultiStatusResponse::default()),
                    "prop" => in_prop = true,
                    "multistatus" | "propstat" => {}
                    _ => element = Some(name),
                }
            }
            Ok(Event::Text(t)) => {
                let Some(response) = current.as_mut() else {
                    continue;
                };
                let text = t
                    .unescape()
                    .map_err(|e| GatewayError::protocol(format!("invalid multistatus body: {}", e)))?
                    .to_string();
                match element.as_deref() {
                    Some("href") => response.href = text,
                    Some("status") => response.status = Some(text),
                    Some(name) if in_prop => {
                        response.properties.insert(name.to_string(), text);
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match name.as_str() {
                    "response" => {
                        if let Some(response) = current.take() {
                            responses.push(response);
                        }
                    }
                    "prop" => in_prop = false,
                    _ => element = None,
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(GatewayError::protocol(format!(
                    "invalid multistatus body: {}",
                    e
                )))
            }
            _ => {}
        }
    }
    Ok(responses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::CannedHttpServer;

    fn plain_config() -> Config {
        Config::default()
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(
            xml_escape("SELECT \"a\" FROM x WHERE b < 1 & c > 2"),
            "SELECT \"a\" FROM x WHERE b &lt; 1 &amp; c &gt; 2"
        );
        // & is escaped first so entities are not double-escaped backwards
        assert_eq!(xml_escape("&lt;"), "&amp;lt;");
    }

    #[test]
    fn test_is_redirect() {
        for code in [301u16, 302, 303, 307] {
            assert!(is_redirect(StatusCode::from_u16(code).unwrap()));
        }
        for code in [200u16, 204, 304, 308, 404] {
            assert!(!is_redirect(StatusCode::from_u16(code).unwrap()));
        }
    }

    #[test]
    fn test_build_http_error_translates_440() {
        let err = build_http_error(StatusCode::from_u16(440).unwrap());
        match err {
            GatewayError::Backend { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "Forbidden");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_build_http_error_passthrough() {
        let err = build_http_error(StatusCode::BAD_GATEWAY);
        match err {
            GatewayError::Backend { status, .. } => assert_eq!(status, 502),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_parse_multistatus() {
        let xml = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/public/contacts/jdoe.eml</D:href>
    <D:propstat>
      <D:prop>
        <D:displayname>John Doe</D:displayname>
        <D:getetag>"abc123"</D:getetag>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/public/contacts/</D:href>
    <D:status>HTTP/1.1 404 Not Found</D:status>
  </D:response>
</D:multistatus>"#;
        let responses = parse_multistatus(xml).unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].href, "/public/contacts/jdoe.eml");
        assert_eq!(responses[0].property("displayname"), Some("John Doe"));
        assert_eq!(responses[0].property("getetag"), Some("\"abc123\""));
        assert_eq!(responses[1].href, "/public/contacts/");
        assert_eq!(responses[1].status.as_deref(), Some("HTTP/1.1 404 Not Found"));
    }

    #[test]
    fn test_parse_multistatus_invalid_entity() {
        let xml = r#"<D:multistatus xmlns:D="DAV:"><D:response><D:href>&bogus;</D:href></D:response></D:multistatus>"#;
        assert!(parse_multistatus(xml).is_err());
    }

    #[tokio::test]
    async fn test_get_status() {
        let server = CannedHttpServer::start(vec![CannedHttpServer::response(503, &[], "busy")]).await;
        let client = ExchangeHttpClient::new(&plain_config()).unwrap();
        let status = client.get_status(&server.url("/exchange")).await.unwrap();
        assert_eq!(status, 503);
    }

    #[tokio::test]
    async fn test_delete_missing_is_success() {
        let server = CannedHttpServer::start(vec![CannedHttpServer::response(404, &[], "")]).await;
        let client = ExchangeHttpClient::new(&plain_config()).unwrap();
        let status = client.execute_delete(&server.url("/gone.eml")).await.unwrap();
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn test_delete_failure_raises() {
        let server = CannedHttpServer::start(vec![CannedHttpServer::response(500, &[], "boom")]).await;
        let client = ExchangeHttpClient::new(&plain_config()).unwrap();
        let err = client.execute_delete(&server.url("/item.eml")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Backend { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_delete_440_becomes_403() {
        let server = CannedHttpServer::start(vec![CannedHttpServer::response(440, &[], "")]).await;
        let client = ExchangeHttpClient::new(&plain_config()).unwrap();
        let err = client.execute_delete(&server.url("/item.eml")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Backend { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_follow_redirects_chain() {
        let server = CannedHttpServer::start_with_addr(|addr| {
            vec![
                CannedHttpServer::response(
                    302,
                    &[("Location", &format!("http://{}/step2", addr))],
                    "",
                ),
                CannedHttpServer::response(
                    302,
                    &[("Location", &format!("http://{}/final", addr))],
                    "",
                ),
                CannedHttpServer::response(200, &[], "done"),
            ]
        })
        .await;
        let client = ExchangeHttpClient::new(&plain_config()).unwrap();
        let response = client
            .execute_follow_redirects(&server.url("/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.url().path(), "/final");
        assert_eq!(response.text().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_follow_redirects_exhausted() {
        // eleven hops all pointing back at the server
        let server = CannedHttpServer::start_with_addr(|addr| {
            (0..12)
                .map(|i| {
                    CannedHttpServer::response(
                        302,
                        &[("Location", &format!("http://{}/hop{}", addr, i))],
                        "",
                    )
                })
                .collect()
        })
        .await;
        let client = ExchangeHttpClient::new(&plain_config()).unwrap();
        let err = client
            .execute_follow_redirects(&server.url("/start"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::TooManyRedirects));
    }

    #[tokio::test]
    async fn test_search_requires_207() {
        let server = CannedHttpServer::start(vec![CannedHttpServer::response(200, &[], "ok")]).await;
        let client = ExchangeHttpClient::new(&plain_config()).unwrap();
        let err = client
            .execute_search(&server.url("/public/"), "SELECT x FROM y")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Backend { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_search_parses_multistatus() {
        let body = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/public/item1.eml</D:href>
    <D:propstat><D:prop><D:displayname>Item One</D:displayname></D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;
        let server = CannedHttpServer::start(vec![CannedHttpServer::response(207, &[], body)]).await;
        let client = ExchangeHttpClient::new(&plain_config()).unwrap();
        let responses = client
            .execute_search(&server.url("/public/"), "SELECT \"DAV:displayname\" FROM \"\"")
            .await
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].property("displayname"), Some("Item One"));
    }

    #[tokio::test]
    async fn test_propfind_sends_depth() {
        let body = r#"<?xml version="1.0"?><D:multistatus xmlns:D="DAV:"></D:multistatus>"#;
        let server = CannedHttpServer::start(vec![CannedHttpServer::response(207, &[], body)]).await;
        let client = ExchangeHttpClient::new(&plain_config()).unwrap();
        let responses = client
            .execute_propfind(&server.url("/public/"), 1, &["displayname", "getetag"])
            .await
            .unwrap();
        assert!(responses.is_empty());
        let request = server.requests().await.into_iter().next().unwrap();
        assert!(request.starts_with("PROPFIND "));
        assert!(request.contains("depth: 1") || request.contains("Depth: 1"));
        assert!(request.contains("<d:displayname/>"));
    }
}
