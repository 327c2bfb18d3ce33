use crate::proxmox::error::{ProxmoxError, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Raw call surface over the cluster API.
///
/// Implementations perform exactly one request per call and never retry;
/// retry policy lives in the task tracker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn invoke(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    ticket: Option<String>,
    csrf_token: Option<String>,
    api_token: Option<String>,
}

#[derive(Deserialize, Debug)]
struct TicketResponse {
    data: TicketData,
}

#[derive(Deserialize, Debug)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

impl HttpTransport {
    pub fn new(host: &str, port: u16, verify_ssl: bool) -> Result<Self> {
        let scheme = if host.starts_with("http://") {
            "http"
        } else {
            "https"
        };

        let host_cleaned = if let Some(stripped) = host.strip_prefix("http://") {
            stripped
        } else if let Some(stripped) = host.strip_prefix("https://") {
            stripped
        } else {
            host
        };
        let host_cleaned = host_cleaned.trim_end_matches('/');

        let url_str = format!("{}://{}/api2/json/", scheme, authority(host_cleaned, port));
        let base_url = Url::parse(&url_str)?;

        let client = Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url,
            ticket: None,
            csrf_token: None,
            api_token: None,
        })
    }

    pub fn set_api_token(&mut self, user: &str, token_name: &str, token_value: &str) {
        self.api_token = Some(format!(
            "PVEAPIToken={}!{}={}",
            user, token_name, token_value
        ));
    }

    pub async fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let url = self.base_url.join("access/ticket")?;
        let params = [("username", user), ("password", password)];

        let resp = self.client.post(url).form(&params).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProxmoxError::Auth(format!("{} - {}", status, text)));
        }

        let body: TicketResponse = resp.json().await?;

        self.ticket = Some(body.data.ticket);
        self.csrf_token = Some(body.data.csrf_token);

        info!("Successfully logged in as {}", user);
        Ok(())
    }
}

/// `host[:port]` for the base URL. An explicit port wins over `port`; bare IPv6
/// literals are bracketed.
fn authority(host: &str, port: u16) -> String {
    if host.starts_with('[') {
        if host.ends_with(']') {
            format!("{}:{}", host, port)
        } else {
            host.to_string()
        }
    } else if host.matches(':').count() > 1 {
        format!("[{}]:{}", host, port)
    } else if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn invoke(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = self.base_url.join(path)?;
        debug!("{} {}", method, url);
        let mut req = self.client.request(method, url);

        if let Some(token) = &self.api_token {
            req = req.header("Authorization", token);
        } else {
            if let Some(token) = &self.csrf_token {
                req = req.header("CSRFPreventionToken", token);
            }
            if let Some(ticket) = &self.ticket {
                req = req.header("Cookie", format!("PVEAuthCookie={}", ticket));
            }
        }

        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            // reqwest only exposes the canonical reason phrase, not the one the API sent.
            let reason = status.canonical_reason().unwrap_or_default().to_string();
            let text = resp.text().await.unwrap_or_default();
            let message = if text.trim().is_empty() {
                reason
            } else {
                text
            };
            return Err(ProxmoxError::from_status(status.as_u16(), message));
        }

        let v: Value = resp.json().await?;
        match v {
            Value::Object(mut map) if map.contains_key("data") => {
                Ok(map.remove("data").unwrap_or(Value::Null))
            }
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_base_url_from_host() {
        let url = |host: &str| HttpTransport::new(host, 8006, true).unwrap().base_url.to_string();
        assert_eq!(url("pve.local"), "https://pve.local:8006/api2/json/");
        assert_eq!(url("http://127.0.0.1:9000/"), "http://127.0.0.1:9000/api2/json/");
        assert_eq!(url("fe80::1"), "https://[fe80::1]:8006/api2/json/");
        assert_eq!(url("[::1]"), "https://[::1]:8006/api2/json/");
        assert_eq!(url("https://[::1]:9000"), "https://[::1]:9000/api2/json/");
    }

    #[tokio::test]
    async fn test_invoke_unwraps_data_and_sends_token() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api2/json/nodes"))
            .and(header("Authorization", "PVEAPIToken=root@pam!ci=secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "node": "pve1", "status": "online" }]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut transport = HttpTransport::new(&mock_server.uri(), 8006, true).unwrap();
        transport.set_api_token("root@pam", "ci", "secret");

        let v = transport.invoke(Method::GET, "nodes", None).await.unwrap();
        assert_eq!(v[0]["node"], "pve1");
    }

    #[tokio::test]
    async fn test_invoke_maps_http_errors() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve1/tasks/UPID:gone/status"))
            .respond_with(ResponseTemplate::new(500).set_body_string("no such task"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/cluster/status"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api2/json/nodes/pve1/qemu/101/status/stop"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_string("can't lock file '/var/lock/qemu-server/lock-101.conf' - got timeout"),
            )
            .mount(&mock_server)
            .await;

        let transport = HttpTransport::new(&mock_server.uri(), 8006, true).unwrap();

        let lost = transport
            .invoke(Method::GET, "nodes/pve1/tasks/UPID:gone/status", None)
            .await
            .unwrap_err();
        assert!(lost.is_not_found());

        let auth = transport
            .invoke(Method::GET, "cluster/status", None)
            .await
            .unwrap_err();
        assert!(matches!(auth, ProxmoxError::Auth(_)));

        let locked = transport
            .invoke(Method::POST, "nodes/pve1/qemu/101/status/stop", None)
            .await
            .unwrap_err();
        assert!(locked.is_conflict());
    }

    #[tokio::test]
    async fn test_login_stores_ticket() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api2/json/access/ticket"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "ticket": "PVE:root@pam:ABC", "CSRFPreventionToken": "csrf" }
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/version"))
            .and(header("CSRFPreventionToken", "csrf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "version": "8.2" }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut transport = HttpTransport::new(&mock_server.uri(), 8006, true).unwrap();
        transport.login("root@pam", "pw").await.unwrap();

        let v = transport.invoke(Method::GET, "version", None).await.unwrap();
        assert_eq!(v["version"], "8.2");
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let transport = HttpTransport::new("http://127.0.0.1:9", 8006, true).unwrap();
        let err = transport.invoke(Method::GET, "nodes", None).await.unwrap_err();
        assert!(err.is_transient());
    }
}
