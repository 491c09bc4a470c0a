//! REST client for the provisioning service.
//!
//! Talks to the `/guests` API:
//!
//! | Call | Endpoint | Accepted status |
//! |------|----------|-----------------|
//! | create guest | `POST guests/` | 201 (400 means rejected) |
//! | inspect guest | `GET guests/{id}` | 200 |
//! | delete guest | `DELETE guests/{id}` | 204, 404 |
//! | create snapshot | `POST guests/{id}/snapshots` | 201 |
//! | inspect snapshot | `GET guests/{id}/snapshots/{sid}` | 200 |
//! | restore snapshot | `POST guests/{id}/snapshots/{sid}/restore` | 201 |
//! | delete snapshot | `DELETE guests/{id}/snapshots/{sid}` | 204, 404 |
//! | events | `GET guests/{id}/events` | 200 (paged) |
//! | console log | `GET guests/{id}/logs/console:dump/blob` | 200, 404, 409 |
//!
//! Every call is retried on transient failures (connection errors, 5xx)
//! every `api_call_tick_secs` until `api_call_timeout_secs` elapses.
//!
//! # Example Configuration
//!
//! ```toml
//! [provider]
//! type = "artemis"
//! api_url = "http://artemis.example.com/v0.0.56"
//! keyname = "ci"
//! priority_group = "default-priority"
//! ```

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::debug;

use super::{
    GuestEvent, GuestInfo, ProviderError, ProviderResult, ProvisioningClient, SnapshotInfo,
};
use crate::config::ArtemisProviderConfig;
use crate::environment::{ProvisionOptions, TestingEnvironment};

const EVENTS_PAGE_SIZE: usize = 25;
const EVENTS_MAX_PAGES: usize = 10_000;
const CONSOLE_LOG: &str = "console:dump/blob";

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            ProviderError::Connection(e.to_string())
        } else if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else {
            ProviderError::Other(e.into())
        }
    }
}

/// Client for the REST provisioning service.
pub struct ArtemisClient {
    http: reqwest::Client,
    api_url: String,
    call_timeout: Duration,
    call_tick: Duration,
}

impl ArtemisClient {
    /// Creates a client from the provider configuration.
    pub fn new(config: &ArtemisProviderConfig) -> ProviderResult<Self> {
        let call_timeout = Duration::from_secs(config.api_call_timeout_secs);
        let http = reqwest::Client::builder()
            .timeout(call_timeout.max(Duration::from_secs(1)))
            .build()?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            call_timeout,
            call_tick: Duration::from_secs(config.api_call_tick_secs),
        })
    }

    /// Checks that `api_url` points to the provisioning service.
    ///
    /// The guest list endpoint must answer with a JSON array.
    pub async fn verify(&self) -> ProviderResult<()> {
        let response = self
            .send(Method::GET, "guests/", None, &[StatusCode::OK])
            .await?;
        let body: Value = decode(response).await?;
        if !body.is_array() {
            return Err(ProviderError::Decode(format!(
                "{} does not point to the provisioning API, expected a guest list",
                self.api_url
            )));
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path)
    }

    /// Sends one call, retrying transient failures until the call deadline.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        expected: &[StatusCode],
    ) -> ProviderResult<reqwest::Response> {
        let url = self.url(path);
        let deadline = Instant::now() + self.call_timeout;

        loop {
            let mut request = self.http.request(method.clone(), &url);
            if let Some(body) = body {
                request = request.json(body);
            }

            let err = match request.send().await {
                Ok(response) if expected.contains(&response.status()) => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    classify_status(status, &text)
                }
                Err(e) => ProviderError::from(e),
            };

            if !err.is_transient() || Instant::now() + self.call_tick > deadline {
                return Err(err);
            }
            debug!("{} {} failed, retrying: {}", method, url, err);
            tokio::time::sleep(self.call_tick).await;
        }
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> ProviderResult<T> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ProviderError::Decode(e.to_string()))
}

/// Maps an unexpected HTTP status onto a provider error.
fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let message = error_message(body);
    match status {
        StatusCode::BAD_REQUEST => ProviderError::Rejected(message),
        StatusCode::FORBIDDEN => ProviderError::QuotaDenied(message),
        StatusCode::TOO_MANY_REQUESTS if message.to_lowercase().contains("quota") => {
            ProviderError::QuotaDenied(message)
        }
        StatusCode::NOT_FOUND => ProviderError::NotFound(message),
        _ => ProviderError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

/// Extracts `message` or `errors` from a JSON error body, or returns the body.
fn error_message(body: &str) -> String {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return body.trim().to_string();
    };
    for key in ["message", "errors"] {
        match json.get(key) {
            Some(Value::String(s)) => return s.clone(),
            Some(other) if !other.is_null() => return other.to_string(),
            _ => {}
        }
    }
    json.to_string()
}

/// Builds the body of a guest creation request.
pub fn guest_request_body(
    environment: &TestingEnvironment,
    options: &ProvisionOptions,
    post_install_script: Option<String>,
) -> Value {
    let mut hw = json!({ "arch": environment.arch });
    if let Some(constraints) = &environment.hardware {
        hw["constraints"] = constraints.clone();
    }

    let mut env = json!({
        "hw": hw,
        "os": { "compose": environment.compose },
        "snapshots": environment.snapshots,
        "kickstart": environment.kickstart.clone().unwrap_or_default(),
    });
    if let Some(pool) = options.pool.as_ref().or(environment.pool.as_ref()) {
        env["pool"] = json!(pool);
    }

    let mut body = json!({
        "keyname": options.keyname,
        "environment": env,
        "priority_group": options.priority_group,
        "post_install_script": post_install_script,
        "user_data": options.user_data,
        "skip_prepare_verify_ssh": options.skip_prepare_verify_ssh,
    });
    if let Some(delay) = options.watchdog_dispatch_delay {
        body["watchdog_dispatch_delay"] = json!(delay);
    }
    if let Some(delay) = options.watchdog_period_delay {
        body["watchdog_period_delay"] = json!(delay);
    }
    body
}

/// Reads the post-install script from a file, or unescapes inline script text.
async fn post_install_script(script: &str) -> ProviderResult<String> {
    let path = shellexpand::tilde(script).into_owned();
    if Path::new(&path).is_file() {
        return tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ProviderError::Other(anyhow::anyhow!("cannot read {}: {}", path, e)));
    }
    Ok(script.replace("\\n", "\n"))
}

#[async_trait]
impl ProvisioningClient for ArtemisClient {
    fn name(&self) -> &str {
        "artemis"
    }

    async fn create_guest(
        &self,
        environment: &TestingEnvironment,
        options: &ProvisionOptions,
    ) -> ProviderResult<GuestInfo> {
        let script = match &options.post_install_script {
            Some(script) => Some(post_install_script(script).await?),
            None => None,
        };
        let body = guest_request_body(environment, options, script);
        debug!("guest request: {}", body);

        let response = self
            .send(Method::POST, "guests/", Some(&body), &[StatusCode::CREATED])
            .await?;
        decode(response).await
    }

    async fn inspect_guest(&self, guestname: &str) -> ProviderResult<GuestInfo> {
        let response = self
            .send(
                Method::GET,
                &format!("guests/{}", guestname),
                None,
                &[StatusCode::OK],
            )
            .await?;
        decode(response).await
    }

    async fn cancel_guest(&self, guestname: &str) -> ProviderResult<()> {
        self.send(
            Method::DELETE,
            &format!("guests/{}", guestname),
            None,
            &[StatusCode::NO_CONTENT, StatusCode::NOT_FOUND],
        )
        .await?;
        Ok(())
    }

    async fn create_snapshot(
        &self,
        guestname: &str,
        start_again: bool,
    ) -> ProviderResult<SnapshotInfo> {
        let body = json!({ "start_again": start_again });
        let response = self
            .send(
                Method::POST,
                &format!("guests/{}/snapshots", guestname),
                Some(&body),
                &[StatusCode::CREATED],
            )
            .await?;
        decode(response).await
    }

    async fn inspect_snapshot(
        &self,
        guestname: &str,
        snapshotname: &str,
    ) -> ProviderResult<SnapshotInfo> {
        let response = self
            .send(
                Method::GET,
                &format!("guests/{}/snapshots/{}", guestname, snapshotname),
                None,
                &[StatusCode::OK],
            )
            .await?;
        decode(response).await
    }

    async fn restore_snapshot(
        &self,
        guestname: &str,
        snapshotname: &str,
    ) -> ProviderResult<SnapshotInfo> {
        let response = self
            .send(
                Method::POST,
                &format!("guests/{}/snapshots/{}/restore", guestname, snapshotname),
                None,
                &[StatusCode::CREATED],
            )
            .await?;
        decode(response).await
    }

    async fn cancel_snapshot(&self, guestname: &str, snapshotname: &str) -> ProviderResult<()> {
        self.send(
            Method::DELETE,
            &format!("guests/{}/snapshots/{}", guestname, snapshotname),
            None,
            &[StatusCode::NO_CONTENT, StatusCode::NOT_FOUND],
        )
        .await?;
        Ok(())
    }

    async fn guest_events(&self, guestname: &str) -> ProviderResult<Vec<GuestEvent>> {
        let mut events = Vec::new();
        for page in 1..=EVENTS_MAX_PAGES {
            let path = format!(
                "guests/{}/events?page_size={}&page={}",
                guestname, EVENTS_PAGE_SIZE, page
            );
            let response = self
                .send(Method::GET, &path, None, &[StatusCode::OK])
                .await?;
            let batch: Vec<GuestEvent> = decode(response).await?;
            let last = batch.len() < EVENTS_PAGE_SIZE;
            events.extend(batch);
            if last {
                break;
            }
        }
        Ok(events)
    }

    async fn console_log(&self, guestname: &str) -> ProviderResult<Option<String>> {
        let path = format!("guests/{}/logs/{}", guestname, CONSOLE_LOG);
        let response = self
            .send(
                Method::GET,
                &path,
                None,
                &[StatusCode::OK, StatusCode::NOT_FOUND, StatusCode::CONFLICT],
            )
            .await?;

        if response.status() != StatusCode::OK {
            // No fresh log yet; ask for one so the next dump has it.
            self.send(Method::POST, &path, None, &[StatusCode::ACCEPTED])
                .await?;
            return Ok(None);
        }

        let body: Value = decode(response).await?;
        Ok(body.get("blob").and_then(Value::as_str).map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_request_body_layout() {
        let env = TestingEnvironment::new("x86_64", "RHEL-9.4")
            .with_snapshots(true)
            .with_hardware(json!({"memory": ">= 8 GiB"}));
        let options = ProvisionOptions {
            keyname: Some("ci".to_string()),
            priority_group: Some("default-priority".to_string()),
            pool: Some("aws".to_string()),
            watchdog_dispatch_delay: Some(600),
            ..ProvisionOptions::default()
        }
        .tag("entry-id", "e1");

        let body = guest_request_body(&env, &options, None);

        assert_eq!(body["keyname"], "ci");
        assert_eq!(body["environment"]["hw"]["arch"], "x86_64");
        assert_eq!(body["environment"]["hw"]["constraints"]["memory"], ">= 8 GiB");
        assert_eq!(body["environment"]["os"]["compose"], "RHEL-9.4");
        assert_eq!(body["environment"]["snapshots"], true);
        assert_eq!(body["environment"]["pool"], "aws");
        assert_eq!(body["environment"]["kickstart"], json!({}));
        assert_eq!(body["user_data"]["entry-id"], "e1");
        assert_eq!(body["watchdog_dispatch_delay"], 600);
        assert!(body.get("watchdog_period_delay").is_none());
    }

    #[test]
    fn test_environment_pool_used_without_override() {
        let env = TestingEnvironment::new("aarch64", "Fedora").with_pool("openstack");
        let body = guest_request_body(&env, &ProvisionOptions::default(), None);
        assert_eq!(body["environment"]["pool"], "openstack");
        assert_eq!(body["user_data"], json!(BTreeMap::<String, String>::new()));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, r#"{"message": "unknown compose"}"#),
            ProviderError::Rejected(m) if m == "unknown compose"
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "Quota exceeded"),
            ProviderError::QuotaDenied(_)
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            ProviderError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_inline_post_install_script_is_unescaped() {
        let script = post_install_script("echo a\\necho b").await.unwrap();
        assert_eq!(script, "echo a\necho b");
    }

    #[tokio::test]
    async fn test_post_install_script_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("setup.sh");
        std::fs::write(&path, "dnf -y install make\n").unwrap();

        let script = post_install_script(path.to_str().unwrap()).await.unwrap();
        assert_eq!(script, "dnf -y install make\n");
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let config: ArtemisProviderConfig = toml::from_str(
            r#"
            api_url = "http://localhost:8001/v0.0.56/"
            keyname = "ci"
        "#,
        )
        .unwrap();
        let client = ArtemisClient::new(&config).unwrap();
        assert_eq!(client.url("guests/"), "http://localhost:8001/v0.0.56/guests/");
    }
}
