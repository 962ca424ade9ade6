//! Post-delivery callbacks
//!
//! A [`CallbackRegistry`] holds an ordered list of [`DeliveryCallback`]s.
//! `after_delivery` runs once per message added to a local mailbox;
//! `forward_without_delivery` runs for recipients whose account has local
//! delivery disabled but a forwarding address set.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use postbox_common::config::WebhookConfig;
use postbox_storage::models::{Account, ParsedMessage, StoredMessage};
use postbox_storage::Mailbox;
use reqwest::{Client, Url};
use serde::Serialize;
use sha2::Sha256;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex HMAC of the body>`
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

#[derive(Debug, Error)]
pub enum CallbackError {
    /// Logged; delivery continues
    #[error("callback failed: {0}")]
    Failed(String),

    /// Resource exhaustion; the process halts
    #[error("fatal callback error: {0}")]
    Fatal(String),
}

impl From<anyhow::Error> for CallbackError {
    fn from(e: anyhow::Error) -> Self {
        CallbackError::Failed(e.to_string())
    }
}

/// Who the message was for
pub struct DeliveryEvent<'a> {
    pub account: &'a Account,
    pub mailbox: &'a dyn Mailbox,
    pub sender: &'a str,
    pub recipient: &'a str,
}

#[async_trait]
pub trait DeliveryCallback: Send + Sync {
    fn name(&self) -> &str;

    async fn after_delivery(
        &self,
        _event: &DeliveryEvent<'_>,
        _message: &StoredMessage,
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    async fn forward_without_delivery(
        &self,
        _event: &DeliveryEvent<'_>,
        _message: &ParsedMessage,
    ) -> Result<(), CallbackError> {
        Ok(())
    }
}

/// Ordered callback list
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: RwLock<Vec<Arc<dyn DeliveryCallback>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: Arc<dyn DeliveryCallback>) {
        info!(callback = callback.name(), "Registering delivery callback");
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    /// Callbacks in registration order
    pub fn callbacks(&self) -> Vec<Arc<dyn DeliveryCallback>> {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Circuit breaker state for the webhook endpoint
#[derive(Debug, Clone, Default)]
struct CircuitBreakerState {
    failure_count: u32,
    last_failure: Option<DateTime<Utc>>,
    is_open: bool,
}

/// JSON body posted to the webhook
#[derive(Debug, Serialize)]
struct Notification<'a> {
    event: &'a str,
    account: &'a str,
    account_id: Uuid,
    mailbox_id: Uuid,
    sender: &'a str,
    recipient: &'a str,
    message_id: Option<Uuid>,
    folder_id: Option<Uuid>,
    message_id_header: Option<&'a str>,
    subject: Option<&'a str>,
    size: usize,
    timestamp: DateTime<Utc>,
}

/// Posts a signed JSON notification for every delivery
pub struct WebhookCallback {
    url: Url,
    secret: Option<String>,
    http_client: Client,
    circuit: Arc<AsyncRwLock<CircuitBreakerState>>,
    /// Maximum consecutive failures before the circuit opens
    circuit_threshold: u32,
    circuit_reset_timeout: Duration,
}

impl WebhookCallback {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let url = if config.allow_private_targets {
            Url::parse(&config.url).map_err(|e| anyhow!("Invalid webhook URL: {}", e))?
        } else {
            validate_webhook_url(&config.url)?
        };

        let http_client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            url,
            secret: config.secret.clone(),
            http_client,
            circuit: Arc::new(AsyncRwLock::new(CircuitBreakerState::default())),
            circuit_threshold: 5,
            circuit_reset_timeout: Duration::from_secs(60),
        })
    }

    async fn notify(&self, notification: &Notification<'_>) -> Result<(), CallbackError> {
        if self.is_circuit_open().await {
            warn!(url = %self.url, "Circuit breaker open, skipping webhook");
            return Ok(());
        }

        match self.post(notification).await {
            Ok(()) => {
                self.record_success().await;
                debug!(url = %self.url, event = notification.event, "Webhook delivered");
                Ok(())
            }
            Err(e) => {
                self.record_failure().await;
                Err(CallbackError::Failed(e.to_string()))
            }
        }
    }

    async fn post(&self, notification: &Notification<'_>) -> Result<()> {
        let body = serde_json::to_vec(notification)?;

        let mut request = self
            .http_client
            .post(self.url.clone())
            .header("Content-Type", "application/json");

        if let Some(ref secret) = self.secret {
            request = request.header(SIGNATURE_HEADER, format!("sha256={}", sign(secret, &body)?));
        }

        let response = request.body(body).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("Webhook returned status {}", response.status()));
        }
        Ok(())
    }

    async fn is_circuit_open(&self) -> bool {
        let state = self.circuit.read().await;
        if !state.is_open {
            return false;
        }
        match state.last_failure {
            Some(last_failure) => {
                let elapsed = Utc::now()
                    .signed_duration_since(last_failure)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                elapsed < self.circuit_reset_timeout
            }
            None => false,
        }
    }

    async fn record_success(&self) {
        let mut state = self.circuit.write().await;
        state.failure_count = 0;
        state.is_open = false;
    }

    async fn record_failure(&self) {
        let mut state = self.circuit.write().await;
        state.failure_count += 1;
        state.last_failure = Some(Utc::now());

        if state.failure_count >= self.circuit_threshold && !state.is_open {
            state.is_open = true;
            warn!(
                url = %self.url,
                failures = state.failure_count,
                "Circuit breaker opened for webhook"
            );
        }
    }
}

#[async_trait]
impl DeliveryCallback for WebhookCallback {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn after_delivery(
        &self,
        event: &DeliveryEvent<'_>,
        message: &StoredMessage,
    ) -> Result<(), CallbackError> {
        self.notify(&Notification {
            event: "delivered",
            account: &event.account.name,
            account_id: event.account.id,
            mailbox_id: event.mailbox.id(),
            sender: event.sender,
            recipient: event.recipient,
            message_id: Some(message.id),
            folder_id: Some(message.folder_id),
            message_id_header: message.message_id_header.as_deref(),
            subject: message.subject.as_deref(),
            size: message.size,
            timestamp: Utc::now(),
        })
        .await
    }

    async fn forward_without_delivery(
        &self,
        event: &DeliveryEvent<'_>,
        message: &ParsedMessage,
    ) -> Result<(), CallbackError> {
        self.notify(&Notification {
            event: "forwarded",
            account: &event.account.name,
            account_id: event.account.id,
            mailbox_id: event.mailbox.id(),
            sender: event.sender,
            recipient: event.recipient,
            message_id: None,
            folder_id: None,
            message_id_header: message.message_id.as_deref(),
            subject: message.subject.as_deref(),
            size: message.size(),
            timestamp: Utc::now(),
        })
        .await
    }
}

/// Hex HMAC-SHA256 of `body` under `secret`
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("Invalid HMAC key: {}", e))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Reject non-HTTP schemes and internal targets
fn validate_webhook_url(url_str: &str) -> Result<Url> {
    let url = Url::parse(url_str).map_err(|e| anyhow!("Invalid webhook URL: {}", e))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(anyhow!(
                "Webhook URL scheme '{}' is not allowed. Only http and https are permitted.",
                scheme
            ));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("Webhook URL has no host"))?;

    let lower_host = host.to_lowercase();
    if lower_host == "localhost"
        || lower_host.ends_with(".local")
        || lower_host.ends_with(".internal")
        || lower_host == "169.254.169.254"
    {
        return Err(anyhow!(
            "Webhook URL host '{}' is not allowed (internal/private address)",
            host
        ));
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(anyhow!(
                "Webhook URL IP '{}' is not allowed (private/internal range)",
                ip
            ));
        }
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_loopback()
                || ipv4.is_private()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_unspecified()
                // 100.64.0.0/10
                || ipv4.octets()[0] == 100 && (ipv4.octets()[1] & 0xC0) == 64
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                // fc00::/7
                || (ipv6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10
                || (ipv6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postbox_storage::MemoryMailbox;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn webhook(url: String, secret: Option<&str>) -> WebhookCallback {
        WebhookCallback::new(&WebhookConfig {
            url,
            secret: secret.map(str::to_string),
            timeout_ms: 2000,
            allow_private_targets: true,
        })
        .unwrap()
    }

    fn stored(mailbox: &MemoryMailbox) -> StoredMessage {
        StoredMessage {
            id: Uuid::now_v7(),
            mailbox_id: mailbox.id(),
            folder_id: Uuid::new_v4(),
            flags: Default::default(),
            tags: vec![],
            size: 42,
            message_id_header: Some("m1@example.com".to_string()),
            subject: Some("hello".to_string()),
            digest: None,
            raw: vec![],
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_validate_webhook_url() {
        assert!(validate_webhook_url("https://hooks.example.com/x").is_ok());
        assert!(validate_webhook_url("ftp://hooks.example.com/x").is_err());
        assert!(validate_webhook_url("http://localhost:8080/").is_err());
        assert!(validate_webhook_url("http://db.internal/").is_err());
        assert!(validate_webhook_url("http://10.1.2.3/").is_err());
        assert!(validate_webhook_url("http://100.64.0.1/").is_err());
        assert!(validate_webhook_url("http://[::1]/").is_err());
        assert!(validate_webhook_url("http://[fd00::1]/").is_err());
    }

    #[test]
    fn test_private_target_requires_opt_in() {
        let config = WebhookConfig {
            url: "http://127.0.0.1:9/hook".to_string(),
            secret: None,
            timeout_ms: 1000,
            allow_private_targets: false,
        };
        assert!(WebhookCallback::new(&config).is_err());
    }

    #[test]
    fn test_sign_is_stable() {
        let a = sign("secret", b"body").unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, sign("secret", b"body").unwrap());
        assert_ne!(a, sign("other", b"body").unwrap());
    }

    #[tokio::test]
    async fn test_after_delivery_posts_signed_notification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let callback = webhook(format!("{}/hook", server.uri()), Some("s3cret"));
        let account = Account::new("bob@example.com", "localhost");
        let mailbox = MemoryMailbox::new(&account);
        let event = DeliveryEvent {
            account: &account,
            mailbox: &mailbox,
            sender: "alice@example.com",
            recipient: "bob@example.com",
        };

        callback
            .after_delivery(&event, &stored(&mailbox))
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["event"], "delivered");
        assert_eq!(body["recipient"], "bob@example.com");
        assert_eq!(body["subject"], "hello");
    }

    #[tokio::test]
    async fn test_circuit_opens_after_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(5)
            .mount(&server)
            .await;

        let callback = webhook(format!("{}/hook", server.uri()), None);
        let account = Account::new("bob@example.com", "localhost");
        let mailbox = MemoryMailbox::new(&account);
        let event = DeliveryEvent {
            account: &account,
            mailbox: &mailbox,
            sender: "",
            recipient: "bob@example.com",
        };
        let message = stored(&mailbox);

        for _ in 0..5 {
            assert!(matches!(
                callback.after_delivery(&event, &message).await,
                Err(CallbackError::Failed(_))
            ));
        }
        assert!(callback.is_circuit_open().await);
        // Skipped without a request while open
        assert!(callback.after_delivery(&event, &message).await.is_ok());
    }

    struct Named(&'static str);

    #[async_trait]
    impl DeliveryCallback for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_registry_keeps_order() {
        let registry = CallbackRegistry::new();
        registry.register(Arc::new(Named("first")));
        registry.register(Arc::new(Named("second")));
        let names: Vec<String> = registry
            .callbacks()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
