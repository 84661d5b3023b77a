//! Outbound message transports.
//!
//! Both traits are consumed by the `email`/`sms` job handlers; every error
//! is retriable at the queue layer, so a transport that cannot resolve a
//! recipient (missing phone number, blank address) simply fails until the
//! job exhausts its attempts and the channel drops out.

use async_trait::async_trait;
use serde_json::json;

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct SmsMessage {
    pub to: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("recipient unresolvable: {0}")]
    Unresolvable(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send_email(&self, msg: &EmailMessage) -> Result<(), TransportError>;
}

#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send_sms(&self, msg: &SmsMessage) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// HTTP adapters
// ---------------------------------------------------------------------------

/// JSON POST adapter for HTTP mail providers.
pub struct HttpEmailTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpEmailTransport {
    pub fn new(endpoint: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl EmailTransport for HttpEmailTransport {
    async fn send_email(&self, msg: &EmailMessage) -> Result<(), TransportError> {
        if msg.to.trim().is_empty() {
            return Err(TransportError::Unresolvable("empty email address".into()));
        }

        let mut req = self.client.post(&self.endpoint).json(&json!({
            "to": msg.to,
            "subject": msg.subject,
            "html": msg.html,
            "text": msg.text,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Unavailable(format!(
                "mail provider returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// JSON POST adapter for HTTP SMS providers.
pub struct HttpSmsTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpSmsTransport {
    pub fn new(endpoint: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl SmsTransport for HttpSmsTransport {
    async fn send_sms(&self, msg: &SmsMessage) -> Result<(), TransportError> {
        if msg.to.trim().is_empty() {
            return Err(TransportError::Unresolvable("no phone number on file".into()));
        }

        let mut req = self.client.post(&self.endpoint).json(&json!({
            "to": msg.to,
            "message": msg.message,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Unavailable(format!(
                "sms provider returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
