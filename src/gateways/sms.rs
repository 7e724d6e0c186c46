//! SMS side-channel gateway.
//!
//! The highest-severity emergency categories trigger an SMS dispatch in
//! addition to push, routed through a backend function endpoint. Contact
//! SMS goes to the reporter's emergency contacts by phone number.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::GeoPoint;

/// Request for the responder-channel emergency SMS.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencySmsRequest {
    pub emergency_id: String,
    pub emergency_type: String,
    pub location: GeoPoint,
    pub timestamp: DateTime<Utc>,
}

/// Request for SMS to a reporter's emergency contacts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactSmsRequest {
    pub phone_numbers: Vec<String>,
    pub emergency_type: String,
    pub location: GeoPoint,
    pub timestamp: DateTime<Utc>,
}

/// SMS dispatch through the backend's callable functions.
#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send_emergency_sms(&self, request: &EmergencySmsRequest) -> anyhow::Result<()>;

    async fn send_contact_sms(&self, request: &ContactSmsRequest) -> anyhow::Result<()>;
}

/// Client for the SMS function endpoints.
#[derive(Clone)]
pub struct HttpSmsGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSmsGateway {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn call(&self, function: &str, body: &impl Serialize) -> anyhow::Result<()> {
        let url = format!("{}/{}", self.base_url, function);
        let response = self.client.post(&url).json(body).send().await?;
        response.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl SmsGateway for HttpSmsGateway {
    async fn send_emergency_sms(&self, request: &EmergencySmsRequest) -> anyhow::Result<()> {
        self.call("sendEmergencySMS", request).await
    }

    async fn send_contact_sms(&self, request: &ContactSmsRequest) -> anyhow::Result<()> {
        self.call("sendContactSMS", request).await
    }
}

/// Recording gateway for tests and the demo binary.
pub struct MemorySmsGateway {
    emergency: std::sync::Mutex<Vec<EmergencySmsRequest>>,
    contact: std::sync::Mutex<Vec<ContactSmsRequest>>,
}

impl MemorySmsGateway {
    pub fn new() -> Self {
        Self {
            emergency: std::sync::Mutex::new(Vec::new()),
            contact: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn emergency_sent(&self) -> Vec<EmergencySmsRequest> {
        self.emergency.lock().unwrap().clone()
    }

    pub fn contact_sent(&self) -> Vec<ContactSmsRequest> {
        self.contact.lock().unwrap().clone()
    }
}

impl Default for MemorySmsGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmsGateway for MemorySmsGateway {
    async fn send_emergency_sms(&self, request: &EmergencySmsRequest) -> anyhow::Result<()> {
        self.emergency.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn send_contact_sms(&self, request: &ContactSmsRequest) -> anyhow::Result<()> {
        self.contact.lock().unwrap().push(request.clone());
        Ok(())
    }
}
