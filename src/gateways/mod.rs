//! Delivery gateways for emergency notifications.
//!
//! This module provides clients for the external delivery channels: bulk
//! push notifications by device token, and the SMS side channel used for
//! the highest-severity emergencies.
//!
//! Both are consumed through traits so the orchestration core can run
//! against in-memory doubles; the HTTP implementations follow the backend's
//! public contracts.

pub mod push;
pub mod sms;

pub use push::{HttpPushGateway, MemoryPushGateway, PushGateway, PushOutcome, PushPayload};
pub use sms::{ContactSmsRequest, EmergencySmsRequest, HttpSmsGateway, MemorySmsGateway, SmsGateway};
