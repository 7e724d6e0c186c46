//! Notification fan-out for emergency sessions.
//!
//! Three recipient sets, with different delivery guarantees:
//!
//! - **Responder channel**: the fixed security-role set. Alerting it is the
//!   one dispatch whose success gates a status transition; the
//!   highest-severity categories also get the SMS side channel.
//! - **Nearby volunteers**: best-effort, radius-filtered.
//! - **Emergency contacts**: best-effort, push to app installs plus SMS to
//!   phone numbers.
//!
//! Volunteer and contact failures are logged only; they never reach the
//! caller of the enclosing operation.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::backend::DocumentStore;
use crate::gateways::{
    ContactSmsRequest, EmergencySmsRequest, PushGateway, PushPayload, SmsGateway,
};
use crate::gateways::push::PushPriority;
use crate::geo;
use crate::model::{EmergencyType, LocationFix, Priority};

/// Fan-out dispatcher over the push and SMS gateways.
pub struct NotificationDispatcher {
    store: Arc<dyn DocumentStore>,
    push: Arc<dyn PushGateway>,
    sms: Arc<dyn SmsGateway>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        push: Arc<dyn PushGateway>,
        sms: Arc<dyn SmsGateway>,
    ) -> Self {
        Self { store, push, sms }
    }

    /// Alert the responder channel. Returns whether at least one push was
    /// delivered; the SMS side channel (fire/medical/robbery-theft) is
    /// best-effort on top.
    pub async fn alert_responders(
        &self,
        emergency_type: EmergencyType,
        location: &LocationFix,
        session_id: &str,
    ) -> bool {
        let tokens = match self.store.security_push_tokens().await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "security token lookup failed");
                return false;
            }
        };

        if tokens.is_empty() {
            warn!(session_id, "no security push tokens registered");
            return false;
        }

        let payload = PushPayload::new(
            format!("{} EMERGENCY", emergency_type.label()),
            format!(
                "Emergency reported at {:.6}, {:.6}",
                location.latitude, location.longitude
            ),
        )
        .with_data(json!({
            "type": "emergency",
            "emergency_id": session_id,
            "emergency_type": emergency_type.label(),
            "location": { "latitude": location.latitude, "longitude": location.longitude },
            "priority": Priority::Critical,
        }))
        .with_priority(PushPriority::Max)
        .with_sound("emergency_alert.wav");

        let outcomes = self.push.send_bulk(&tokens, &payload).await;
        let delivered = outcomes.iter().filter(|o| o.success).count();

        if emergency_type.warrants_sms() {
            let request = EmergencySmsRequest {
                emergency_id: session_id.to_string(),
                emergency_type: emergency_type.label().to_string(),
                location: location.geo_point(),
                timestamp: Utc::now(),
            };
            if let Err(e) = self.sms.send_emergency_sms(&request).await {
                warn!(session_id, error = %e, "emergency SMS failed");
            }
        }

        info!(
            session_id,
            recipients = tokens.len(),
            delivered,
            "responder channel alerted"
        );
        delivered > 0
    }

    /// Notify verified, available volunteers within `radius_m`. Having no
    /// one nearby is not a failure.
    pub async fn notify_nearby_volunteers(
        &self,
        location: &LocationFix,
        emergency_type: EmergencyType,
        session_id: &str,
        radius_m: f64,
    ) -> bool {
        let candidates = match self.store.available_volunteers().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "volunteer lookup failed");
                return false;
            }
        };

        let nearby = geo::within_radius(
            candidates,
            location.latitude,
            location.longitude,
            radius_m,
            |v| (v.location.latitude, v.location.longitude),
        );

        if nearby.is_empty() {
            info!(session_id, radius_m, "no volunteers nearby");
            return true;
        }

        let payload = PushPayload::new(
            format!("Help Needed - {}", emergency_type.label()),
            "Emergency reported near you. Can you assist?",
        )
        .with_data(json!({
            "type": "volunteer_request",
            "emergency_id": session_id,
            "emergency_type": emergency_type.label(),
            "location": { "latitude": location.latitude, "longitude": location.longitude },
        }))
        .with_sound("volunteer_alert.wav");

        let tokens: Vec<String> = nearby.iter().map(|r| r.item.push_token.clone()).collect();
        let outcomes = self.push.send_bulk(&tokens, &payload).await;

        info!(
            session_id,
            volunteers = nearby.len(),
            "nearby volunteers notified"
        );
        outcomes.iter().any(|o| o.success)
    }

    /// Notify the reporter's emergency contacts: push where a token is
    /// registered, SMS where a phone number is.
    pub async fn notify_emergency_contacts(
        &self,
        user_id: &str,
        emergency_type: EmergencyType,
        location: &LocationFix,
        session_id: &str,
    ) -> bool {
        let contacts = match self.store.emergency_contacts(user_id).await {
            Ok(contacts) => contacts,
            Err(e) => {
                warn!(error = %e, "contact lookup failed");
                return false;
            }
        };

        if contacts.is_empty() {
            info!(session_id, "no emergency contacts registered");
            return true;
        }

        let payload = PushPayload::new(
            "Emergency Alert",
            format!(
                "Your contact has reported a {} emergency and may need assistance.",
                emergency_type.label()
            ),
        )
        .with_data(json!({
            "type": "emergency_contact",
            "emergency_id": session_id,
            "emergency_type": emergency_type.label(),
            "location": { "latitude": location.latitude, "longitude": location.longitude },
        }));

        let tokens: Vec<String> = contacts
            .iter()
            .filter_map(|c| c.push_token.clone())
            .collect();
        if !tokens.is_empty() {
            self.push.send_bulk(&tokens, &payload).await;
        }

        let phone_numbers: Vec<String> = contacts.iter().filter_map(|c| c.phone.clone()).collect();
        if !phone_numbers.is_empty() {
            let request = ContactSmsRequest {
                phone_numbers,
                emergency_type: emergency_type.label().to_string(),
                location: location.geo_point(),
                timestamp: Utc::now(),
            };
            if let Err(e) = self.sms.send_contact_sms(&request).await {
                warn!(session_id, error = %e, "contact SMS failed");
            }
        }

        info!(session_id, contacts = contacts.len(), "emergency contacts notified");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EmergencyContact, MemoryStore, Volunteer};
    use crate::gateways::{MemoryPushGateway, MemorySmsGateway};
    use crate::model::GeoPoint;

    fn fix() -> LocationFix {
        LocationFix {
            latitude: 3.1275,
            longitude: 101.6412,
            accuracy: 5.0,
            altitude: None,
            heading: None,
            speed: None,
            timestamp: Utc::now(),
        }
    }

    fn dispatcher() -> (
        NotificationDispatcher,
        Arc<MemoryStore>,
        Arc<MemoryPushGateway>,
        Arc<MemorySmsGateway>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let push = Arc::new(MemoryPushGateway::new());
        let sms = Arc::new(MemorySmsGateway::new());
        (
            NotificationDispatcher::new(store.clone(), push.clone(), sms.clone()),
            store,
            push,
            sms,
        )
    }

    #[tokio::test]
    async fn test_alert_responders_sends_push_and_sms_for_fire() {
        let (dispatcher, store, push, sms) = dispatcher();
        store.set_security_tokens(vec!["sec-1".to_string(), "sec-2".to_string()]);

        let alerted = dispatcher
            .alert_responders(EmergencyType::Fire, &fix(), "em-1")
            .await;

        assert!(alerted);
        assert_eq!(push.sent().len(), 1);
        assert_eq!(push.sent()[0].0.len(), 2);
        assert_eq!(sms.emergency_sent().len(), 1);
    }

    #[tokio::test]
    async fn test_alert_responders_skips_sms_for_accident() {
        let (dispatcher, store, _, sms) = dispatcher();
        store.set_security_tokens(vec!["sec-1".to_string()]);

        dispatcher
            .alert_responders(EmergencyType::Accident, &fix(), "em-1")
            .await;

        assert!(sms.emergency_sent().is_empty());
    }

    #[tokio::test]
    async fn test_alert_responders_without_tokens_is_false() {
        let (dispatcher, _, push, _) = dispatcher();

        let alerted = dispatcher
            .alert_responders(EmergencyType::Fire, &fix(), "em-1")
            .await;

        assert!(!alerted);
        assert!(push.sent().is_empty());
    }

    #[tokio::test]
    async fn test_volunteers_filtered_by_radius() {
        let (dispatcher, store, push, _) = dispatcher();
        store.insert_volunteer(Volunteer {
            id: "vol-near".to_string(),
            name: "Alex".to_string(),
            push_token: "tok-near".to_string(),
            location: GeoPoint {
                latitude: 3.1280,
                longitude: 101.6412,
            },
            verified: true,
            available: true,
        });
        store.insert_volunteer(Volunteer {
            id: "vol-far".to_string(),
            name: "Sam".to_string(),
            push_token: "tok-far".to_string(),
            location: GeoPoint {
                latitude: 3.5,
                longitude: 101.9,
            },
            verified: true,
            available: true,
        });

        let notified = dispatcher
            .notify_nearby_volunteers(&fix(), EmergencyType::RobberyTheft, "em-1", 1_000.0)
            .await;

        assert!(notified);
        assert_eq!(push.sent().len(), 1);
        assert_eq!(push.sent()[0].0, vec!["tok-near".to_string()]);
    }

    #[tokio::test]
    async fn test_no_volunteers_nearby_is_not_a_failure() {
        let (dispatcher, _, push, _) = dispatcher();

        let notified = dispatcher
            .notify_nearby_volunteers(&fix(), EmergencyType::Fire, "em-1", 500.0)
            .await;

        assert!(notified);
        assert!(push.sent().is_empty());
    }

    #[tokio::test]
    async fn test_contacts_get_push_and_sms() {
        let (dispatcher, store, push, sms) = dispatcher();
        store.insert_contact(EmergencyContact {
            id: "c-1".to_string(),
            user_id: "user-1".to_string(),
            name: "Parent".to_string(),
            phone: Some("+60123456789".to_string()),
            push_token: Some("tok-parent".to_string()),
        });
        store.insert_contact(EmergencyContact {
            id: "c-2".to_string(),
            user_id: "user-1".to_string(),
            name: "Friend".to_string(),
            phone: None,
            push_token: None,
        });

        let notified = dispatcher
            .notify_emergency_contacts("user-1", EmergencyType::Medical, &fix(), "em-1")
            .await;

        assert!(notified);
        assert_eq!(push.sent().len(), 1);
        assert_eq!(push.sent()[0].0, vec!["tok-parent".to_string()]);
        assert_eq!(sms.contact_sent().len(), 1);
        assert_eq!(sms.contact_sent()[0].phone_numbers.len(), 1);
    }
}
