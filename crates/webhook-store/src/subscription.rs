use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use time::OffsetDateTime;
use uuid::Uuid;

/// Prefix carried by every generated signing secret.
pub const SECRET_PREFIX: &str = "whsec_";

/// A registered webhook endpoint.
///
/// Subscriptions are written by the management layer. The delivery engine
/// only reads them and bumps the trigger statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,

    pub organization_id: String,

    pub url: String,

    /// Signing key, generated once at creation.
    #[serde(skip_serializing, default)]
    pub secret: String,

    pub subscribed_events: HashSet<String>,

    pub enabled: bool,

    pub extra_headers: BTreeMap<String, String>,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_triggered_at: Option<OffsetDateTime>,

    #[serde(default)]
    pub trigger_count: u64,
}

impl Subscription {
    /// Create an enabled subscription with a fresh id and signing secret.
    pub fn new(organization_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            organization_id: organization_id.into(),
            url: url.into(),
            secret: generate_secret(),
            subscribed_events: HashSet::new(),
            enabled: true,
            extra_headers: BTreeMap::new(),
            last_triggered_at: None,
            trigger_count: 0,
        }
    }

    /// Replace the set of event types this subscription receives.
    pub fn subscribe_to(mut self, event_types: Vec<String>) -> Self {
        self.subscribed_events = event_types.into_iter().collect();
        self
    }

    /// Attach a static header sent with every delivery.
    pub fn with_extra_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    /// Whether a `trigger` for `event_type` should produce a delivery.
    ///
    /// An empty event set subscribes to nothing.
    pub fn is_subscribed(&self, event_type: &str) -> bool {
        self.enabled && self.subscribed_events.contains(event_type)
    }

    /// Replace the signing secret. Only explicit rotation changes it.
    pub fn rotate_secret(&mut self) -> &str {
        self.secret = generate_secret();
        &self.secret
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }
}

/// Generate a signing secret: `whsec_` followed by 32 random bytes in hex.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    format!("{SECRET_PREFIX}{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_creation() {
        let subscription = Subscription::new("org-1", "https://crm.example.com/hook");

        assert_eq!(subscription.organization_id, "org-1");
        assert_eq!(subscription.url, "https://crm.example.com/hook");
        assert!(subscription.enabled);
        assert!(subscription.subscribed_events.is_empty());
        assert_eq!(subscription.trigger_count, 0);
        assert!(subscription.last_triggered_at.is_none());
    }

    #[test]
    fn test_secret_generated_once_per_subscription() {
        let a = Subscription::new("org-1", "https://a.example.com");
        let b = Subscription::new("org-1", "https://a.example.com");

        assert!(a.secret.starts_with(SECRET_PREFIX));
        assert_eq!(a.secret.len(), SECRET_PREFIX.len() + 64);
        assert_ne!(a.secret, b.secret);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_rotate_secret_changes_secret() {
        let mut subscription = Subscription::new("org-1", "https://a.example.com");
        let before = subscription.secret.clone();
        let after = subscription.rotate_secret().to_string();
        assert_ne!(before, after);
        assert_eq!(subscription.secret, after);
    }

    #[test]
    fn test_subscribed_events_filter() {
        let subscription = Subscription::new("org-1", "https://a.example.com")
            .subscribe_to(vec!["lead.created".to_string(), "deal.won".to_string()]);

        assert!(subscription.is_subscribed("lead.created"));
        assert!(subscription.is_subscribed("deal.won"));
        assert!(!subscription.is_subscribed("lead.deleted"));
    }

    #[test]
    fn test_empty_event_set_matches_nothing() {
        let subscription = Subscription::new("org-1", "https://a.example.com");
        assert!(!subscription.is_subscribed("lead.created"));
    }

    #[test]
    fn test_disabled_subscription_does_not_match() {
        let mut subscription = Subscription::new("org-1", "https://a.example.com")
            .subscribe_to(vec!["lead.created".to_string()]);
        subscription.disable();
        assert!(!subscription.is_subscribed("lead.created"));

        subscription.enable();
        assert!(subscription.is_subscribed("lead.created"));
    }

    #[test]
    fn test_secret_is_not_serialized() -> Result<(), serde_json::Error> {
        let subscription = Subscription::new("org-1", "https://a.example.com")
            .with_extra_header("X-Tenant", "acme");

        let json = serde_json::to_string(&subscription)?;
        assert!(!json.contains(&subscription.secret));

        let back: Subscription = serde_json::from_str(&json)?;
        assert_eq!(back.id, subscription.id);
        assert!(back.secret.is_empty());
        assert_eq!(back.extra_headers.get("X-Tenant").map(String::as_str), Some("acme"));
        Ok(())
    }
}
