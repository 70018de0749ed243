use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// CRM events that can be delivered to webhook subscriptions.
///
/// Subscriptions store plain event-type strings; this catalogue is what the
/// product itself emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrmEvent {
    #[serde(rename = "lead.created")]
    LeadCreated,
    #[serde(rename = "lead.updated")]
    LeadUpdated,
    #[serde(rename = "lead.stage_changed")]
    LeadStageChanged,
    #[serde(rename = "lead.assigned")]
    LeadAssigned,
    #[serde(rename = "lead.deleted")]
    LeadDeleted,
    #[serde(rename = "deal.won")]
    DealWon,
    #[serde(rename = "deal.lost")]
    DealLost,
    #[serde(rename = "contact.created")]
    ContactCreated,
}

impl CrmEvent {
    pub const ALL: [CrmEvent; 8] = [
        CrmEvent::LeadCreated,
        CrmEvent::LeadUpdated,
        CrmEvent::LeadStageChanged,
        CrmEvent::LeadAssigned,
        CrmEvent::LeadDeleted,
        CrmEvent::DealWon,
        CrmEvent::DealLost,
        CrmEvent::ContactCreated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CrmEvent::LeadCreated => "lead.created",
            CrmEvent::LeadUpdated => "lead.updated",
            CrmEvent::LeadStageChanged => "lead.stage_changed",
            CrmEvent::LeadAssigned => "lead.assigned",
            CrmEvent::LeadDeleted => "lead.deleted",
            CrmEvent::DealWon => "deal.won",
            CrmEvent::DealLost => "deal.lost",
            CrmEvent::ContactCreated => "contact.created",
        }
    }
}

impl fmt::Display for CrmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown CRM event type: {0}")]
pub struct UnknownEvent(pub String);

impl FromStr for CrmEvent {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CrmEvent::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_round_trip() {
        for event in CrmEvent::ALL {
            assert_eq!(event.as_str().parse::<CrmEvent>(), Ok(event));
        }
    }

    #[test]
    fn test_serde_uses_dotted_names() -> Result<(), serde_json::Error> {
        assert_eq!(
            serde_json::to_string(&CrmEvent::LeadStageChanged)?,
            "\"lead.stage_changed\""
        );
        let event: CrmEvent = serde_json::from_str("\"deal.won\"")?;
        assert_eq!(event, CrmEvent::DealWon);
        Ok(())
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let err = "lead.exploded".parse::<CrmEvent>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown CRM event type: lead.exploded");
    }
}
