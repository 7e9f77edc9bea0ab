//! Closed set of event names the saga understands.

use serde::{Deserialize, Serialize};

/// Discriminator selecting which step handler(s) apply to an envelope.
///
/// Names outside the known set deserialize to [`EventName::Unknown`] so that the
/// dispatcher can log and drop them instead of failing the whole record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventName {
    CaseCreated,
    EligibilityAssessed,
    InsurancePeriodUpdated,
    CalculationDone,
    OffsetApplied,
    LetterSent,
    DecisionMade,
    DecisionApproved,
    Coordinated,
    CaseImplemented,
    /// Failure channel: carries failure envelopes from any step.
    StepFailed,
    Unknown(String),
}

impl EventName {
    pub const KNOWN: [EventName; 11] = [
        EventName::CaseCreated,
        EventName::EligibilityAssessed,
        EventName::InsurancePeriodUpdated,
        EventName::CalculationDone,
        EventName::OffsetApplied,
        EventName::LetterSent,
        EventName::DecisionMade,
        EventName::DecisionApproved,
        EventName::Coordinated,
        EventName::CaseImplemented,
        EventName::StepFailed,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            EventName::CaseCreated => "case.created",
            EventName::EligibilityAssessed => "eligibility.assessed",
            EventName::InsurancePeriodUpdated => "insurance_period.updated",
            EventName::CalculationDone => "calculation.done",
            EventName::OffsetApplied => "offset.applied",
            EventName::LetterSent => "letter.sent",
            EventName::DecisionMade => "decision.made",
            EventName::DecisionApproved => "decision.approved",
            EventName::Coordinated => "coordination.done",
            EventName::CaseImplemented => "case.implemented",
            EventName::StepFailed => "step.failed",
            EventName::Unknown(name) => name,
        }
    }

    /// Parse a wire name. Never fails; unrecognised names become `Unknown`.
    pub fn parse(name: &str) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|known| known.as_str() == name)
            .unwrap_or_else(|| EventName::Unknown(name.to_string()))
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventName::Unknown(_))
    }
}

impl From<String> for EventName {
    fn from(value: String) -> Self {
        EventName::parse(&value)
    }
}

impl From<&str> for EventName {
    fn from(value: &str) -> Self {
        EventName::parse(value)
    }
}

impl From<EventName> for String {
    fn from(value: EventName) -> Self {
        match value {
            EventName::Unknown(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl core::fmt::Display for EventName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_parse_back() {
        for name in EventName::KNOWN {
            assert_eq!(EventName::parse(name.as_str()), name);
        }
    }

    #[test]
    fn unknown_names_are_kept_verbatim() {
        let name: EventName = serde_json::from_str("\"grunnlag.endret\"").unwrap();
        assert_eq!(name, EventName::Unknown("grunnlag.endret".to_string()));
        assert!(!name.is_known());
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"grunnlag.endret\"");
    }
}
