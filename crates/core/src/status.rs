//! Lifecycle status, processing mode and case type.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle status of a case.
///
/// The main line runs `Opprettet` → `Iverksatt`; `Returnert` and `Avbrutt` are side
/// states. Transitions are decided by [`crate::state_machine::transition`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    Opprettet,
    Vilkaarsvurdert,
    TrygdetidOppdatert,
    Beregnet,
    Avkortet,
    FattetVedtak,
    Attestert,
    TilSamordning,
    Samordnet,
    Iverksatt,
    Returnert,
    Avbrutt,
}

impl CaseStatus {
    pub const ALL: [CaseStatus; 12] = [
        CaseStatus::Opprettet,
        CaseStatus::Vilkaarsvurdert,
        CaseStatus::TrygdetidOppdatert,
        CaseStatus::Beregnet,
        CaseStatus::Avkortet,
        CaseStatus::FattetVedtak,
        CaseStatus::Attestert,
        CaseStatus::TilSamordning,
        CaseStatus::Samordnet,
        CaseStatus::Iverksatt,
        CaseStatus::Returnert,
        CaseStatus::Avbrutt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CaseStatus::Opprettet => "OPPRETTET",
            CaseStatus::Vilkaarsvurdert => "VILKAARSVURDERT",
            CaseStatus::TrygdetidOppdatert => "TRYGDETID_OPPDATERT",
            CaseStatus::Beregnet => "BEREGNET",
            CaseStatus::Avkortet => "AVKORTET",
            CaseStatus::FattetVedtak => "FATTET_VEDTAK",
            CaseStatus::Attestert => "ATTESTERT",
            CaseStatus::TilSamordning => "TIL_SAMORDNING",
            CaseStatus::Samordnet => "SAMORDNET",
            CaseStatus::Iverksatt => "IVERKSATT",
            CaseStatus::Returnert => "RETURNERT",
            CaseStatus::Avbrutt => "AVBRUTT",
        }
    }

    /// Position on the main line, `None` for the side states.
    pub fn rank(self) -> Option<u8> {
        match self {
            CaseStatus::Opprettet => Some(0),
            CaseStatus::Vilkaarsvurdert => Some(1),
            CaseStatus::TrygdetidOppdatert => Some(2),
            CaseStatus::Beregnet => Some(3),
            CaseStatus::Avkortet => Some(4),
            CaseStatus::FattetVedtak => Some(5),
            CaseStatus::Attestert => Some(6),
            CaseStatus::TilSamordning => Some(7),
            CaseStatus::Samordnet => Some(8),
            CaseStatus::Iverksatt => Some(9),
            CaseStatus::Returnert | CaseStatus::Avbrutt => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CaseStatus::Iverksatt | CaseStatus::Avbrutt)
    }

    /// Whether the case may still be aborted from this status.
    ///
    /// Once the decision is approved the case can no longer be aborted.
    pub fn is_abortable(self) -> bool {
        matches!(
            self,
            CaseStatus::Opprettet
                | CaseStatus::Vilkaarsvurdert
                | CaseStatus::TrygdetidOppdatert
                | CaseStatus::Beregnet
                | CaseStatus::Avkortet
                | CaseStatus::FattetVedtak
                | CaseStatus::Returnert
        )
    }
}

impl core::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CaseStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown case status: {s}")))
    }
}

/// Whether a human gate exists between the processing steps.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingMode {
    Manual,
    /// Produced by trusted internal jobs; the transition guard degrades to a
    /// monotonicity check.
    Automatic,
}

impl ProcessingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingMode::Manual => "MANUAL",
            ProcessingMode::Automatic => "AUTOMATIC",
        }
    }
}

impl core::fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MANUAL" => Ok(ProcessingMode::Manual),
            "AUTOMATIC" => Ok(ProcessingMode::Automatic),
            _ => Err(DomainError::validation(format!("unknown processing mode: {s}"))),
        }
    }
}

/// Benefit category of a case.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseType {
    /// Child pension.
    Barnepensjon,
    /// Survivor pension (adjustment benefit).
    Omstillingsstoenad,
}

impl CaseType {
    pub fn as_str(self) -> &'static str {
        match self {
            CaseType::Barnepensjon => "BARNEPENSJON",
            CaseType::Omstillingsstoenad => "OMSTILLINGSSTOENAD",
        }
    }

    /// Whether income offsetting (avkorting) applies before a decision.
    pub fn requires_offset(self) -> bool {
        matches!(self, CaseType::Omstillingsstoenad)
    }
}

impl core::fmt::Display for CaseType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BARNEPENSJON" => Ok(CaseType::Barnepensjon),
            "OMSTILLINGSSTOENAD" => Ok(CaseType::Omstillingsstoenad),
            _ => Err(DomainError::validation(format!("unknown case type: {s}"))),
        }
    }
}
