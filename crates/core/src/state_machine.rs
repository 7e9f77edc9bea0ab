//! Case lifecycle state machine.
//!
//! Pure functions only: `(current, requested, mode) -> new status | rejection`.
//! Nothing here performs IO; persisting the result is the caller's job.
//!
//! Rules:
//! - re-entering the current status is always accepted (saga steps may be redelivered)
//! - `Iverksatt` and `Avbrutt` accept nothing but themselves
//! - `Manual` cases follow a fixed adjacency table
//! - `Automatic` cases may jump to any later main-line status in one call
//! - `Returnert` is only entered from `Attestert` and only left towards
//!   `Opprettet`/`Vilkaarsvurdert`, in both modes
//! - `Avbrutt` is reachable from every status that [`CaseStatus::is_abortable`]

use std::collections::BTreeSet;

use crate::error::TransitionError;
use crate::status::{CaseStatus, ProcessingMode};

/// Decide the next status of a case.
pub fn transition(
    current: CaseStatus,
    requested: CaseStatus,
    mode: ProcessingMode,
) -> Result<CaseStatus, TransitionError> {
    if current == requested {
        return Ok(current);
    }
    if current.is_terminal() {
        return Err(TransitionError::Terminal {
            status: current,
            requested,
        });
    }
    if reachable(current, mode).contains(&requested) {
        Ok(requested)
    } else {
        Err(TransitionError::IllegalState {
            from: current,
            to: requested,
            mode,
        })
    }
}

/// The full set of statuses `transition` accepts from `current` under `mode`.
pub fn reachable(current: CaseStatus, mode: ProcessingMode) -> BTreeSet<CaseStatus> {
    let mut set = BTreeSet::from([current]);
    if current.is_terminal() {
        return set;
    }

    match mode {
        ProcessingMode::Manual => set.extend(manual_edges(current).iter().copied()),
        ProcessingMode::Automatic => set.extend(automatic_edges(current)),
    }
    if current.is_abortable() {
        set.insert(CaseStatus::Avbrutt);
    }
    set
}

fn manual_edges(current: CaseStatus) -> &'static [CaseStatus] {
    use CaseStatus::*;

    match current {
        Opprettet => &[Vilkaarsvurdert],
        Vilkaarsvurdert => &[Opprettet, TrygdetidOppdatert],
        TrygdetidOppdatert => &[Opprettet, Vilkaarsvurdert, Beregnet],
        Beregnet => &[Opprettet, Vilkaarsvurdert, TrygdetidOppdatert, Avkortet, FattetVedtak],
        Avkortet => &[Opprettet, Vilkaarsvurdert, TrygdetidOppdatert, Beregnet, FattetVedtak],
        FattetVedtak => &[Attestert],
        Attestert => &[Returnert, TilSamordning, Iverksatt],
        Returnert => &[Opprettet, Vilkaarsvurdert],
        TilSamordning => &[Samordnet],
        Samordnet => &[Iverksatt],
        Iverksatt | Avbrutt => &[],
    }
}

fn automatic_edges(current: CaseStatus) -> Vec<CaseStatus> {
    if current == CaseStatus::Returnert {
        return manual_edges(current).to_vec();
    }

    let Some(rank) = current.rank() else {
        return Vec::new();
    };
    let mut edges: Vec<_> = CaseStatus::ALL
        .into_iter()
        .filter(|s| s.rank().is_some_and(|r| r > rank))
        .collect();
    if current == CaseStatus::Attestert {
        edges.push(CaseStatus::Returnert);
    }
    edges
}
