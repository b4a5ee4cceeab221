//! Stage 1: static attribute screen.
//!
//! One reference fetch, no per-instrument I/O. An instrument is excluded on the
//! first set flag in [`FlagCategory::ALL`] order. A category the feed does
//! not carry (`None`) is never treated as set or clear; it is counted as a
//! data gap instead.

use crate::domain::{FlagCategory, Instrument, ListingStatus};

use super::stage::{ExclusionReason, FilterStageResult, StageKind, StageRecorder};

/// Result of screening one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticVerdict {
    Pass,
    Excluded(FlagCategory),
}

/// Screen one instrument, reporting categories with no data into `gaps`.
pub fn screen(instrument: &Instrument, gaps: &mut Vec<FlagCategory>) -> StaticVerdict {
    let mut hit = None;
    for category in FlagCategory::ALL {
        let value = match (category, instrument.listing) {
            // A delisting listing status is evidence even when the flag is absent.
            (FlagCategory::Delisted, ListingStatus::Delisting) => Some(true),
            _ => instrument.flags.get(category),
        };
        match value {
            Some(true) if hit.is_none() => hit = Some(category),
            Some(_) => {}
            None => gaps.push(category),
        }
    }
    match hit {
        Some(category) => StaticVerdict::Excluded(category),
        None => StaticVerdict::Pass,
    }
}

/// Run stage 1 over a reference universe, preserving input order.
pub fn run(universe: &[Instrument]) -> (FilterStageResult, Vec<Instrument>) {
    let mut recorder = StageRecorder::new(
        StageKind::StaticAttributes,
        universe.iter().map(|i| i.id.clone()).collect(),
    );
    let mut retained = Vec::with_capacity(universe.len());
    let mut gaps = Vec::with_capacity(FlagCategory::ALL.len());

    for instrument in universe {
        gaps.clear();
        let verdict = screen(instrument, &mut gaps);
        for category in &gaps {
            *recorder.diagnostics.data_gaps.entry(*category).or_insert(0) += 1;
        }
        match verdict {
            StaticVerdict::Pass => {
                recorder.retain(instrument.id.clone());
                retained.push(instrument.clone());
            }
            StaticVerdict::Excluded(category) => {
                recorder.exclude(instrument.id.clone(), ExclusionReason::Flagged { category });
            }
        }
    }

    if let Some(missing) = recorder.diagnostics.data_gaps.values().max() {
        tracing::warn!(
            instruments_missing = *missing,
            categories = recorder.diagnostics.data_gaps.len(),
            "classification data gaps; affected exclusions skipped"
        );
    }

    (recorder.finish(), retained)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_instrument_passes() {
        let inst = Instrument::new("600000", Some("Banks"));
        let mut gaps = Vec::new();
        assert_eq!(screen(&inst, &mut gaps), StaticVerdict::Pass);
        assert!(gaps.is_empty());
    }

    #[test]
    fn first_set_flag_names_the_exclusion() {
        let inst = Instrument::new("600001", None)
            .with_flag(FlagCategory::Suspended, Some(true))
            .with_flag(FlagCategory::SpecialTreatment, Some(true));
        let mut gaps = Vec::new();
        assert_eq!(
            screen(&inst, &mut gaps),
            StaticVerdict::Excluded(FlagCategory::SpecialTreatment)
        );
    }

    #[test]
    fn unknown_category_is_skipped_and_counted() {
        let inst = Instrument::new("600002", None).with_flag(FlagCategory::Suspended, None);
        let (result, retained) = run(&[inst]);
        assert_eq!(retained.len(), 1);
        assert_eq!(result.diagnostics.data_gaps.get(&FlagCategory::Suspended), Some(&1));
        assert!(result.counts_balance());
    }

    #[test]
    fn delisting_status_excludes_without_flag() {
        let mut inst = Instrument::new("600003", None).with_flag(FlagCategory::Delisted, None);
        inst.listing = ListingStatus::Delisting;
        let mut gaps = Vec::new();
        assert_eq!(
            screen(&inst, &mut gaps),
            StaticVerdict::Excluded(FlagCategory::Delisted)
        );
        assert!(gaps.is_empty());
    }
}
