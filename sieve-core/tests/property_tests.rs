//! Property tests for funnel invariants.
//!
//! Uses proptest to verify, for arbitrary universes:
//! 1. Stage output is a subset of stage input
//! 2. input_count = output_count + filtered_count
//! 3. Stage 3 output is sorted by ratio and never exceeds the cap
//! 4. An absolute veto always blocks, whatever the other inputs

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use proptest::prelude::*;
use sieve_core::data::MemorySource;
use sieve_core::domain::{
    Bar, FlagCategory, Instrument, InstrumentId, SessionId, SignalId, SituationLabel, TickEvent,
    TradeSide, TradeSignal,
};
use sieve_core::funnel::{FilterStageResult, FunnelConfig, FunnelFilter};
use sieve_core::gatekeeper::{GatekeeperConfig, PeerQuote, TradeGatekeeper, Verdict};
use sieve_core::rng::SeedHierarchy;

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_flag() -> impl Strategy<Value = Option<bool>> {
    prop_oneof![Just(None), Just(Some(false)), Just(Some(true))]
}

fn arb_instrument(i: usize) -> impl Strategy<Value = Instrument> {
    (arb_flag(), arb_flag(), arb_flag(), arb_flag()).prop_map(move |(st, dl, su, rv)| {
        Instrument::new(format!("{:06}", 800_000 + i), None)
            .with_flag(FlagCategory::SpecialTreatment, st)
            .with_flag(FlagCategory::Delisted, dl)
            .with_flag(FlagCategory::Suspended, su)
            .with_flag(FlagCategory::RestrictedVenue, rv)
    })
}

fn arb_universe() -> impl Strategy<Value = Vec<Instrument>> {
    (1usize..60).prop_flat_map(|n| (0..n).map(arb_instrument).collect::<Vec<_>>())
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
}

fn seeds() -> SeedHierarchy {
    SeedHierarchy::new(11, SessionId::derive(date(), 11))
}

fn daily(notional: f64) -> Vec<Bar> {
    (1..=5)
        .map(|back| Bar {
            timestamp: (date() - Duration::days(back)).and_hms_opt(0, 0, 0).unwrap(),
            open: 10.0,
            high: 10.2,
            low: 9.8,
            close: 10.0,
            volume: (notional * 1_000.0) as u64,
            notional,
        })
        .collect()
}

fn assert_invariants(result: &FilterStageResult, input: &[InstrumentId]) -> Result<(), TestCaseError> {
    let input: HashSet<&InstrumentId> = input.iter().collect();
    prop_assert!(result.retained.iter().all(|id| input.contains(id)));
    prop_assert_eq!(result.input_count, result.output_count + result.filtered_count);
    prop_assert_eq!(result.input_count, input.len());
    prop_assert!(result.counts_balance());
    Ok(())
}

fn config() -> FunnelConfig {
    FunnelConfig {
        workers: 2,
        volume_ratio_floor: 0.5,
        ..FunnelConfig::default()
    }
}

// ── 1 & 2. Subset and count identity ─────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn stage1_output_is_subset_with_balanced_counts(universe in arb_universe()) {
        let ids: Vec<InstrumentId> = universe.iter().map(|i| i.id.clone()).collect();
        let source = MemorySource::new("mem").with_reference(universe);
        let filter = FunnelFilter::new(config(), Arc::new(source), seeds(), date()).unwrap();
        let (result, retained) = filter.stage1();
        assert_invariants(&result, &ids)?;
        prop_assert_eq!(retained.len(), result.output_count);
    }

    #[test]
    fn stage2_output_is_subset_with_balanced_counts(
        notionals in prop::collection::vec(0.0f64..8_000.0, 1..60),
    ) {
        let universe: Vec<Instrument> = (0..notionals.len())
            .map(|i| Instrument::new(format!("{:06}", 810_000 + i), None))
            .collect();
        let mut source = MemorySource::new("mem");
        for (inst, notional) in universe.iter().zip(&notionals) {
            source = source.with_daily_bars(inst.id.clone(), daily(*notional));
        }
        let ids: Vec<InstrumentId> = universe.iter().map(|i| i.id.clone()).collect();
        let filter = FunnelFilter::new(config(), Arc::new(source), seeds(), date()).unwrap();
        let (result, candidates) = filter.stage2(&universe);
        assert_invariants(&result, &ids)?;
        let expected = notionals.iter().filter(|n| **n >= 3_000.0).count();
        prop_assert_eq!(candidates.len(), expected);
    }

    // ── 3. Stage 3 ordering and cap ──────────────────────────────────

    #[test]
    fn stage3_is_sorted_and_capped(size in 1usize..300, cap in 1usize..50) {
        let funnel_config = FunnelConfig { synthetic_universe_size: size, max_output: cap, ..config() };
        let filter = FunnelFilter::new(funnel_config, Arc::new(MemorySource::empty()), seeds(), date()).unwrap();
        let report = filter.run();
        for stage in &report.stages {
            prop_assert!(stage.counts_balance());
        }
        let shortlist = report.outcome.candidates();
        prop_assert!(shortlist.len() <= cap);
        for pair in shortlist.windows(2) {
            let (a, b) = (pair[0].volume_ratio.unwrap(), pair[1].volume_ratio.unwrap());
            prop_assert!(a > b || (a == b && pair[0].id() < pair[1].id()));
        }
    }

    // ── 4. Absolute veto ─────────────────────────────────────────────

    #[test]
    fn forbidden_label_always_blocks(
        inflow_ratio in -1.0f64..1.0,
        risk in 0.0f64..1.0,
        net_inflow in -500.0f64..500.0,
        strong_peers in 0usize..8,
    ) {
        let at = date().and_hms_opt(10, 0, 0).unwrap();
        let trigger = TickEvent {
            instrument: "600000".into(),
            price: 10.0,
            volume: 100,
            notional: 0.1,
            side: TradeSide::Buy,
            open: 10.0,
            high: 10.0,
            low: 10.0,
            reference_close: 9.5,
            ingested_at: at,
        };
        let signal = TradeSignal {
            id: SignalId(1),
            instrument: "600000".into(),
            score: 0.9,
            timestamp: at,
            trigger,
            sector: Some("Banks".into()),
            labels: vec![SituationLabel::HaltPending],
            net_inflow,
            inflow_ratio,
            risk_score: risk,
        };
        let peers: Vec<PeerQuote> = (0..strong_peers)
            .map(|i| PeerQuote {
                instrument: InstrumentId::new(format!("p{i}")),
                sector: Some("Banks".into()),
                change_pct: 7.0,
            })
            .collect();
        let gatekeeper = TradeGatekeeper::new(&GatekeeperConfig::default()).unwrap();
        let decision = gatekeeper.evaluate(&signal, &peers);
        prop_assert_eq!(decision.verdict, Verdict::Block);
        prop_assert_eq!(decision.evaluations.len(), 4);
    }
}
