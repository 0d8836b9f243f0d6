//! Condition aggregation.
//!
//! The aggregator folds per-component conditions into an overall `Ready`
//! condition and merges the freshly computed set against the previously
//! stored one so that `lastTransitionTime` only moves when (status, reason)
//! actually changed for a type.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use weft_core::{condition_types, reasons, CondStatus, Condition};

/// Overall readiness with precedence: any False wins, then any Unknown, then
/// True. The winning component donates its reason and message.
pub fn aggregate_ready(components: &[Condition]) -> Condition {
    if let Some(c) = components.iter().find(|c| c.status == CondStatus::False) {
        return Condition::new(condition_types::READY, CondStatus::False, c.reason.clone())
            .with_message(c.message.clone());
    }
    if let Some(c) = components.iter().find(|c| c.status == CondStatus::Unknown) {
        return Condition::new(condition_types::READY, CondStatus::Unknown, c.reason.clone())
            .with_message(c.message.clone());
    }
    Condition::new(condition_types::READY, CondStatus::True, reasons::READY)
}

/// Merge `computed` over `previous`. Entries whose (status, reason) is
/// unchanged for their type keep the previously recorded transition time;
/// everything else transitions at `now`. Order follows `computed`.
pub fn merge_conditions(previous: &[Condition], computed: Vec<Condition>, now: DateTime<Utc>) -> Vec<Condition> {
    computed
        .into_iter()
        .map(|mut c| {
            match previous.iter().find(|p| p.type_ == c.type_) {
                Some(p) if p.same_transition(&c) => c.last_transition_time = p.last_transition_time,
                _ => c.last_transition_time = now,
            }
            c
        })
        .collect()
}

/// Components plus the aggregated Ready, merged against the previous set.
pub fn finalize(
    previous: &[Condition],
    mut components: Vec<Condition>,
    observed_generation: i64,
    now: DateTime<Utc>,
) -> Vec<Condition> {
    components.push(aggregate_ready(&components));
    for c in &mut components {
        c.observed_generation = observed_generation;
    }
    merge_conditions(previous, components, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use weft_core::condition_types::{READY, RESOURCES_SUBMITTED, SUPPLY_CHAIN_READY};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn false_beats_unknown_beats_true() {
        let ready = aggregate_ready(&[
            Condition::new(SUPPLY_CHAIN_READY, CondStatus::True, "Ready"),
            Condition::new(RESOURCES_SUBMITTED, CondStatus::Unknown, "MissingValueAtPath"),
        ]);
        assert_eq!(ready.status, CondStatus::Unknown);
        assert_eq!(ready.reason, "MissingValueAtPath");

        let ready = aggregate_ready(&[
            Condition::new(SUPPLY_CHAIN_READY, CondStatus::False, "SupplyChainNotFound"),
            Condition::new(RESOURCES_SUBMITTED, CondStatus::Unknown, "MissingValueAtPath"),
        ]);
        assert_eq!(ready.status, CondStatus::False);
        assert_eq!(ready.reason, "SupplyChainNotFound");

        let ready = aggregate_ready(&[Condition::new(SUPPLY_CHAIN_READY, CondStatus::True, "Ready")]);
        assert_eq!(ready.status, CondStatus::True);
        assert_eq!(ready.reason, "Ready");
    }

    #[test]
    fn unchanged_transition_keeps_its_time() {
        let t1 = at(100);
        let t2 = at(200);
        let prev = merge_conditions(
            &[],
            vec![Condition::new(READY, CondStatus::False, "SupplyChainNotFound")],
            t1,
        );
        assert_eq!(prev[0].last_transition_time, t1);

        // Same (status, reason), new message: time must not move.
        let next = merge_conditions(
            &prev,
            vec![Condition::new(READY, CondStatus::False, "SupplyChainNotFound").with_message("still waiting")],
            t2,
        );
        assert_eq!(next[0].last_transition_time, t1);
        assert_eq!(next[0].message, "still waiting");
    }

    #[test]
    fn changed_status_or_reason_moves_the_time() {
        let t1 = at(100);
        let t2 = at(200);
        let prev = merge_conditions(&[], vec![Condition::new(READY, CondStatus::False, "SupplyChainNotFound")], t1);

        let next = merge_conditions(&prev, vec![Condition::new(READY, CondStatus::True, "Ready")], t2);
        assert_eq!(next[0].last_transition_time, t2);

        let next = merge_conditions(
            &prev,
            vec![Condition::new(READY, CondStatus::False, "MultipleMatches")],
            t2,
        );
        assert_eq!(next[0].last_transition_time, t2);
    }

    #[test]
    fn one_changed_type_does_not_perturb_the_others() {
        let t1 = at(100);
        let t2 = at(200);
        let prev = merge_conditions(
            &[],
            vec![
                Condition::new(SUPPLY_CHAIN_READY, CondStatus::True, "Ready"),
                Condition::new(RESOURCES_SUBMITTED, CondStatus::Unknown, "MissingValueAtPath"),
            ],
            t1,
        );
        let next = merge_conditions(
            &prev,
            vec![
                Condition::new(SUPPLY_CHAIN_READY, CondStatus::True, "Ready"),
                Condition::new(RESOURCES_SUBMITTED, CondStatus::True, "ResourceSubmissionComplete"),
            ],
            t2,
        );
        assert_eq!(next[0].last_transition_time, t1);
        assert_eq!(next[1].last_transition_time, t2);
    }

    #[test]
    fn finalize_appends_ready_and_stamps_generation() {
        let out = finalize(
            &[],
            vec![Condition::new(SUPPLY_CHAIN_READY, CondStatus::True, "Ready")],
            7,
            at(100),
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].type_, READY);
        assert!(out.iter().all(|c| c.observed_generation == 7));
    }
}
