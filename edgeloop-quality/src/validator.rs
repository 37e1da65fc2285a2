// Edgeloop Quality - Validation and aggregation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Quality validation of raw readings
//!
//! Each reading goes through, in order:
//!
//! 1. duplicate check on `(asset, parameter, device timestamp)`: dropped
//! 2. value check: NaN or infinite values are BAD (`invalid_value`)
//! 3. range check against the parameter's `[min, max]`: BAD (`range_violation`)
//! 4. rate-of-change check against the last accepted value: SUSPECT
//! 5. device timestamp check: missing or invalid is UNCERTAIN, gateway
//!    receipt time substituted
//!
//! A device timestamp is remembered whatever the verdict, so a re-sent
//! reading is dropped even when its first copy was dead-lettered. BAD
//! readings stop at the first failing check and go to the dead-letter
//! stream. Otherwise the worst quality found wins. Gap detection runs on
//! the side for every `(asset, parameter)`.

use std::collections::{HashMap, HashSet, VecDeque};

use edgeloop::reading::format_rfc3339;
use edgeloop::{
    topics, Classification, DeadLetterDecision, DeadLetterEntry, FailureReason, QualityCode,
    Reading, ReadingKey, SeriesKey, ValidationRules,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Component id stamped on synthetic gap events
pub const GAP_SOURCE: &str = "gap-detector";

/// Validator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Expected polling cadence of the source
    pub poll_interval_ms: u64,
    /// A gap is reported after `gap_factor * poll_interval_ms` of silence
    pub gap_factor: u64,
    /// Device timestamps remembered per series for duplicate detection
    pub dedup_capacity: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            gap_factor: 2,
            dedup_capacity: 4_096,
        }
    }
}

impl ValidatorConfig {
    pub fn with_poll_interval(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn gap_threshold_ms(&self) -> u64 {
        self.poll_interval_ms.saturating_mul(self.gap_factor)
    }
}

/// Outcome of validating one reading
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// GOOD, SUSPECT or UNCERTAIN copy for the clean stream
    Forward(Reading),
    /// BAD reading for the dead-letter stream
    DeadLetter(DeadLetterEntry),
    /// Already seen; not forwarded anywhere
    Duplicate(ReadingKey),
}

/// Verdict plus the gap event the reading revealed, if any
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub verdict: Verdict,
    pub gap: Option<Reading>,
}

/// A record to append to the log
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Clean(Reading),
    Alarm(Reading),
    DeadLetter(DeadLetterEntry),
    Gap(Reading),
}

impl Output {
    pub fn topic(&self) -> &'static str {
        match self {
            Output::Clean(_) => topics::CLEAN,
            Output::Alarm(_) => topics::ALARMS,
            Output::DeadLetter(_) => topics::DEAD_LETTER,
            Output::Gap(_) => topics::EVENTS,
        }
    }

    pub fn reading(&self) -> &Reading {
        match self {
            Output::Clean(r) | Output::Alarm(r) | Output::Gap(r) => r,
            Output::DeadLetter(entry) => &entry.reading,
        }
    }

    /// Partition key
    pub fn key(&self) -> &str {
        &self.reading().asset_id
    }
}

impl Validation {
    /// Records to append, in order
    pub fn outputs(self) -> Vec<Output> {
        let mut out = Vec::with_capacity(3);
        match self.verdict {
            Verdict::Forward(reading) => {
                if reading.classification == Classification::Alarm {
                    out.push(Output::Alarm(reading.clone()));
                }
                out.push(Output::Clean(reading));
            }
            Verdict::DeadLetter(entry) => out.push(Output::DeadLetter(entry)),
            Verdict::Duplicate(_) => {}
        }
        if let Some(gap) = self.gap {
            out.push(Output::Gap(gap));
        }
        out
    }
}

/// Running counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorStats {
    pub good: u64,
    pub suspect: u64,
    pub uncertain: u64,
    pub bad: u64,
    pub range_violations: u64,
    pub invalid_values: u64,
    pub duplicates: u64,
    pub gaps: u64,
}

#[derive(Debug, Default)]
struct SeriesState {
    last_accepted: Option<f64>,
    /// Latest event time seen
    last_event_ms: Option<i64>,
    /// Gateway receipt time of the latest reading
    last_received_ms: u64,
    /// A gap was already reported by the idle sweep
    gap_reported: bool,
    seen: HashSet<i64>,
    seen_order: VecDeque<i64>,
}

impl SeriesState {
    fn remember(&mut self, device_ms: i64, capacity: usize) {
        if self.seen.insert(device_ms) {
            self.seen_order.push_back(device_ms);
            while self.seen_order.len() > capacity {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
    }
}

/// Classifies raw readings of one pipeline
pub struct QualityValidator {
    config: ValidatorConfig,
    rules: ValidationRules,
    series: HashMap<SeriesKey, SeriesState>,
    stats: ValidatorStats,
}

impl QualityValidator {
    pub fn new(rules: ValidationRules, config: ValidatorConfig) -> Self {
        Self {
            config,
            rules,
            series: HashMap::new(),
            stats: ValidatorStats::default(),
        }
    }

    /// Swap in the rules of a new config version; series history is kept
    pub fn update_rules(&mut self, rules: ValidationRules, poll_interval_ms: u64) {
        self.rules = rules;
        self.config.poll_interval_ms = poll_interval_ms;
    }

    pub fn stats(&self) -> ValidatorStats {
        self.stats
    }

    /// Classify one raw reading received at `reading.gateway_time_ms`
    pub fn validate(&mut self, raw: &Reading) -> Validation {
        let series_key = raw.series();
        let device_ms = raw.device_timestamp_ms();
        let event_ms = raw.event_time_ms();
        let capacity = self.config.dedup_capacity;

        // Duplicates are replays: they must not touch gap or delta state.
        let is_duplicate = device_ms.is_some_and(|ts| {
            self.series
                .get(&series_key)
                .is_some_and(|s| s.seen.contains(&ts))
        });

        if is_duplicate {
            self.stats.duplicates += 1;
            return Validation {
                verdict: Verdict::Duplicate(raw.key()),
                gap: None,
            };
        }

        let gap = self.observe_arrival(&series_key, event_ms, raw);
        let state = self.series.entry(series_key).or_default();
        if let Some(ts) = device_ms {
            state.remember(ts, capacity);
        }
        let rule = self
            .rules
            .rule_for(&raw.asset_id, &raw.parameter)
            .copied()
            .unwrap_or_default();

        if !raw.value.is_finite() {
            self.stats.bad += 1;
            self.stats.invalid_values += 1;
            return Validation {
                verdict: Verdict::DeadLetter(DeadLetterEntry {
                    reading: raw.classified(QualityCode::Bad),
                    reason: FailureReason::InvalidValue,
                    detail: format!("value {} is not a finite number", raw.value),
                    suggested_correction: state.last_accepted,
                }),
                gap,
            };
        }

        let below = rule.min.is_some_and(|min| raw.value < min);
        let above = rule.max.is_some_and(|max| raw.value > max);
        if below || above {
            self.stats.bad += 1;
            self.stats.range_violations += 1;
            let bound = if below { rule.min } else { rule.max };
            debug!(
                asset = %raw.asset_id,
                parameter = %raw.parameter,
                value = raw.value,
                "range violation"
            );
            return Validation {
                verdict: Verdict::DeadLetter(DeadLetterEntry {
                    reading: raw.classified(QualityCode::Bad),
                    reason: FailureReason::RangeViolation,
                    detail: format!(
                        "value {} outside [{}, {}]",
                        raw.value,
                        fmt_bound(rule.min),
                        fmt_bound(rule.max)
                    ),
                    suggested_correction: state.last_accepted.or(bound),
                }),
                gap,
            };
        }

        let mut quality = QualityCode::Good;
        if let (Some(max_delta), Some(last)) = (rule.max_delta, state.last_accepted) {
            if (raw.value - last).abs() > max_delta {
                quality = quality.max(QualityCode::Suspect);
            }
        }

        let mut clean = raw.clone();
        match device_ms {
            Some(ts) => {
                clean.clock_skew_ms = Some(raw.gateway_time_ms as i64 - ts);
            }
            None => {
                quality = quality.max(QualityCode::Uncertain);
                clean.device_time = format_rfc3339(raw.gateway_time_ms as i64);
                clean.clock_skew_ms = None;
            }
        }
        clean.quality = Some(quality);
        state.last_accepted = Some(raw.value);

        match quality {
            QualityCode::Good => self.stats.good += 1,
            QualityCode::Suspect => self.stats.suspect += 1,
            QualityCode::Uncertain => self.stats.uncertain += 1,
            QualityCode::Bad => self.stats.bad += 1,
        }

        Validation {
            verdict: Verdict::Forward(clean),
            gap,
        }
    }

    fn observe_arrival(&mut self, key: &SeriesKey, event_ms: i64, raw: &Reading) -> Option<Reading> {
        let threshold = self.config.gap_threshold_ms() as i64;
        let state = self.series.entry(key.clone()).or_default();
        let previous = state.last_event_ms;
        let already_reported = std::mem::replace(&mut state.gap_reported, false);
        state.last_received_ms = state.last_received_ms.max(raw.gateway_time_ms);
        state.last_event_ms = Some(previous.map_or(event_ms, |p| p.max(event_ms)));

        let elapsed = event_ms - previous?;
        if threshold > 0 && elapsed > threshold && !already_reported {
            self.stats.gaps += 1;
            info!(series = %key, elapsed_ms = elapsed, "gap detected");
            return Some(gap_event(key, elapsed as f64, event_ms, raw.gateway_time_ms));
        }
        None
    }

    /// Report series that went silent, once per gap
    pub fn sweep_idle(&mut self, now_ms: u64) -> Vec<Reading> {
        let threshold = self.config.gap_threshold_ms();
        let mut events = Vec::new();
        for (key, state) in self.series.iter_mut() {
            if state.gap_reported || state.last_event_ms.is_none() {
                continue;
            }
            let silent = now_ms.saturating_sub(state.last_received_ms);
            if threshold > 0 && silent > threshold {
                state.gap_reported = true;
                info!(series = %key, silent_ms = silent, "series silent");
                events.push(gap_event(key, silent as f64, now_ms as i64, now_ms));
            }
        }
        self.stats.gaps += events.len() as u64;
        events.sort_by(|a, b| (&a.asset_id, &a.parameter).cmp(&(&b.asset_id, &b.parameter)));
        events
    }
}

/// Turn an operator decision into the reading to re-ingest, if any
pub fn apply_decision(decision: &DeadLetterDecision, now_ms: u64) -> Option<Reading> {
    match decision {
        DeadLetterDecision::Approve {
            entry,
            corrected_value,
        } => {
            let value = corrected_value
                .or(entry.suggested_correction)
                .unwrap_or(entry.reading.value);
            info!(
                asset = %entry.reading.asset_id,
                parameter = %entry.reading.parameter,
                value,
                "dead-letter entry approved"
            );
            Some(entry.reading.correction(value, QualityCode::Suspect, now_ms))
        }
        DeadLetterDecision::Discard { entry } => {
            info!(
                asset = %entry.reading.asset_id,
                parameter = %entry.reading.parameter,
                reason = %entry.reason,
                "dead-letter entry discarded"
            );
            None
        }
    }
}

fn fmt_bound(bound: Option<f64>) -> String {
    bound.map_or_else(|| "-".to_string(), |b| b.to_string())
}

fn gap_event(key: &SeriesKey, elapsed_ms: f64, at_ms: i64, gateway_ms: u64) -> Reading {
    let mut event = Reading::new(
        key.asset_id.clone(),
        key.parameter.clone(),
        elapsed_ms,
        gateway_ms,
    )
    .with_unit("ms")
    .with_classification(Classification::Event)
    .with_component(GAP_SOURCE);
    event.device_time = format_rfc3339(at_ms);
    event.quality = Some(QualityCode::Good);
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeloop::ParameterRule;

    fn validator() -> QualityValidator {
        let mut rules = ValidationRules::default();
        rules.parameters.insert(
            "pressure".into(),
            ParameterRule::range(0.0, 500.0).with_max_delta(50.0),
        );
        QualityValidator::new(rules, ValidatorConfig::default())
    }

    fn reading(value: f64, device_ms: i64) -> Reading {
        Reading::new("press-1", "pressure", value, device_ms as u64 + 10)
            .with_device_time_ms(device_ms)
    }

    fn quality(v: &Validation) -> Option<QualityCode> {
        match &v.verdict {
            Verdict::Forward(r) => r.quality,
            Verdict::DeadLetter(e) => e.reading.quality,
            Verdict::Duplicate(_) => None,
        }
    }

    #[test]
    fn test_good_reading() {
        let mut v = validator();
        let out = v.validate(&reading(100.0, 1_000));
        assert_eq!(quality(&out), Some(QualityCode::Good));
        if let Verdict::Forward(r) = &out.verdict {
            assert_eq!(r.clock_skew_ms, Some(10));
        }
    }

    #[test]
    fn test_range_violation_dead_letters() {
        let mut v = validator();
        v.validate(&reading(100.0, 1_000));
        let out = v.validate(&reading(612.0, 2_000));
        match out.verdict {
            Verdict::DeadLetter(entry) => {
                assert_eq!(entry.reason, FailureReason::RangeViolation);
                assert_eq!(entry.reading.quality, Some(QualityCode::Bad));
                assert_eq!(entry.suggested_correction, Some(100.0));
            }
            other => panic!("unexpected verdict {:?}", other),
        }
        assert_eq!(v.stats().bad, 1);
    }

    #[test]
    fn test_range_violation_without_history_suggests_bound() {
        let mut v = validator();
        match v.validate(&reading(-3.0, 1_000)).verdict {
            Verdict::DeadLetter(entry) => assert_eq!(entry.suggested_correction, Some(0.0)),
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_value() {
        let mut v = validator();
        match v.validate(&reading(f64::NAN, 1_000)).verdict {
            Verdict::DeadLetter(entry) => assert_eq!(entry.reason, FailureReason::InvalidValue),
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_rate_of_change_is_suspect() {
        let mut v = validator();
        v.validate(&reading(100.0, 1_000));
        let out = v.validate(&reading(200.0, 2_000));
        assert_eq!(quality(&out), Some(QualityCode::Suspect));
        // The suspect value becomes the new reference
        let out = v.validate(&reading(210.0, 3_000));
        assert_eq!(quality(&out), Some(QualityCode::Good));
    }

    #[test]
    fn test_rejected_values_do_not_move_reference() {
        let mut v = validator();
        v.validate(&reading(100.0, 1_000));
        v.validate(&reading(900.0, 2_000));
        let out = v.validate(&reading(120.0, 3_000));
        assert_eq!(quality(&out), Some(QualityCode::Good));
    }

    #[test]
    fn test_duplicate_dropped() {
        let mut v = validator();
        v.validate(&reading(100.0, 1_000));
        let out = v.validate(&reading(100.0, 1_000));
        assert!(matches!(out.verdict, Verdict::Duplicate(_)));
        assert!(out.outputs().is_empty());
        assert_eq!(v.stats().duplicates, 1);
    }

    #[test]
    fn test_resent_bad_reading_is_duplicate() {
        let mut v = validator();
        assert!(matches!(
            v.validate(&reading(900.0, 1_000)).verdict,
            Verdict::DeadLetter(_)
        ));
        let out = v.validate(&reading(900.0, 1_000));
        assert!(matches!(out.verdict, Verdict::Duplicate(_)));
        assert_eq!(v.stats().bad, 1);
        assert_eq!(v.stats().range_violations, 1);
        assert_eq!(v.stats().duplicates, 1);
    }

    #[test]
    fn test_missing_timestamp_is_uncertain() {
        let mut v = validator();
        let raw = Reading::new("press-1", "pressure", 100.0, 5_000);
        let out = v.validate(&raw);
        match out.verdict {
            Verdict::Forward(r) => {
                assert_eq!(r.quality, Some(QualityCode::Uncertain));
                assert_eq!(r.device_timestamp_ms(), Some(5_000));
            }
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_worst_quality_wins() {
        let mut v = validator();
        v.validate(&reading(100.0, 1_000));
        let raw = Reading::new("press-1", "pressure", 300.0, 5_000).with_device_time("garbage");
        assert_eq!(quality(&v.validate(&raw)), Some(QualityCode::Uncertain));
    }

    #[test]
    fn test_gap_on_arrival() {
        let mut v = validator();
        v.validate(&reading(100.0, 1_000));
        assert!(v.validate(&reading(100.0, 2_000)).gap.is_none());
        let out = v.validate(&reading(100.0, 9_000));
        let gap = out.gap.expect("gap event");
        assert_eq!(gap.value, 7_000.0);
        assert_eq!(gap.classification, Classification::Event);
        assert_eq!(gap.unit, "ms");
    }

    #[test]
    fn test_idle_sweep_reports_once() {
        let mut v = validator();
        v.validate(&reading(100.0, 1_000));
        assert!(v.sweep_idle(2_000).is_empty());
        assert_eq!(v.sweep_idle(4_000).len(), 1);
        assert!(v.sweep_idle(8_000).is_empty());
        // Arrival closing the gap does not report it again
        assert!(v.validate(&reading(100.0, 9_000)).gap.is_none());
        assert_eq!(v.stats().gaps, 1);
    }

    #[test]
    fn test_alarm_mirrored() {
        let mut v = validator();
        let alarm = reading(100.0, 1_000).with_classification(Classification::Alarm);
        let outputs = v.validate(&alarm).outputs();
        let topics: Vec<_> = outputs.iter().map(Output::topic).collect();
        assert_eq!(topics, vec![topics::ALARMS, topics::CLEAN]);
    }

    #[test]
    fn test_approve_decision_supersedes() {
        let mut v = validator();
        v.validate(&reading(100.0, 1_000));
        let Verdict::DeadLetter(entry) = v.validate(&reading(900.0, 2_000)).verdict else {
            panic!("expected dead letter");
        };
        let decision = DeadLetterDecision::Approve {
            entry: entry.clone(),
            corrected_value: Some(90.0),
        };
        let fixed = apply_decision(&decision, 50_000).unwrap();
        assert_eq!(fixed.value, 90.0);
        assert_eq!(fixed.quality, Some(QualityCode::Suspect));
        assert_eq!(fixed.supersedes, Some(entry.reading.key()));

        let discard = DeadLetterDecision::Discard { entry };
        assert!(apply_decision(&discard, 50_000).is_none());
    }
}
