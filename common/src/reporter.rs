use core::fmt::Display;

use crate::{
    config::{BaselinePolicy, ReporterConfig},
    types::{ReporterStatePayload, SkipReason, TickOutcome},
};

/// Raw reading from the gas sensor.
pub trait SensorSource {
    fn read(&mut self) -> i32;
}

/// Connection to the MQTT broker.
pub trait Broker {
    type Error: Display;

    fn is_connected(&self) -> bool;
    fn reconnect(&mut self) -> Result<(), Self::Error>;
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), Self::Error>;
}

/// Invoked once when reconnect failures reach the configured maximum.
pub trait RestartAuthority {
    fn restart(&mut self);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReporterState {
    pub last_reconnect_attempt_ms: u64,
    pub last_update_sent_ms: u64,
    pub current_sensor_value: i32,
    pub reconnect_failures: u32,
    pub restart_requested: bool,
}

#[derive(Debug, Clone)]
pub struct SmokeReporter {
    config: ReporterConfig,
    boot_ms: u64,
    state: ReporterState,
}

impl SmokeReporter {
    pub fn new(mut config: ReporterConfig, boot_ms: u64) -> Self {
        config.sanitize();
        Self {
            config,
            boot_ms,
            state: ReporterState::default(),
        }
    }

    pub fn config(&self) -> &ReporterConfig {
        &self.config
    }

    pub fn state(&self) -> &ReporterState {
        &self.state
    }

    pub fn in_warmup(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.boot_ms) < self.config.warmup_ms
    }

    pub fn reconnect_due(&self, now_ms: u64) -> bool {
        !self.state.restart_requested
            && self.state.reconnect_failures < self.config.max_reconnect_tries
            && now_ms.saturating_sub(self.state.last_reconnect_attempt_ms)
                >= self.config.reconnect_backoff_ms
    }

    pub fn on_tick<B, R>(
        &mut self,
        now_ms: u64,
        raw: i32,
        broker: &mut B,
        restart: &mut R,
    ) -> TickOutcome
    where
        B: Broker,
        R: RestartAuthority,
    {
        if self.in_warmup(now_ms) {
            return TickOutcome::WarmingUp;
        }

        if broker.is_connected() {
            self.state.reconnect_failures = 0;
        } else {
            if self.state.restart_requested {
                self.refresh_baseline(raw);
                return TickOutcome::GaveUp;
            }

            if !self.reconnect_due(now_ms) {
                self.refresh_baseline(raw);
                return TickOutcome::AwaitingReconnect;
            }

            self.state.last_reconnect_attempt_ms = now_ms;
            if let Err(err) = broker.reconnect() {
                self.state.reconnect_failures = self.state.reconnect_failures.saturating_add(1);
                self.refresh_baseline(raw);

                let failures = self.state.reconnect_failures;
                if failures >= self.config.max_reconnect_tries {
                    self.state.restart_requested = true;
                    restart.restart();
                    return TickOutcome::RestartRequested {
                        failures,
                        error: err.to_string(),
                    };
                }

                return TickOutcome::ReconnectFailed {
                    failures,
                    error: err.to_string(),
                };
            }

            self.state.reconnect_failures = 0;
        }

        self.evaluate_publish(now_ms, raw, broker)
    }

    pub fn status_payload(&self, now_ms: u64) -> ReporterStatePayload {
        ReporterStatePayload {
            value: self.state.current_sensor_value,
            uptime_ms: now_ms.saturating_sub(self.boot_ms),
            warming_up: self.in_warmup(now_ms),
            last_update_sent_ms: self.state.last_update_sent_ms,
            last_reconnect_attempt_ms: self.state.last_reconnect_attempt_ms,
            reconnect_failures: self.state.reconnect_failures,
            restart_requested: self.state.restart_requested,
        }
    }

    fn evaluate_publish<B: Broker>(
        &mut self,
        now_ms: u64,
        raw: i32,
        broker: &mut B,
    ) -> TickOutcome {
        if now_ms.saturating_sub(self.state.last_update_sent_ms) < self.config.update_interval_ms {
            self.refresh_baseline(raw);
            return TickOutcome::Skipped(SkipReason::IntervalPending);
        }

        if self.delta(raw) < u64::from(self.config.delta_threshold) {
            self.refresh_baseline(raw);
            return TickOutcome::Skipped(SkipReason::BelowThreshold);
        }

        let payload = raw.to_string();
        match broker.publish(&self.config.root_topic, &payload) {
            Ok(()) => {
                self.state.current_sensor_value = raw;
                self.state.last_update_sent_ms = self.state.last_update_sent_ms.max(now_ms);
                TickOutcome::Published { value: raw }
            }
            // Baseline stays put so the next qualifying tick retries.
            Err(err) => TickOutcome::PublishFailed {
                error: err.to_string(),
            },
        }
    }

    fn delta(&self, raw: i32) -> u64 {
        (i64::from(raw) - i64::from(self.state.current_sensor_value)).unsigned_abs()
    }

    fn refresh_baseline(&mut self, raw: i32) {
        if self.config.baseline == BaselinePolicy::Drift {
            self.state.current_sensor_value = raw;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct FakeBroker {
        connected: bool,
        // Scripted reconnect results; an empty queue means failure.
        reconnect_results: VecDeque<bool>,
        fail_publish: bool,
        reconnect_calls: u32,
        published: Vec<(String, String)>,
    }

    impl FakeBroker {
        fn connected() -> Self {
            Self {
                connected: true,
                ..Self::default()
            }
        }
    }

    impl Broker for FakeBroker {
        type Error = String;

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn reconnect(&mut self) -> Result<(), String> {
            self.reconnect_calls += 1;
            if self.reconnect_results.pop_front().unwrap_or(false) {
                self.connected = true;
                Ok(())
            } else {
                Err("connection refused".to_string())
            }
        }

        fn publish(&mut self, topic: &str, payload: &str) -> Result<(), String> {
            if self.fail_publish {
                return Err("transport closed".to_string());
            }
            self.published.push((topic.to_string(), payload.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingRestart {
        calls: u32,
    }

    impl RestartAuthority for CountingRestart {
        fn restart(&mut self) {
            self.calls += 1;
        }
    }

    fn reporter_with_baseline(value: i32, last_sent_ms: u64) -> SmokeReporter {
        let mut reporter = SmokeReporter::new(ReporterConfig::default(), 0);
        reporter.state.current_sensor_value = value;
        reporter.state.last_update_sent_ms = last_sent_ms;
        reporter
    }

    #[test]
    fn warmup_discards_samples_without_touching_broker() {
        let mut reporter = SmokeReporter::new(ReporterConfig::default(), 0);
        let mut broker = FakeBroker::default();
        let mut restart = CountingRestart::default();

        for now_ms in (0..10_000).step_by(500) {
            let outcome = reporter.on_tick(now_ms, 900, &mut broker, &mut restart);
            assert_eq!(outcome, TickOutcome::WarmingUp);
        }

        assert_eq!(reporter.state(), &ReporterState::default());
        assert_eq!(broker.reconnect_calls, 0);
        assert!(broker.published.is_empty());
    }

    #[test]
    fn warmup_is_measured_from_boot_time() {
        let reporter = SmokeReporter::new(ReporterConfig::default(), 5_000);

        assert!(reporter.in_warmup(14_999));
        assert!(!reporter.in_warmup(15_000));
    }

    #[test]
    fn publishes_when_interval_and_delta_are_met() {
        let mut reporter = reporter_with_baseline(100, 20_000);
        let mut broker = FakeBroker::connected();
        let mut restart = CountingRestart::default();

        let outcome = reporter.on_tick(22_000, 106, &mut broker, &mut restart);

        assert_eq!(outcome, TickOutcome::Published { value: 106 });
        assert_eq!(
            broker.published,
            vec![("sensors/smoke".to_string(), "106".to_string())]
        );
        assert_eq!(reporter.state().current_sensor_value, 106);
        assert_eq!(reporter.state().last_update_sent_ms, 22_000);
    }

    #[test]
    fn small_delta_does_not_publish() {
        let mut reporter = reporter_with_baseline(100, 20_000);
        let mut broker = FakeBroker::connected();
        let mut restart = CountingRestart::default();

        let outcome = reporter.on_tick(22_000, 103, &mut broker, &mut restart);

        assert_eq!(outcome, TickOutcome::Skipped(SkipReason::BelowThreshold));
        assert!(broker.published.is_empty());
        assert_eq!(reporter.state().last_update_sent_ms, 20_000);
    }

    #[test]
    fn negative_delta_counts_by_magnitude() {
        let mut reporter = reporter_with_baseline(100, 20_000);
        let mut broker = FakeBroker::connected();
        let mut restart = CountingRestart::default();

        let outcome = reporter.on_tick(22_000, 95, &mut broker, &mut restart);

        assert_eq!(outcome, TickOutcome::Published { value: 95 });
    }

    #[test]
    fn pending_interval_blocks_any_delta() {
        let mut reporter = reporter_with_baseline(100, 20_000);
        let mut broker = FakeBroker::connected();
        let mut restart = CountingRestart::default();

        let outcome = reporter.on_tick(21_999, 1_000, &mut broker, &mut restart);

        assert_eq!(outcome, TickOutcome::Skipped(SkipReason::IntervalPending));
        assert!(broker.published.is_empty());
    }

    #[test]
    fn restart_requested_once_after_max_consecutive_failures() {
        let mut reporter = SmokeReporter::new(ReporterConfig::default(), 0);
        let mut broker = FakeBroker::default();
        let mut restart = CountingRestart::default();

        for attempt in 1..=9_u32 {
            let now_ms = 10_000 + u64::from(attempt - 1) * 5_000;
            let outcome = reporter.on_tick(now_ms, 50, &mut broker, &mut restart);
            assert_eq!(
                outcome,
                TickOutcome::ReconnectFailed {
                    failures: attempt,
                    error: "connection refused".to_string(),
                }
            );
            assert_eq!(restart.calls, 0);
        }

        let outcome = reporter.on_tick(55_000, 50, &mut broker, &mut restart);
        assert_eq!(
            outcome,
            TickOutcome::RestartRequested {
                failures: 10,
                error: "connection refused".to_string(),
            }
        );
        assert_eq!(restart.calls, 1);

        for now_ms in [60_000, 65_000, 120_000] {
            let outcome = reporter.on_tick(now_ms, 50, &mut broker, &mut restart);
            assert_eq!(outcome, TickOutcome::GaveUp);
        }
        assert_eq!(restart.calls, 1);
        assert_eq!(broker.reconnect_calls, 10);
    }

    #[test]
    fn backoff_spaces_reconnect_attempts() {
        let mut reporter = SmokeReporter::new(ReporterConfig::default(), 0);
        let mut broker = FakeBroker::default();
        let mut restart = CountingRestart::default();

        let _ = reporter.on_tick(10_000, 50, &mut broker, &mut restart);
        assert_eq!(broker.reconnect_calls, 1);
        assert_eq!(reporter.state().last_reconnect_attempt_ms, 10_000);

        let outcome = reporter.on_tick(14_999, 50, &mut broker, &mut restart);
        assert_eq!(outcome, TickOutcome::AwaitingReconnect);
        assert_eq!(broker.reconnect_calls, 1);

        let _ = reporter.on_tick(15_000, 50, &mut broker, &mut restart);
        assert_eq!(broker.reconnect_calls, 2);
        assert_eq!(reporter.state().last_reconnect_attempt_ms, 15_000);
    }

    #[test]
    fn successful_reconnect_resets_failures_and_publishes() {
        let mut reporter = SmokeReporter::new(ReporterConfig::default(), 0);
        let mut broker = FakeBroker {
            reconnect_results: VecDeque::from([false, false, true]),
            ..FakeBroker::default()
        };
        let mut restart = CountingRestart::default();

        let _ = reporter.on_tick(10_000, 40, &mut broker, &mut restart);
        let _ = reporter.on_tick(15_000, 40, &mut broker, &mut restart);
        assert_eq!(reporter.state().reconnect_failures, 2);

        // Drift kept the baseline at 40, so the jump to 80 qualifies.
        let outcome = reporter.on_tick(20_000, 80, &mut broker, &mut restart);

        assert_eq!(outcome, TickOutcome::Published { value: 80 });
        assert_eq!(reporter.state().reconnect_failures, 0);
        assert_eq!(restart.calls, 0);
    }

    #[test]
    fn connected_tick_breaks_failure_streak() {
        let mut reporter = SmokeReporter::new(ReporterConfig::default(), 0);
        let mut broker = FakeBroker::default();
        let mut restart = CountingRestart::default();
        let mut now_ms = 10_000;

        for _ in 0..9 {
            let _ = reporter.on_tick(now_ms, 50, &mut broker, &mut restart);
            now_ms += 5_000;
        }
        assert_eq!(reporter.state().reconnect_failures, 9);

        // Link came back on its own; no reconnect call is made.
        broker.connected = true;
        let _ = reporter.on_tick(now_ms, 50, &mut broker, &mut restart);
        assert_eq!(reporter.state().reconnect_failures, 0);
        assert_eq!(broker.reconnect_calls, 9);

        broker.connected = false;
        for _ in 0..9 {
            now_ms += 5_000;
            let _ = reporter.on_tick(now_ms, 50, &mut broker, &mut restart);
        }

        assert_eq!(reporter.state().reconnect_failures, 9);
        assert_eq!(broker.reconnect_calls, 18);
        assert_eq!(restart.calls, 0);
        assert!(!reporter.state().restart_requested);
    }

    #[test]
    fn publish_failure_leaves_state_for_retry() {
        let mut reporter = reporter_with_baseline(100, 20_000);
        let mut broker = FakeBroker {
            fail_publish: true,
            ..FakeBroker::connected()
        };
        let mut restart = CountingRestart::default();
        let before = reporter.state().clone();

        let outcome = reporter.on_tick(22_000, 150, &mut broker, &mut restart);

        assert_eq!(
            outcome,
            TickOutcome::PublishFailed {
                error: "transport closed".to_string()
            }
        );
        assert_eq!(reporter.state(), &before);

        broker.fail_publish = false;
        let outcome = reporter.on_tick(22_250, 150, &mut broker, &mut restart);
        assert_eq!(outcome, TickOutcome::Published { value: 150 });
        assert_eq!(reporter.state().last_update_sent_ms, 22_250);
    }

    #[test]
    fn repeated_tick_after_skip_has_no_extra_effects() {
        let mut reporter = reporter_with_baseline(100, 20_000);
        let mut broker = FakeBroker::connected();
        let mut restart = CountingRestart::default();

        let first = reporter.on_tick(23_000, 102, &mut broker, &mut restart);
        let after_first = reporter.state().clone();
        let second = reporter.on_tick(23_000, 102, &mut broker, &mut restart);

        assert_eq!(first, TickOutcome::Skipped(SkipReason::BelowThreshold));
        assert_eq!(second, first);
        assert_eq!(reporter.state(), &after_first);
        assert!(broker.published.is_empty());
    }

    #[test]
    fn drift_baseline_follows_every_sample() {
        let mut reporter = SmokeReporter::new(ReporterConfig::default(), 0);
        let mut broker = FakeBroker::connected();
        let mut restart = CountingRestart::default();

        let first = reporter.on_tick(10_000, 100, &mut broker, &mut restart);
        assert_eq!(first, TickOutcome::Published { value: 100 });

        for (step, raw) in [102, 104, 106, 108].into_iter().enumerate() {
            let now_ms = 12_000 + step as u64 * 2_000;
            let outcome = reporter.on_tick(now_ms, raw, &mut broker, &mut restart);
            assert_eq!(outcome, TickOutcome::Skipped(SkipReason::BelowThreshold));
            assert_eq!(reporter.state().current_sensor_value, raw);
        }

        assert_eq!(broker.published.len(), 1);
    }

    #[test]
    fn pinned_baseline_catches_slow_rise() {
        let config = ReporterConfig {
            baseline: BaselinePolicy::Pinned,
            ..ReporterConfig::default()
        };
        let mut reporter = SmokeReporter::new(config, 0);
        let mut broker = FakeBroker::connected();
        let mut restart = CountingRestart::default();

        let _ = reporter.on_tick(10_000, 100, &mut broker, &mut restart);
        let outcomes: Vec<TickOutcome> = [102, 104, 106]
            .into_iter()
            .enumerate()
            .map(|(step, raw)| {
                let now_ms = 12_000 + step as u64 * 2_000;
                reporter.on_tick(now_ms, raw, &mut broker, &mut restart)
            })
            .collect();

        assert_eq!(
            outcomes,
            vec![
                TickOutcome::Skipped(SkipReason::BelowThreshold),
                TickOutcome::Skipped(SkipReason::BelowThreshold),
                TickOutcome::Published { value: 106 },
            ]
        );
    }

    #[test]
    fn last_update_sent_only_moves_forward_on_publish() {
        let mut reporter = SmokeReporter::new(ReporterConfig::default(), 0);
        let mut broker = FakeBroker::connected();
        let mut restart = CountingRestart::default();
        let samples = [0, 40, 41, 90, 20, 20, 300, 301, 5, 500];

        let mut previous = reporter.state().last_update_sent_ms;
        for (step, raw) in samples.into_iter().enumerate() {
            let now_ms = 9_000 + step as u64 * 1_500;
            broker.connected = step % 4 != 3;
            let outcome = reporter.on_tick(now_ms, raw, &mut broker, &mut restart);

            let current = reporter.state().last_update_sent_ms;
            assert!(current >= previous);
            if outcome.is_published() {
                assert_eq!(current, now_ms);
            } else {
                assert_eq!(current, previous);
            }
            previous = current;
        }
    }

    #[test]
    fn status_payload_uses_camel_case_keys() {
        let reporter = reporter_with_baseline(42, 12_000);
        let payload = serde_json::to_value(reporter.status_payload(13_000)).unwrap();

        assert_eq!(payload["value"], 42);
        assert_eq!(payload["uptimeMs"], 13_000);
        assert_eq!(payload["warmingUp"], false);
        assert_eq!(payload["lastUpdateSentMs"], 12_000);
        assert_eq!(payload["restartRequested"], false);
    }
}
