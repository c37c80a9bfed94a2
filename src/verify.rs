// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Diagnostic duty verification.
//!
//! A verification writes an explicit duty straight to the hardware, waits for
//! the fan to settle, samples RPM until the readings agree within tolerance,
//! and then compares the level the hardware reports against the commanded
//! duty. The control loop must be in diagnostic mode for the whole operation;
//! [`verify_with_suspension`] takes care of that.

use crate::cancel::CancelToken;
use crate::config::VerificationConfig;
use crate::error::{Error, Result};
use crate::fan_loop::FanControlLoop;
use crate::hardware::{FanHardware, FanState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Aggregate of consecutive RPM reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpmSample {
    pub average: u32,
    pub min: u32,
    pub max: u32,
    pub samples: Vec<u32>,
}

impl RpmSample {
    fn from_readings(samples: Vec<u32>) -> Self {
        let min = samples.iter().copied().min().unwrap_or(0);
        let max = samples.iter().copied().max().unwrap_or(0);
        let sum: u64 = samples.iter().map(|&r| r as u64).sum();
        let average = if samples.is_empty() {
            0
        } else {
            ((sum as f64) / samples.len() as f64).round() as u32
        };
        Self {
            average,
            min,
            max,
            samples,
        }
    }

    pub fn spread(&self) -> u32 {
        self.max - self.min
    }

    /// Readings are stable when their spread fits inside the relative
    /// tolerance, or inside the absolute floor at low speeds.
    pub fn is_stable(&self, config: &VerificationConfig) -> bool {
        let relative = (self.average as f64 * config.tolerance_percent / 100.0).round() as u32;
        self.spread() <= relative.max(config.min_tolerance_rpm)
    }
}

/// Outcome of one apply-and-verify cycle. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub fan_index: usize,
    pub requested_percent: u8,
    /// Average of the final sampling round
    pub measured_rpm: u32,
    pub measured_level: u8,
    pub sample_min: u32,
    pub sample_max: u32,
    /// Whether the final sampling round met the stability tolerance
    pub stable: bool,
    /// Sampling rounds used
    pub attempts: u32,
    pub passed: bool,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct VerificationService {
    hardware: Arc<dyn FanHardware>,
    config: VerificationConfig,
    history: Mutex<VecDeque<VerificationResult>>,
    in_flight: Mutex<HashSet<usize>>,
}

impl VerificationService {
    pub fn new(hardware: Arc<dyn FanHardware>, config: VerificationConfig) -> Self {
        Self {
            hardware,
            config,
            history: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// False when no channel can be verified.
    pub fn is_available(&self) -> bool {
        (0..self.hardware.channel_count()).any(|c| self.hardware.supports_verification(c))
    }

    pub fn get_current_fan_state(&self, fan_index: usize) -> Result<FanState> {
        self.check_channel(fan_index)?;
        self.hardware.read_fan_state(fan_index)
    }

    /// Results, most recent first.
    pub fn history(&self) -> Vec<VerificationResult> {
        lock(&self.history).iter().cloned().collect()
    }

    /// Cheap checks done before any hardware write.
    pub fn check_request(&self, fan_index: usize, target_percent: i32) -> Result<u8> {
        if !self.is_available() {
            return Err(Error::VerificationUnavailable);
        }
        let percent = u8::try_from(target_percent)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or(Error::DutyOutOfRange(target_percent))?;
        self.check_channel(fan_index)?;
        if !self.hardware.supports_verification(fan_index) {
            return Err(Error::VerificationUnavailable);
        }
        Ok(percent)
    }

    /// Read RPM `sample_count` times with the configured delay between reads.
    ///
    /// `sample_count` must be between 1 and `max_sample_count`.
    /// Cancellation aborts between or during delays and returns
    /// [`Error::Cancelled`]; no partial sample is produced.
    pub async fn get_stable_fan_rpm(
        &self,
        fan_index: usize,
        sample_count: usize,
        cancel: &mut CancelToken,
    ) -> Result<RpmSample> {
        self.check_channel(fan_index)?;
        let count = self.check_sample_count(sample_count)?;
        let mut readings = Vec::new();

        for i in 0..count {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            readings.push(self.hardware.read_fan_state(fan_index)?.rpm);
            if i + 1 < count {
                pause(self.config.sample_delay(), cancel).await?;
            }
        }

        Ok(RpmSample::from_readings(readings))
    }

    /// Write `target_percent` to the channel, bypassing the curve engine,
    /// and verify the hardware acknowledges it.
    ///
    /// The caller must hold the control loop in diagnostic mode. A mismatch
    /// is reported through [`VerificationResult::passed`]; only hardware
    /// failures, invalid requests and cancellation are errors.
    pub async fn apply_and_verify(
        &self,
        fan_index: usize,
        target_percent: i32,
        cancel: &mut CancelToken,
    ) -> Result<VerificationResult> {
        let percent = self.check_request(fan_index, target_percent)?;
        let _slot = InFlight::claim(&self.in_flight, fan_index)?;

        log::info!("Verifying fan {fan_index} at {percent}%");
        if let Err(e) = self.hardware.write_duty_cycle(fan_index, percent) {
            log::error!("Verification write to fan {fan_index} failed: {e}");
            return Err(e);
        }

        pause(self.config.settle_delay(), cancel).await?;

        let mut attempts = 0;
        let sample = loop {
            attempts += 1;
            let sample = self
                .get_stable_fan_rpm(fan_index, self.config.sample_count, cancel)
                .await?;
            if sample.is_stable(&self.config) || attempts > self.config.max_retries {
                break sample;
            }
            log::debug!(
                "Fan {fan_index} not settled (spread {} rpm around {}), resampling",
                sample.spread(),
                sample.average
            );
        };

        let stable = sample.is_stable(&self.config);
        if !stable {
            log::warn!(
                "Fan {fan_index} RPM still unstable after {attempts} rounds: {:?}",
                sample.samples
            );
        }

        let state = self.hardware.read_fan_state(fan_index)?;
        let result = VerificationResult {
            fan_index,
            requested_percent: percent,
            measured_rpm: sample.average,
            measured_level: state.level,
            sample_min: sample.min,
            sample_max: sample.max,
            stable,
            attempts,
            passed: state.level == percent,
            timestamp: Utc::now(),
        };

        if result.passed {
            log::info!(
                "Fan {fan_index} verified at {percent}% ({} rpm)",
                result.measured_rpm
            );
        } else {
            log::warn!(
                "Fan {fan_index} verification failed: requested {percent}%, hardware reports {}%",
                result.measured_level
            );
        }

        self.record(result.clone());
        Ok(result)
    }

    fn record(&self, result: VerificationResult) {
        let mut history = lock(&self.history);
        history.push_front(result);
        history.truncate(self.config.history_limit.max(1));
    }

    fn check_sample_count(&self, requested: usize) -> Result<usize> {
        let max = self.config.max_sample_count.max(1);
        if requested == 0 || requested > max {
            return Err(Error::SampleCountOutOfRange { requested, max });
        }
        Ok(requested)
    }

    fn check_channel(&self, fan_index: usize) -> Result<()> {
        if fan_index >= self.hardware.channel_count() {
            return Err(Error::UnknownChannel(fan_index));
        }
        Ok(())
    }
}

/// Suspend the control loop, verify, and resume on every exit path,
/// including cancellation of the returned future.
pub async fn verify_with_suspension(
    fan_loop: &Arc<FanControlLoop>,
    service: &VerificationService,
    fan_index: usize,
    target_percent: i32,
    cancel: &mut CancelToken,
) -> Result<VerificationResult> {
    service.check_request(fan_index, target_percent)?;
    let _lease = fan_loop.diagnostic_lease();
    service
        .apply_and_verify(fan_index, target_percent, cancel)
        .await
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn pause(delay: Duration, cancel: &mut CancelToken) -> Result<()> {
    if delay.is_zero() {
        return if cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Marks a channel busy until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<usize>>,
    fan_index: usize,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a Mutex<HashSet<usize>>, fan_index: usize) -> Result<Self> {
        if !lock(set).insert(fan_index) {
            return Err(Error::VerificationBusy(fan_index));
        }
        Ok(Self { set, fan_index })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.fan_index);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::hardware::stub::StubHardware;
    use std::collections::VecDeque;

    fn fast_config() -> VerificationConfig {
        VerificationConfig {
            sample_count: 3,
            max_sample_count: 20,
            sample_delay_ms: 1,
            settle_delay_ms: 1,
            tolerance_percent: 5.0,
            min_tolerance_rpm: 50,
            max_retries: 2,
            history_limit: 100,
        }
    }

    fn setup(config: VerificationConfig) -> (Arc<StubHardware>, Arc<VerificationService>) {
        let hw = Arc::new(StubHardware::new(2));
        let service = Arc::new(VerificationService::new(hw.clone(), config));
        (hw, service)
    }

    #[tokio::test]
    async fn test_pass_when_level_matches() {
        let (hw, service) = setup(fast_config());
        let result = service
            .apply_and_verify(0, 75, &mut CancelToken::never())
            .await
            .unwrap();

        assert!(result.passed);
        assert_eq!(result.requested_percent, 75);
        assert_eq!(result.measured_level, 75);
        assert_eq!(hw.writes(), vec![(0, 75)]);
        assert_eq!(service.history().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_is_a_result_not_an_error() {
        let (hw, service) = setup(fast_config());
        hw.with_channel(0, |c| c.forced_level = Some(60));

        let result = service
            .apply_and_verify(0, 75, &mut CancelToken::never())
            .await
            .unwrap();

        assert!(!result.passed);
        assert_eq!(result.measured_level, 60);
        assert_eq!(service.history().len(), 1);
    }

    #[tokio::test]
    async fn test_history_most_recent_first() {
        let (_, service) = setup(fast_config());
        for target in [20, 40, 60] {
            service
                .apply_and_verify(1, target, &mut CancelToken::never())
                .await
                .unwrap();
        }
        let requested: Vec<_> = service
            .history()
            .iter()
            .map(|r| r.requested_percent)
            .collect();
        assert_eq!(requested, [60, 40, 20]);
    }

    #[tokio::test]
    async fn test_history_limit() {
        let mut config = fast_config();
        config.history_limit = 2;
        let (_, service) = setup(config);
        for target in [10, 20, 30] {
            service
                .apply_and_verify(0, target, &mut CancelToken::never())
                .await
                .unwrap();
        }
        let history = service.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].requested_percent, 20);
    }

    #[tokio::test]
    async fn test_out_of_range_rejected_before_write() {
        let (hw, service) = setup(fast_config());
        for target in [-1, 101, 1000] {
            let err = service
                .apply_and_verify(0, target, &mut CancelToken::never())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::DutyOutOfRange(t) if t == target));
        }
        assert!(hw.writes().is_empty());
        assert!(service.history().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_rejected() {
        let (hw, service) = setup(fast_config());
        hw.with_channel(0, |c| c.verifiable = false);
        hw.with_channel(1, |c| c.verifiable = false);

        assert!(!service.is_available());
        let err = service
            .apply_and_verify(0, 50, &mut CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VerificationUnavailable));
        assert!(hw.writes().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let (_, service) = setup(fast_config());
        assert!(matches!(
            service.get_current_fan_state(7),
            Err(Error::UnknownChannel(7))
        ));
    }

    #[tokio::test]
    async fn test_sample_statistics() {
        let (hw, service) = setup(fast_config());
        hw.with_channel(0, |c| c.rpm_script = VecDeque::from([2000, 2100, 2200]));

        let sample = service
            .get_stable_fan_rpm(0, 3, &mut CancelToken::never())
            .await
            .unwrap();
        assert_eq!(sample.average, 2100);
        assert_eq!(sample.min, 2000);
        assert_eq!(sample.max, 2200);
        assert_eq!(sample.samples.len(), 3);
    }

    #[tokio::test]
    async fn test_sample_count_bounds_checked_before_reading() {
        let (hw, service) = setup(fast_config());
        hw.with_channel(0, |c| c.rpm_script = VecDeque::from([2000, 2100]));

        for requested in [0, 21, 1 << 40, usize::MAX] {
            let err = service
                .get_stable_fan_rpm(0, requested, &mut CancelToken::never())
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                Error::SampleCountOutOfRange { max: 20, .. }
            ));
            assert!(err.is_validation());
        }

        let mut left = 0;
        hw.with_channel(0, |c| left = c.rpm_script.len());
        assert_eq!(left, 2);

        let sample = service
            .get_stable_fan_rpm(0, 20, &mut CancelToken::never())
            .await
            .unwrap();
        assert_eq!(sample.samples.len(), 20);
    }

    #[test]
    fn test_stability_tolerance() {
        let config = fast_config();
        let steady = RpmSample::from_readings(vec![2400, 2410, 2405]);
        assert!(steady.is_stable(&config));

        let noisy = RpmSample::from_readings(vec![1000, 3000, 2000]);
        assert!(!noisy.is_stable(&config));

        // At low speed the absolute floor applies.
        let slow = RpmSample::from_readings(vec![100, 140, 120]);
        assert!(slow.is_stable(&config));
    }

    #[tokio::test]
    async fn test_resamples_until_stable() {
        let (hw, service) = setup(fast_config());
        hw.with_channel(0, |c| {
            c.rpm_script = VecDeque::from([1000, 3000, 2000, 2400, 2410, 2405]);
        });

        let result = service
            .apply_and_verify(0, 40, &mut CancelToken::never())
            .await
            .unwrap();
        assert_eq!(result.attempts, 2);
        assert!(result.stable);
        assert_eq!(result.measured_rpm, 2405);
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let (hw, service) = setup(fast_config());
        hw.with_channel(0, |c| {
            c.rpm_script = VecDeque::from([500, 3000, 500, 3000, 500, 3000, 500, 3000, 500]);
        });

        let result = service
            .apply_and_verify(0, 40, &mut CancelToken::never())
            .await
            .unwrap();
        assert_eq!(result.attempts, 3);
        assert!(!result.stable);
        assert!(result.passed);
        assert_eq!(service.history().len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_propagates() {
        let (hw, service) = setup(fast_config());
        hw.with_channel(0, |c| c.fail_writes = true);

        let err = service
            .apply_and_verify(0, 40, &mut CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Hardware { channel: 0, .. }));
        assert!(service.history().is_empty());

        // The channel is free again.
        hw.with_channel(0, |c| c.fail_writes = false);
        assert!(
            service
                .apply_and_verify(0, 40, &mut CancelToken::never())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_cancel_sampling_promptly() {
        let mut config = fast_config();
        config.sample_delay_ms = 10_000;
        let (hw, service) = setup(config);
        let fan_loop = Arc::new(FanControlLoop::new(hw.clone()));

        fan_loop.enter_diagnostic_mode();
        let (handle, mut token) = cancel_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            service.get_stable_fan_rpm(0, 3, &mut token),
        )
        .await
        .expect("sampling did not honour cancellation");
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(fan_loop.exit_diagnostic_mode());
    }

    #[tokio::test]
    async fn test_second_verification_on_same_channel_is_rejected() {
        let mut config = fast_config();
        config.settle_delay_ms = 10_000;
        let (_, service) = setup(config);

        let (handle, token) = cancel_pair();
        let first = {
            let service = service.clone();
            let mut token = token.clone();
            tokio::spawn(async move { service.apply_and_verify(0, 50, &mut token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = service
            .apply_and_verify(0, 60, &mut CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VerificationBusy(0)));

        handle.cancel();
        assert!(matches!(first.await.unwrap(), Err(Error::Cancelled)));
        assert!(service.history().is_empty());
    }

    #[tokio::test]
    async fn test_verify_with_suspension_brackets_loop() {
        let (hw, service) = setup(fast_config());
        let fan_loop = Arc::new(FanControlLoop::new(hw.clone()));

        let result = verify_with_suspension(&fan_loop, &service, 0, 75, &mut CancelToken::never())
            .await
            .unwrap();
        assert!(result.passed);
        assert!(!fan_loop.is_suspended());

        // Diagnostic write first, then the loop's resume write for both channels.
        assert_eq!(hw.writes(), vec![(0, 75), (0, 32), (1, 32)]);
    }

    #[tokio::test]
    async fn test_cancelled_verification_releases_diagnostic_mode() {
        let mut config = fast_config();
        config.settle_delay_ms = 10_000;
        let (hw, service) = setup(config);
        let fan_loop = Arc::new(FanControlLoop::new(hw.clone()));

        let (handle, token) = cancel_pair();
        let task = {
            let fan_loop = fan_loop.clone();
            let service = service.clone();
            let mut token = token.clone();
            tokio::spawn(async move {
                verify_with_suspension(&fan_loop, &service, 1, 90, &mut token).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fan_loop.is_suspended());
        assert_eq!(fan_loop.tick(), crate::fan_loop::TickOutcome::Suspended);

        handle.cancel();
        assert!(matches!(task.await.unwrap(), Err(Error::Cancelled)));
        assert!(!fan_loop.is_suspended());
        assert!(!fan_loop.exit_diagnostic_mode());
    }
}
