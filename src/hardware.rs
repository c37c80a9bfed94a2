// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Hardware abstraction consumed by the control loop and the verifier.
//!
//! Channels are addressed by index. Reads are expected to be cheap and free of
//! side effects; writes are acknowledged by the firmware within a bounded time.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Instantaneous fan reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanState {
    /// Measured speed in RPM
    pub rpm: u32,
    /// Duty level the hardware reports as currently applied (percent)
    pub level: u8,
}

pub trait FanHardware: Send + Sync {
    /// Number of fan channels. Valid indices are `0..channel_count()`.
    fn channel_count(&self) -> usize;

    /// Temperature driving the given channel, in degrees Celsius.
    fn read_temperature(&self, channel: usize) -> Result<f64>;

    fn read_fan_state(&self, channel: usize) -> Result<FanState>;

    /// Command a duty percentage (0-100).
    fn write_duty_cycle(&self, channel: usize, percent: u8) -> Result<()>;

    /// Whether the channel reports RPM and level well enough to verify writes.
    fn supports_verification(&self, channel: usize) -> bool {
        channel < self.channel_count()
    }
}

#[cfg(test)]
pub(crate) mod stub {
    //! Scriptable in-memory hardware that records every write.

    use super::*;
    use crate::error::Error;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct StubChannel {
        pub temperature: f64,
        /// RPM readings handed out in order; the last one repeats.
        pub rpm_script: VecDeque<u32>,
        pub last_rpm: u32,
        /// Level reported after a write. `None` echoes the written duty.
        pub forced_level: Option<u8>,
        pub level: u8,
        pub fail_reads: bool,
        pub fail_writes: bool,
        pub verifiable: bool,
    }

    impl Default for StubChannel {
        fn default() -> Self {
            Self {
                temperature: 50.0,
                rpm_script: VecDeque::new(),
                last_rpm: 2400,
                forced_level: None,
                level: 0,
                fail_reads: false,
                fail_writes: false,
                verifiable: true,
            }
        }
    }

    pub struct StubHardware {
        pub channels: Mutex<Vec<StubChannel>>,
        pub writes: Mutex<Vec<(usize, u8)>>,
    }

    impl StubHardware {
        pub fn new(channels: usize) -> Self {
            Self {
                channels: Mutex::new(vec![StubChannel::default(); channels]),
                writes: Mutex::new(Vec::new()),
            }
        }

        pub fn with_channel(&self, channel: usize, f: impl FnOnce(&mut StubChannel)) {
            f(&mut self.channels.lock().unwrap()[channel]);
        }

        pub fn set_temperature(&self, channel: usize, temperature: f64) {
            self.with_channel(channel, |c| c.temperature = temperature);
        }

        pub fn writes(&self) -> Vec<(usize, u8)> {
            self.writes.lock().unwrap().clone()
        }

        pub fn clear_writes(&self) {
            self.writes.lock().unwrap().clear();
        }
    }

    impl FanHardware for StubHardware {
        fn channel_count(&self) -> usize {
            self.channels.lock().unwrap().len()
        }

        fn read_temperature(&self, channel: usize) -> Result<f64> {
            let channels = self.channels.lock().unwrap();
            let c = channels.get(channel).ok_or(Error::UnknownChannel(channel))?;
            if c.fail_reads {
                return Err(Error::hardware(channel, "sensor unreachable"));
            }
            Ok(c.temperature)
        }

        fn read_fan_state(&self, channel: usize) -> Result<FanState> {
            let mut channels = self.channels.lock().unwrap();
            let c = channels
                .get_mut(channel)
                .ok_or(Error::UnknownChannel(channel))?;
            if c.fail_reads {
                return Err(Error::hardware(channel, "tachometer unreachable"));
            }
            if let Some(rpm) = c.rpm_script.pop_front() {
                c.last_rpm = rpm;
            }
            Ok(FanState {
                rpm: c.last_rpm,
                level: c.level,
            })
        }

        fn write_duty_cycle(&self, channel: usize, percent: u8) -> Result<()> {
            let mut channels = self.channels.lock().unwrap();
            let c = channels
                .get_mut(channel)
                .ok_or(Error::UnknownChannel(channel))?;
            if c.fail_writes {
                return Err(Error::hardware(channel, "write rejected"));
            }
            c.level = c.forced_level.unwrap_or(percent);
            self.writes.lock().unwrap().push((channel, percent));
            Ok(())
        }

        fn supports_verification(&self, channel: usize) -> bool {
            self.channels
                .lock()
                .unwrap()
                .get(channel)
                .is_some_and(|c| c.verifiable)
        }
    }
}
