//! Per-target calibration data.
//!
//! Nothing in here is derived at runtime. The values come from watching a
//! real part go through the boot sequence, and the handshake insists on
//! seeing them back byte for byte.

use std::{borrow::Cow, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    boot::{BootDeviceInfo, FrequencyRange, NegotiatedClocks},
    layout::{Layout, Region},
    Error, OurContext,
};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TargetProfile {
    pub name: String,
    /// Expected answer to the device type query.
    pub device: BootDeviceInfo,
    /// Oscillator frequency we tell the part it has, Hz.
    pub oscillator_hz: u32,
    /// System clock we ask for, Hz.
    pub system_clock_hz: u32,
    /// Peripheral clock the part is expected to settle on, Hz.
    pub peripheral_clock_hz: u32,
    /// UART bitrate requested after negotiation.
    pub bitrate: u32,
    pub layout: Layout,
}

impl Default for TargetProfile {
    fn default() -> Self {
        Self::rh850_p1m_e()
    }
}

impl TargetProfile {
    /// RH850/P1M-E with a 16 MHz crystal, running at 160 MHz.
    pub fn rh850_p1m_e() -> Self {
        TargetProfile {
            name: "RH850/P1M-E".into(),
            device: BootDeviceInfo {
                device_type: [0x10, 0x01, 0xff, 0x40, 0x00, 0x28, 0x2c, 0x00],
                oscillator: FrequencyRange { min: 16_000_000, max: 16_000_000 },
                system_clock: FrequencyRange { min: 160_000_000, max: 160_000_000 },
            },
            oscillator_hz: 16_000_000,
            system_clock_hz: 160_000_000,
            peripheral_clock_hz: 40_000_000,
            bitrate: 9600,
            layout: Layout {
                base: 0,
                regions: vec![
                    Region { size: 0x2000, count: 8 },
                    Region { size: 0x8000, count: 30 },
                ],
            },
        }
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading profile {}", path.display()))?;
        Self::from_ron(&text)
            .with_context(|| format!("in profile {}", path.display()))
    }

    pub fn from_ron(text: &str) -> Result<Self, Error> {
        let profile: TargetProfile = ron::from_str(text)
            .map_err(|e| Error::Profile(Cow::Owned(e.to_string())))?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let bad = |msg: String| -> Result<(), Error> { Err(Error::Profile(msg.into())) };

        self.layout.blocks()?;
        let osc = self.device.oscillator;
        if !(osc.min..=osc.max).contains(&self.oscillator_hz) {
            return bad(format!(
                "oscillator {} Hz outside the part's range {}..={}",
                self.oscillator_hz, osc.min, osc.max,
            ));
        }
        let sys = self.device.system_clock;
        if !(sys.min..=sys.max).contains(&self.system_clock_hz) {
            return bad(format!(
                "system clock {} Hz outside the part's range {}..={}",
                self.system_clock_hz, sys.min, sys.max,
            ));
        }
        if self.bitrate == 0 {
            return bad("bitrate can't be zero".into());
        }
        Ok(())
    }

    pub fn expected_clocks(&self) -> NegotiatedClocks {
        NegotiatedClocks {
            system_hz: self.system_clock_hz,
            peripheral_hz: self.peripheral_clock_hz,
        }
    }
}
