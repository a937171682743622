//! Linux GPIO character-device probe backend.

use std::thread::sleep;
use std::time::Duration;

use gpio_cdev::{Chip, LineHandle, LineRequestFlags};

use super::{JtagIo, ProbeError};

/// Chip path and line offsets for the five JTAG signals.
#[derive(Debug, Clone)]
pub struct PinMap {
    /// GPIO character device, e.g. `/dev/gpiochip0`.
    pub chip: &'static str,
    /// TCK line offset.
    pub tck: u32,
    /// TDI line offset.
    pub tdi: u32,
    /// TMS line offset.
    pub tms: u32,
    /// TRST line offset.
    pub trst: u32,
    /// TDO line offset.
    pub tdo: u32,
}

/// BeagleBone (ti,am335x-bone*) pin map.
pub const BEAGLEBONE: PinMap = PinMap {
    chip: "/dev/gpiochip1",
    tck: 28,
    tdi: 16,
    tms: 15,
    trst: 14,
    tdo: 29,
};

/// Raspberry Pi pin map.
pub const RASPBERRY_PI: PinMap = PinMap {
    chip: "/dev/gpiochip0",
    tck: 4,
    tdi: 2,
    tms: 3,
    trst: 14,
    tdo: 15,
};

impl PinMap {
    /// Select a built-in pin map from `/proc/device-tree/compatible`.
    pub fn detect() -> Result<Self, ProbeError> {
        let compatible = std::fs::read("/proc/device-tree/compatible")?;
        Self::for_compatible(&compatible).ok_or(ProbeError::PlatformNotRecognized)
    }

    fn for_compatible(compatible: &[u8]) -> Option<Self> {
        if compatible.starts_with(b"ti,am335x-bone") {
            Some(BEAGLEBONE)
        } else if compatible.starts_with(b"raspberry") {
            Some(RASPBERRY_PI)
        } else {
            None
        }
    }
}

/// Bit-banged JTAG over memory-mapped GPIO lines.
pub struct GpioProbe {
    tck: LineHandle,
    tms: LineHandle,
    tdi: LineHandle,
    trst: LineHandle,
    tdo: LineHandle,
}

impl GpioProbe {
    /// Open the GPIO lines described by `pins`.
    pub fn open(pins: &PinMap) -> Result<Self, ProbeError> {
        let mut chip = Chip::new(pins.chip)?;
        let output = |chip: &mut Chip, offset, label| -> Result<LineHandle, ProbeError> {
            Ok(chip
                .get_line(offset)?
                .request(LineRequestFlags::OUTPUT, 0, label)?)
        };
        let probe = GpioProbe {
            tck: output(&mut chip, pins.tck, "jtag-tck")?,
            tms: output(&mut chip, pins.tms, "jtag-tms")?,
            tdi: output(&mut chip, pins.tdi, "jtag-tdi")?,
            trst: output(&mut chip, pins.trst, "jtag-trst")?,
            tdo: chip
                .get_line(pins.tdo)?
                .request(LineRequestFlags::INPUT, 0, "jtag-tdo")?,
        };
        tracing::debug!("opened GPIO probe on {}", pins.chip);
        Ok(probe)
    }

    /// Open the probe for the detected host platform.
    pub fn autodetect() -> Result<Self, ProbeError> {
        Self::open(&PinMap::detect()?)
    }
}

impl JtagIo for GpioProbe {
    fn set_tck(&mut self, level: bool) -> Result<(), ProbeError> {
        Ok(self.tck.set_value(level as u8)?)
    }

    fn set_tms(&mut self, level: bool) -> Result<(), ProbeError> {
        Ok(self.tms.set_value(level as u8)?)
    }

    fn set_tdi(&mut self, level: bool) -> Result<(), ProbeError> {
        Ok(self.tdi.set_value(level as u8)?)
    }

    fn set_trst(&mut self, level: bool) -> Result<(), ProbeError> {
        Ok(self.trst.set_value(level as u8)?)
    }

    fn read_tdo(&mut self) -> Result<bool, ProbeError> {
        Ok(self.tdo.get_value()? != 0)
    }

    fn delay_us(&mut self, micros: u32) {
        sleep(Duration::from_micros(micros as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_map_detection() {
        assert_eq!(
            PinMap::for_compatible(b"ti,am335x-bone-black").unwrap().tck,
            BEAGLEBONE.tck
        );
        assert_eq!(
            PinMap::for_compatible(b"raspberrypi,4-model-b")
                .unwrap()
                .chip,
            RASPBERRY_PI.chip
        );
        assert!(PinMap::for_compatible(b"fsl,imx8mq").is_none());
    }
}
