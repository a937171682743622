//! The physical JTAG line driver.
//!
//! Everything above this module talks to the target through the [`JtagIo`]
//! trait: four output lines (TCK, TMS, TDI, TRST), one input line (TDO) and a
//! best-effort microsecond delay. The only timing contract is that TMS/TDI
//! presented before a TCK rising edge are the values the device samples, and
//! that TDO read while TCK is low is the bit shifted out on the previous
//! rising edge.

pub mod gpio;
#[cfg(any(test, feature = "test"))]
pub mod mock;

pub use gpio::GpioProbe;

/// Errors produced by a probe backend.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The GPIO character device could not be opened or driven.
    #[error("GPIO access failed: {0}")]
    Gpio(#[from] gpio_cdev::errors::Error),

    /// The host platform is not one of the known pin maps.
    #[error("no built-in JTAG pin map for this platform")]
    PlatformNotRecognized,

    /// Reading the platform descriptor failed.
    #[error("failed to read platform descriptor")]
    Io(#[from] std::io::Error),
}

/// Raw access to the five JTAG lines and a delay primitive.
///
/// Implementations do not know anything about TAP states; sequencing is the
/// caller's responsibility.
pub trait JtagIo {
    /// Drive the TCK line.
    fn set_tck(&mut self, level: bool) -> Result<(), ProbeError>;
    /// Drive the TMS line.
    fn set_tms(&mut self, level: bool) -> Result<(), ProbeError>;
    /// Drive the TDI line.
    fn set_tdi(&mut self, level: bool) -> Result<(), ProbeError>;
    /// Drive the TRST line.
    fn set_trst(&mut self, level: bool) -> Result<(), ProbeError>;
    /// Sample the TDO line.
    fn read_tdo(&mut self) -> Result<bool, ProbeError>;
    /// Best-effort wall-clock sleep.
    fn delay_us(&mut self, micros: u32);
}
