//! Operator progress reporting.
//!
//! The engine emits [`ProgressEvent`]s through a caller-supplied handler;
//! the CLI turns them into progress bars. Percentages are whole percents and
//! only emitted on change.

/// The long-running operations that report progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Image CRC verification.
    CrcCheck,
    /// G5 erase flow.
    Erase,
    /// G5 programming flow.
    Program,
    /// G5 verify flow.
    Verify,
    /// G5 bitstream authentication flow.
    Authenticate,
    /// SPI-flash read.
    SpiRead,
    /// SPI-flash erase.
    SpiErase,
    /// SPI-flash program.
    SpiProgram,
    /// SPI-flash verify.
    SpiVerify,
    /// SPI-flash blank check.
    SpiBlankCheck,
}

/// Events emitted while an action runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// An operation started.
    Started(Operation),
    /// An operation reached a whole percent.
    Percent(Operation, u8),
    /// The frame loop moved to the next image component.
    Component {
        /// 1-based component index.
        index: u16,
        /// Total component count for this run.
        total: u16,
    },
    /// An operation finished.
    Finished(Operation),
}

/// A progress handler; stores a closure called on every event.
pub struct Progress {
    handler: Box<dyn Fn(ProgressEvent)>,
}

impl Progress {
    /// Create a handler from a closure.
    pub fn new(handler: impl Fn(ProgressEvent) + 'static) -> Self {
        Progress {
            handler: Box::new(handler),
        }
    }

    /// A handler that discards all events.
    pub fn none() -> Self {
        Progress {
            handler: Box::new(|_| ()),
        }
    }

    fn emit(&self, event: ProgressEvent) {
        (self.handler)(event);
    }

    pub(crate) fn started(&self, operation: Operation) {
        self.emit(ProgressEvent::Started(operation));
    }

    pub(crate) fn percent(&self, operation: Operation, percent: u8) {
        self.emit(ProgressEvent::Percent(operation, percent));
    }

    pub(crate) fn component(&self, index: u16, total: u16) {
        self.emit(ProgressEvent::Component { index, total });
    }

    pub(crate) fn finished(&self, operation: Operation) {
        self.emit(ProgressEvent::Finished(operation));
    }
}
