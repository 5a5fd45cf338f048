use crate::TraceSink;
use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log::Log` implementation over a [`TraceSink`].
pub struct SinkLogger<S> {
    sink: S,
    max_level: LevelFilter,
}

impl<S: TraceSink> SinkLogger<S> {
    #[must_use]
    pub const fn new(sink: S, max_level: LevelFilter) -> Self {
        Self { sink, max_level }
    }

    #[must_use]
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Registers this logger with the `log` facade. Call once during early init.
    ///
    /// # Errors
    /// Fails if another logger was installed before.
    pub fn install(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }
}

/// Formats straight into the sink; nothing is buffered.
struct SinkWriter<'a, S>(&'a S);

impl<S: TraceSink> Write for SinkWriter<'_, S> {
    #[inline]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_bytes(s.as_bytes());
        Ok(())
    }
}

impl<S: TraceSink> Log for SinkLogger<S> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Best effort; a sink cannot report failure.
        let _ = writeln!(
            SinkWriter(&self.sink),
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}
