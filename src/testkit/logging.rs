use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
  Fatal,
  Off,
}

impl LogLevel {
  pub const MIN: LogLevel = LogLevel::Trace;

  fn from_u8(x: u8) -> LogLevel {
    match x {
      0 => LogLevel::Trace,
      1 => LogLevel::Debug,
      2 => LogLevel::Info,
      3 => LogLevel::Warn,
      4 => LogLevel::Error,
      5 => LogLevel::Fatal,
      _ => LogLevel::Off,
    }
  }
}

type Sink = dyn Fn(LogLevel, &str) + Send + Sync;

/// A leveled logger handle, injected wherever logging is needed. There is
/// no process-wide logger; each agent carries its own and tests can swap
/// the sink to capture output.
#[derive(Clone)]
pub struct Logger {
  level: Arc<AtomicU8>,
  sink: Arc<Sink>,
}

impl Logger {
  pub fn new(level: LogLevel, sink: Arc<Sink>) -> Logger {
    Logger {
      level: Arc::new(AtomicU8::new(level as u8)),
      sink: sink,
    }
  }

  /// A logger printing to stdout, one line per message.
  pub fn stdout(level: LogLevel) -> Logger {
    Logger::new(level, Arc::new(|lvl, msg| println!("{:?}: {}", lvl, msg)))
  }

  /// Changes the threshold on this handle and every clone of it.
  pub fn set_level(&self, level: LogLevel) {
    self.level.store(level as u8, Ordering::Relaxed);
  }

  pub fn level(&self) -> LogLevel {
    LogLevel::from_u8(self.level.load(Ordering::Relaxed))
  }

  pub fn log(&self, level: LogLevel, msg: impl ToString) {
    if level != LogLevel::Off && level >= self.level() {
      (self.sink)(level, &msg.to_string());
    }
  }

  pub fn trace(&self, msg: impl ToString) {
    self.log(LogLevel::Trace, msg);
  }

  pub fn debug(&self, msg: impl ToString) {
    self.log(LogLevel::Debug, msg);
  }

  pub fn info(&self, msg: impl ToString) {
    self.log(LogLevel::Info, msg);
  }

  pub fn warn(&self, msg: impl ToString) {
    self.log(LogLevel::Warn, msg);
  }

  pub fn error(&self, msg: impl ToString) {
    self.log(LogLevel::Error, msg);
  }
}

impl Default for Logger {
  fn default() -> Self {
    Logger::stdout(LogLevel::Warn)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  fn capture() -> (Logger, Arc<Mutex<Vec<String>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink_lines = lines.clone();
    let log = Logger::new(
      LogLevel::Debug,
      Arc::new(move |_, msg: &str| sink_lines.lock().unwrap().push(msg.to_string())),
    );
    (log, lines)
  }

  #[test]
  fn threshold_filters_and_set_level_applies_to_clones() {
    let (log, lines) = capture();
    log.trace("dropped");
    log.debug("kept");
    assert_eq!(lines.lock().unwrap().as_slice(), &["kept".to_string()]);

    let clone = log.clone();
    log.set_level(LogLevel::Off);
    clone.error("silenced");
    assert_eq!(lines.lock().unwrap().len(), 1);
  }
}
