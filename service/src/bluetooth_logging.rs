//! Modify the framework logging configuration to enable debug logging.
//!
//! Logging either goes to stderr (development) or to syslog (deployment).
//! The |BluetoothLogging| struct owns the backend selection and the
//! runtime debug toggle exposed to applications.

use log::LevelFilter;
use syslog::{BasicLogger, Error, Facility, Formatter3164};

/// API to modify log levels exposed alongside the adapter API.
pub trait IBluetoothLogging {
    /// Check whether debug logging is enabled.
    fn is_debug_enabled(&self) -> bool;

    /// Change whether debug logging is enabled.
    fn set_debug_logging(&mut self, enabled: bool);
}

pub struct BluetoothLogging {
    is_debug: bool,

    /// Log to stderr?
    is_stderr: bool,

    /// Is logging already initialized?
    is_initialized: bool,
}

impl BluetoothLogging {
    pub fn new(is_debug: bool, log_output: &str) -> Self {
        let is_stderr = log_output == "stderr";
        Self { is_debug, is_stderr, is_initialized: false }
    }

    pub fn initialize(&mut self) -> Result<(), Error> {
        if self.is_stderr {
            env_logger::Builder::new().filter(None, self.get_log_level()).init();
        } else {
            let formatter = Formatter3164 {
                facility: Facility::LOG_USER,
                hostname: None,
                process: "btservice".into(),
                pid: 0,
            };

            let logger = syslog::unix(formatter)?;
            let _ = log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
                .map(|()| log::set_max_level(self.get_log_level()));
            log_panics::init();
        }

        self.is_initialized = true;
        Ok(())
    }

    fn get_log_level(&self) -> LevelFilter {
        match self.is_debug {
            true => LevelFilter::Debug,
            false => LevelFilter::Info,
        }
    }
}

impl IBluetoothLogging for BluetoothLogging {
    fn is_debug_enabled(&self) -> bool {
        self.is_initialized && self.is_debug
    }

    fn set_debug_logging(&mut self, enabled: bool) {
        if !self.is_initialized {
            return;
        }

        self.is_debug = enabled;
        log::set_max_level(self.get_log_level());
        log::info!("Setting log level to {:?}", self.get_log_level());
    }
}
