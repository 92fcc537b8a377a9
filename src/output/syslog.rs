//! Syslog sink
//!
//! Facility and priority are selected by name from the conventional sets.
//! Unknown names and an unreachable daemon are fatal at startup; individual
//! write failures are best-effort and ignored.

use crossbeam_channel::Receiver;
use syslog::{Facility, Formatter3164, LoggerBackend};

use crate::error::{PdnsError, Result};

use super::LogRecord;

pub type SyslogLogger = syslog::Logger<LoggerBackend, Formatter3164>;

/// Syslog severity selected by the `syslog_priority` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Emerg,
    Alert,
    Crit,
    Err,
    Warning,
    Notice,
    Info,
    Debug,
}

pub fn parse_facility(facility: &str) -> Result<Facility> {
    match facility.to_uppercase().as_str() {
        "KERN" => Ok(Facility::LOG_KERN),
        "USER" => Ok(Facility::LOG_USER),
        "MAIL" => Ok(Facility::LOG_MAIL),
        "DAEMON" => Ok(Facility::LOG_DAEMON),
        "AUTH" => Ok(Facility::LOG_AUTH),
        "SYSLOG" => Ok(Facility::LOG_SYSLOG),
        "LPR" => Ok(Facility::LOG_LPR),
        "NEWS" => Ok(Facility::LOG_NEWS),
        "UUCP" => Ok(Facility::LOG_UUCP),
        "CRON" => Ok(Facility::LOG_CRON),
        "AUTHPRIV" => Ok(Facility::LOG_AUTHPRIV),
        "FTP" => Ok(Facility::LOG_FTP),
        "LOCAL0" => Ok(Facility::LOG_LOCAL0),
        "LOCAL1" => Ok(Facility::LOG_LOCAL1),
        "LOCAL2" => Ok(Facility::LOG_LOCAL2),
        "LOCAL3" => Ok(Facility::LOG_LOCAL3),
        "LOCAL4" => Ok(Facility::LOG_LOCAL4),
        "LOCAL5" => Ok(Facility::LOG_LOCAL5),
        "LOCAL6" => Ok(Facility::LOG_LOCAL6),
        "LOCAL7" => Ok(Facility::LOG_LOCAL7),
        _ => Err(PdnsError::Config(format!(
            "invalid syslog facility: {}",
            facility
        ))),
    }
}

pub fn parse_priority(priority: &str) -> Result<Priority> {
    match priority.to_uppercase().as_str() {
        "EMERG" => Ok(Priority::Emerg),
        "ALERT" => Ok(Priority::Alert),
        "CRIT" => Ok(Priority::Crit),
        "ERR" => Ok(Priority::Err),
        "WARNING" => Ok(Priority::Warning),
        "NOTICE" => Ok(Priority::Notice),
        "INFO" => Ok(Priority::Info),
        "DEBUG" => Ok(Priority::Debug),
        _ => Err(PdnsError::Config(format!(
            "unknown priority: {}",
            priority
        ))),
    }
}

/// Connect to the local syslog daemon. Failure is fatal.
pub fn connect(facility: &str) -> Result<SyslogLogger> {
    let formatter = Formatter3164 {
        facility: parse_facility(facility)?,
        hostname: None,
        process: "passivedns".to_string(),
        pid: std::process::id(),
    };
    syslog::unix(formatter)
        .map_err(|e| PdnsError::Sink(format!("failed to connect to the local syslog daemon: {}", e)))
}

pub fn run(rx: Receiver<LogRecord>, mut logger: SyslogLogger, priority: Priority) {
    for record in rx.iter() {
        let line = match record.encode() {
            Ok(line) => line,
            Err(_) => continue,
        };
        // Best-effort: write errors are ignored.
        let _ = match priority {
            Priority::Emerg => logger.emerg(line),
            Priority::Alert => logger.alert(line),
            Priority::Crit => logger.crit(line),
            Priority::Err => logger.err(line),
            Priority::Warning => logger.warning(line),
            Priority::Notice => logger.notice(line),
            Priority::Info => logger.info(line),
            Priority::Debug => logger.debug(line),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_facility_names() {
        assert!(parse_facility("DAEMON").is_ok());
        assert!(parse_facility("daemon").is_ok());
        assert!(parse_facility("LOCAL7").is_ok());
        assert!(parse_facility("KERN").is_ok());
        assert!(parse_facility("NOPE").is_err());
        assert!(parse_facility("").is_err());
    }

    #[test]
    fn test_parse_priority_names() {
        assert_eq!(parse_priority("DEBUG").unwrap(), Priority::Debug);
        assert_eq!(parse_priority("info").unwrap(), Priority::Info);
        assert_eq!(parse_priority("EMERG").unwrap(), Priority::Emerg);
        assert!(parse_priority("TRACE").is_err());
    }
}
