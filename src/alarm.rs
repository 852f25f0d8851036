//! Alarm log
//!
//! A bounded, de-duplicating log of fault messages. The same message is only
//! recorded once until it is removed; when the log is full the oldest entry
//! gives way. The log is persisted under [`ALARM_KEY`] and exported as JSON
//! for the configuration page.

use crate::clock::DeviceTime;
use crate::config::{ALARM_EXPORT_ROWS, ALARM_MESSAGE_LEN, MAX_ALARMS};
use core::fmt::{self, Write};
use heapless::{String, Vec};
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Flash key of the persisted log
pub const ALARM_KEY: &str = "alarm_logs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmEntry {
    pub message: String<ALARM_MESSAGE_LEN>,
    pub time: DeviceTime,
}

/// Severity reported in exports. Every logged alarm is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmLevel {
    Info,
    Warn,
    Error,
}

impl AlarmLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmLevel::Info => "INFO",
            AlarmLevel::Warn => "WARN",
            AlarmLevel::Error => "ERROR",
        }
    }
}

/// One exported row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmRow<'a> {
    pub date: String<20>,
    pub level: AlarmLevel,
    pub message: &'a str,
}

/// Entries are kept oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmLog {
    entries: Vec<AlarmEntry, MAX_ALARMS>,
}

impl AlarmLog {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Record `message` unless it is already present. Returns whether it was added.
    ///
    /// Messages longer than the entry bound are truncated; `None` stores a zeroed time.
    pub fn log(&mut self, message: &str, time: Option<&DeviceTime>) -> bool {
        let message = truncate(message);
        if self.entries.iter().any(|e| e.message == message) {
            return false;
        }
        if self.entries.is_full() {
            self.entries.remove(0);
        }
        warn!("[ALARM] {}", message);
        let entry = AlarmEntry {
            message,
            time: time.copied().unwrap_or(DeviceTime::ZERO),
        };
        // Capacity was made above.
        let _ = self.entries.push(entry);
        true
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: usize) -> Option<&AlarmEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlarmEntry> {
        self.entries.iter()
    }

    /// Drop the entry with exactly this message. Returns whether one was found.
    pub fn remove(&mut self, message: &str) -> bool {
        match self.entries.iter().position(|e| e.message.as_str() == message) {
            Some(index) => {
                self.entries.remove(index);
                info!("[ALARM] '{}' removed", message);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        info!("[ALARM] Log cleared");
    }

    /// At most `ALARM_EXPORT_ROWS` rows, oldest first.
    pub fn export_rows(&self) -> impl Iterator<Item = AlarmRow<'_>> {
        self.entries.iter().take(ALARM_EXPORT_ROWS).map(|entry| {
            let mut date = String::new();
            let _ = write!(date, "{}", entry.time);
            AlarmRow {
                date,
                level: AlarmLevel::Error,
                message: entry.message.as_str(),
            }
        })
    }

    /// Write the export as a JSON array of `{date, level, message}` objects.
    pub fn write_json<W: Write>(&self, out: &mut W) -> fmt::Result {
        out.write_char('[')?;
        for (i, row) in self.export_rows().enumerate() {
            if i > 0 {
                out.write_char(',')?;
            }
            write!(
                out,
                "{{\"date\":\"{}\",\"level\":\"{}\",\"message\":\"",
                row.date,
                row.level.as_str()
            )?;
            write_escaped(out, row.message)?;
            out.write_str("\"}")?;
        }
        out.write_char(']')
    }
}

fn truncate(message: &str) -> String<ALARM_MESSAGE_LEN> {
    let mut out = String::new();
    for ch in message.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

fn write_escaped<W: Write>(out: &mut W, text: &str) -> fmt::Result {
    for ch in text.chars() {
        match ch {
            '"' => out.write_str("\\\"")?,
            '\\' => out.write_str("\\\\")?,
            '\n' => out.write_str("\\n")?,
            c if (c as u32) < 0x20 => write!(out, "\\u{:04x}", c as u32)?,
            c => out.write_char(c)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(minutes: u8) -> DeviceTime {
        DeviceTime::new(25, 7, 23, 10, minutes, 0)
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut log = AlarmLog::new();
        assert!(log.log("SD card missing", Some(&at(1))));
        assert!(!log.log("SD card missing", Some(&at(2))));
        assert_eq!(log.count(), 1);
        assert_eq!(log.get(0).unwrap().time, at(1));
    }

    #[test]
    fn missing_time_is_zeroed() {
        let mut log = AlarmLog::new();
        log.log("RTC read failed", None);
        assert_eq!(log.get(0).unwrap().time, DeviceTime::ZERO);
    }

    #[test]
    fn full_log_drops_oldest() {
        let mut log = AlarmLog::new();
        for i in 0..MAX_ALARMS + 3 {
            let mut msg = std::string::String::new();
            write!(msg, "fault {}", i).unwrap();
            log.log(&msg, None);
        }
        assert_eq!(log.count(), MAX_ALARMS);
        assert_eq!(log.get(0).unwrap().message.as_str(), "fault 3");
        assert_eq!(log.get(MAX_ALARMS - 1).unwrap().message.as_str(), "fault 52");
        // A dropped message may be logged again.
        assert!(log.log("fault 0", None));
    }

    #[test]
    fn remove_then_relog() {
        let mut log = AlarmLog::new();
        log.log("a", None);
        log.log("b", None);
        assert!(log.remove("a"));
        assert!(!log.remove("a"));
        assert_eq!(log.count(), 1);
        assert_eq!(log.get(0).unwrap().message.as_str(), "b");
        assert!(log.log("a", None));
        log.clear();
        assert_eq!(log.count(), 0);
    }

    #[test]
    fn long_messages_are_truncated() {
        let mut log = AlarmLog::new();
        let long = "x".repeat(100);
        log.log(&long, None);
        assert_eq!(log.get(0).unwrap().message.len(), ALARM_MESSAGE_LEN);
        assert!(!log.log(&long, None));
    }

    #[test]
    fn json_export_formats_dates_and_escapes() {
        let mut log = AlarmLog::new();
        log.log("Clip \"idle.wav\" missing", Some(&DeviceTime::new(25, 6, 10, 12, 34, 56)));
        let mut out = std::string::String::new();
        log.write_json(&mut out).unwrap();
        assert_eq!(
            out,
            "[{\"date\":\"2025-06-10 12:34:56\",\"level\":\"ERROR\",\"message\":\"Clip \\\"idle.wav\\\" missing\"}]"
        );

        let empty = AlarmLog::new();
        let mut out = std::string::String::new();
        empty.write_json(&mut out).unwrap();
        assert_eq!(out, "[]");
    }
}
