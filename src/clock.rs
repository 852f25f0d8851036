//! Software wall clock advanced by the 1 s tick

use core::fmt;
use serde::{Deserialize, Serialize};

/// Calendar time kept by the controller. `year` is the two-digit year after 2000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTime {
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    /// 0 = Sunday .. 6 = Saturday
    pub day_of_week: u8,
}

impl Default for DeviceTime {
    fn default() -> Self {
        Self::ZERO
    }
}

impl DeviceTime {
    /// All-zero time stored for alarms logged without a clock.
    pub const ZERO: DeviceTime = DeviceTime {
        year: 0,
        month: 0,
        day: 0,
        hours: 0,
        minutes: 0,
        seconds: 0,
        day_of_week: 0,
    };

    pub const fn new(year: u8, month: u8, day: u8, hours: u8, minutes: u8, seconds: u8) -> Self {
        Self {
            year,
            month,
            day,
            hours,
            minutes,
            seconds,
            day_of_week: 0,
        }
    }

    pub const fn with_day_of_week(mut self, day_of_week: u8) -> Self {
        self.day_of_week = day_of_week;
        self
    }

    /// Advance by one second, rolling minutes, hours, days, months and years.
    pub fn tick(&mut self) {
        self.seconds = self.seconds.saturating_add(1);
        if self.seconds < 60 {
            return;
        }
        self.seconds = 0;
        self.minutes = self.minutes.saturating_add(1);
        if self.minutes < 60 {
            return;
        }
        self.minutes = 0;
        self.hours = self.hours.saturating_add(1);
        if self.hours < 24 {
            return;
        }
        self.hours = 0;
        self.day = self.day.saturating_add(1);
        self.day_of_week = (self.day_of_week % 7 + 1) % 7;

        if self.day > days_in_month(self.year, self.month) {
            self.day = 1;
            self.month = self.month.saturating_add(1);
            if self.month > 12 {
                self.month = 1;
                self.year = self.year.wrapping_add(1) % 100;
            }
        }
    }

    /// Every field within its calendar range.
    pub fn is_valid(&self) -> bool {
        (1..=12).contains(&self.month)
            && (1..=days_in_month(self.year, self.month)).contains(&self.day)
            && self.year < 100
            && self.hours < 24
            && self.minutes < 60
            && self.seconds < 60
            && self.day_of_week < 7
    }

    /// Minutes since midnight, used by plan lookups.
    pub fn minute_of_day(&self) -> u16 {
        u16::from(self.hours) * 60 + u16::from(self.minutes)
    }
}

/// Month length with the simple `year % 4` leap rule; unknown months count 30 days.
pub fn days_in_month(year: u8, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if year % 4 == 0 => 29,
        2 => 28,
        _ => 30,
    }
}

impl fmt::Display for DeviceTime {
    /// `20YY-MM-DD hh:mm:ss`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "20{:02}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hours, self.minutes, self.seconds
        )
    }
}
