//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, NaiveTime, TimeDelta, Weekday};
use gridguard_common::{TimeWindowConfig, Timestamp};

use crate::device::BinaryCondition;

/// Daily period during which a consumer may be started.
///
/// `start > end` wraps midnight; the part after midnight belongs to the
/// weekday the window opened on. `start == end` covers the whole day.
#[derive(Debug, Clone)]
pub struct TimeWindow {
    days: Vec<Weekday>,
    start: NaiveTime,
    end: NaiveTime,
    condition: Option<Arc<dyn BinaryCondition>>,
}

impl TimeWindow {
    pub fn new(days: Vec<Weekday>, start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            days,
            start,
            end,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: Arc<dyn BinaryCondition>) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Resolve a configured window, looking up its condition by name.
    pub fn from_config(
        config: &TimeWindowConfig,
        conditions: &HashMap<String, Arc<dyn BinaryCondition>>,
    ) -> Result<Self, String> {
        let window = Self::new(config.days.clone(), config.start, config.end);
        match &config.condition {
            None => Ok(window),
            Some(name) => conditions
                .get(name)
                .cloned()
                .map(|condition| window.with_condition(condition))
                .ok_or_else(|| format!("time window condition `{name}` is not bound")),
        }
    }

    fn runs_on(&self, day: Weekday) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }

    pub fn is_active(&self, now: Timestamp) -> bool {
        if let Some(condition) = &self.condition {
            if !condition.is_active() {
                return false;
            }
        }
        let time = now.time();
        let today = now.weekday();
        if self.start == self.end {
            self.runs_on(today)
        } else if self.start < self.end {
            self.runs_on(today) && time >= self.start && time < self.end
        } else if time >= self.start {
            self.runs_on(today)
        } else if time < self.end {
            self.runs_on(today.pred())
        } else {
            false
        }
    }

    /// Time left until the window closes, `None` when inactive or all-day.
    pub fn remaining(&self, now: Timestamp) -> Option<TimeDelta> {
        if self.start == self.end || !self.is_active(now) {
            return None;
        }
        let time = now.time();
        let until_end = self.end.signed_duration_since(time);
        if until_end > TimeDelta::zero() {
            Some(until_end)
        } else {
            Some(until_end + TimeDelta::days(1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};

    // 2024-06-03 is a Monday.
    fn at(day: u32, h: u32, m: u32) -> Timestamp {
        Local
            .with_ymd_and_hms(2024, 6, day, h, m, 0)
            .single()
            .expect("unambiguous local time")
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
    }

    #[derive(Debug)]
    struct Flag(bool);

    impl BinaryCondition for Flag {
        fn is_active(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn plain_window() {
        let window = TimeWindow::new(vec![Weekday::Mon], hm(9, 0), hm(17, 0));
        assert!(window.is_active(at(3, 9, 0)));
        assert!(!window.is_active(at(3, 17, 0)));
        assert!(!window.is_active(at(4, 12, 0)));
        assert_eq!(window.remaining(at(3, 16, 30)), Some(TimeDelta::minutes(30)));
    }

    #[test]
    fn overnight_window_belongs_to_opening_day() {
        let window = TimeWindow::new(vec![Weekday::Mon], hm(22, 0), hm(6, 0));
        assert!(window.is_active(at(3, 23, 0)));
        assert!(window.is_active(at(4, 5, 59)));
        assert!(!window.is_active(at(3, 5, 0)));
        assert!(!window.is_active(at(4, 22, 30)));
        assert_eq!(window.remaining(at(3, 23, 0)), Some(TimeDelta::hours(7)));
        assert_eq!(window.remaining(at(4, 5, 0)), Some(TimeDelta::hours(1)));
    }

    #[test]
    fn equal_bounds_cover_the_day() {
        let window = TimeWindow::new(Vec::new(), hm(0, 0), hm(0, 0));
        assert!(window.is_active(at(5, 3, 0)));
        assert_eq!(window.remaining(at(5, 3, 0)), None);
    }

    #[test]
    fn condition_gates_window() {
        let mut conditions: HashMap<String, Arc<dyn BinaryCondition>> = HashMap::new();
        conditions.insert("cheap_tariff".into(), Arc::new(Flag(false)));
        let config = TimeWindowConfig {
            days: Vec::new(),
            start: hm(0, 0),
            end: hm(0, 0),
            condition: Some("cheap_tariff".into()),
        };
        let window = TimeWindow::from_config(&config, &conditions).unwrap();
        assert!(!window.is_active(at(3, 12, 0)));

        let unbound = TimeWindowConfig {
            condition: Some("missing".into()),
            ..config
        };
        assert!(TimeWindow::from_config(&unbound, &conditions).is_err());
    }
}
