//! Threshold Monitor
//!
//! Classifies each round of sensor readings against the configured soft and
//! hard limits and turns the result into security events for the current
//! mode. Severity across sensors is the worst one seen.

use std::collections::BTreeMap;

use dronesec_shared::config::{ThresholdConfig, ThresholdDirection};
use dronesec_shared::state_machine::SecurityEvent;
use dronesec_shared::SecurityMode;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How far a reading is outside its limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Within,
    Soft,
    Hard,
}

/// Worst severity of one round of readings
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub severity: Severity,
    /// Sensor responsible for the severity, if any breached
    pub sensor: Option<String>,
    pub value: Option<f64>,
}

impl Assessment {
    fn within() -> Self {
        Self {
            severity: Severity::Within,
            sensor: None,
            value: None,
        }
    }
}

/// Compare a single reading against its threshold
pub fn classify(threshold: &ThresholdConfig, value: f64) -> Severity {
    if !value.is_finite() {
        return Severity::Within;
    }
    match threshold.direction {
        ThresholdDirection::Above => {
            if value >= threshold.hard {
                Severity::Hard
            } else if value >= threshold.soft {
                Severity::Soft
            } else {
                Severity::Within
            }
        }
        ThresholdDirection::Below => {
            // nothing in range
            if value <= 0.0 {
                Severity::Within
            } else if value <= threshold.hard {
                Severity::Hard
            } else if value <= threshold.soft {
                Severity::Soft
            } else {
                Severity::Within
            }
        }
        ThresholdDirection::Magnitude => {
            let magnitude = value.abs();
            if magnitude > threshold.hard {
                Severity::Hard
            } else if magnitude > threshold.soft {
                Severity::Soft
            } else {
                Severity::Within
            }
        }
    }
}

/// Watches readings and derives sensor-driven security events
pub struct ThresholdMonitor {
    thresholds: BTreeMap<String, ThresholdConfig>,
    recovery_window_ms: u64,
    /// Start of the current run of within-limit readings
    within_since: Option<u64>,
}

impl ThresholdMonitor {
    pub fn new(thresholds: BTreeMap<String, ThresholdConfig>, recovery_window_ms: u64) -> Self {
        Self {
            thresholds,
            recovery_window_ms,
            within_since: None,
        }
    }

    /// Worst severity over every reading that has a threshold
    pub fn assess(&self, readings: &BTreeMap<String, f64>) -> Assessment {
        let mut worst = Assessment::within();
        for (sensor, value) in readings {
            let Some(threshold) = self.thresholds.get(sensor) else {
                continue;
            };
            let severity = classify(threshold, *value);
            if severity > worst.severity {
                worst = Assessment {
                    severity,
                    sensor: Some(sensor.clone()),
                    value: Some(*value),
                };
            }
        }
        worst
    }

    /// Events to apply for `readings` given the current `mode`. A hard breach
    /// while NORMAL yields both table steps.
    pub fn evaluate(
        &mut self,
        readings: &BTreeMap<String, f64>,
        mode: SecurityMode,
        now_ms: u64,
    ) -> Vec<SecurityEvent> {
        let assessment = self.assess(readings);
        if assessment.severity != Severity::Within {
            self.within_since = None;
        }

        match (assessment.severity, mode) {
            (Severity::Hard, SecurityMode::Normal) => {
                let sensor = assessment.sensor.as_deref().unwrap_or("sensor");
                warn!(
                    "{} reading {:?} breached hard threshold",
                    sensor, assessment.value
                );
                vec![
                    SecurityEvent::SoftThresholdBreached {
                        alert_id: new_alert_id(sensor),
                    },
                    SecurityEvent::HardThresholdBreached,
                ]
            }
            (Severity::Hard, SecurityMode::Warning) => {
                warn!(
                    "{} reading {:?} breached hard threshold",
                    assessment.sensor.as_deref().unwrap_or("sensor"),
                    assessment.value
                );
                vec![SecurityEvent::HardThresholdBreached]
            }
            (Severity::Soft, SecurityMode::Normal) => {
                let sensor = assessment.sensor.as_deref().unwrap_or("sensor");
                info!(
                    "{} reading {:?} breached soft threshold",
                    sensor, assessment.value
                );
                vec![SecurityEvent::SoftThresholdBreached {
                    alert_id: new_alert_id(sensor),
                }]
            }
            (Severity::Within, SecurityMode::Warning) => {
                let since = *self.within_since.get_or_insert(now_ms);
                if now_ms.saturating_sub(since) >= self.recovery_window_ms {
                    self.within_since = None;
                    info!("Readings within limits for {}ms", self.recovery_window_ms);
                    vec![SecurityEvent::ReadingsRecovered]
                } else {
                    Vec::new()
                }
            }
            (severity, mode) => {
                if mode != SecurityMode::Warning {
                    self.within_since = None;
                }
                debug!("No sensor-driven transition for {:?} in {}", severity, mode);
                Vec::new()
            }
        }
    }
}

fn new_alert_id(sensor: &str) -> String {
    format!("{sensor}-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ThresholdMonitor {
        let mut thresholds = BTreeMap::new();
        thresholds.insert(
            "temperature".to_string(),
            ThresholdConfig {
                direction: ThresholdDirection::Above,
                soft: 70.0,
                hard: 90.0,
            },
        );
        thresholds.insert(
            "proximity".to_string(),
            ThresholdConfig {
                direction: ThresholdDirection::Below,
                soft: 50.0,
                hard: 25.0,
            },
        );
        thresholds.insert(
            "roll".to_string(),
            ThresholdConfig {
                direction: ThresholdDirection::Magnitude,
                soft: 30.0,
                hard: 45.0,
            },
        );
        ThresholdMonitor::new(thresholds, 1000)
    }

    fn readings(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_classify_directions() {
        let m = monitor();
        let t = &m.thresholds;
        assert_eq!(classify(&t["temperature"], 69.9), Severity::Within);
        assert_eq!(classify(&t["temperature"], 70.0), Severity::Soft);
        assert_eq!(classify(&t["temperature"], 95.0), Severity::Hard);

        assert_eq!(classify(&t["proximity"], 0.0), Severity::Within);
        assert_eq!(classify(&t["proximity"], 60.0), Severity::Within);
        assert_eq!(classify(&t["proximity"], 50.0), Severity::Soft);
        assert_eq!(classify(&t["proximity"], 10.0), Severity::Hard);

        assert_eq!(classify(&t["roll"], -31.0), Severity::Soft);
        assert_eq!(classify(&t["roll"], 46.0), Severity::Hard);
        assert_eq!(classify(&t["roll"], 30.0), Severity::Within);
        assert_eq!(classify(&t["roll"], f64::NAN), Severity::Within);
    }

    #[test]
    fn test_worst_sensor_wins() {
        let m = monitor();
        let a = m.assess(&readings(&[("temperature", 75.0), ("proximity", 20.0), ("unknown", 1e9)]));
        assert_eq!(a.severity, Severity::Hard);
        assert_eq!(a.sensor.as_deref(), Some("proximity"));
    }

    #[test]
    fn test_hard_breach_from_normal_yields_two_steps() {
        let mut m = monitor();
        let events = m.evaluate(&readings(&[("temperature", 95.0)]), SecurityMode::Normal, 0);
        assert_eq!(events.len(), 2);
        match &events[0] {
            SecurityEvent::SoftThresholdBreached { alert_id } => {
                assert!(alert_id.starts_with("temperature-"))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events[1], SecurityEvent::HardThresholdBreached);
    }

    #[test]
    fn test_no_events_in_alert_or_maintenance() {
        let mut m = monitor();
        let hot = readings(&[("temperature", 95.0)]);
        assert!(m.evaluate(&hot, SecurityMode::Alert, 0).is_empty());
        assert!(m.evaluate(&hot, SecurityMode::Maintenance, 0).is_empty());
        let soft = readings(&[("temperature", 75.0)]);
        assert!(m.evaluate(&soft, SecurityMode::Warning, 0).is_empty());
    }

    #[test]
    fn test_recovery_needs_sustained_window() {
        let mut m = monitor();
        let calm = readings(&[("temperature", 20.0)]);
        let warm = readings(&[("temperature", 75.0)]);

        assert!(m.evaluate(&calm, SecurityMode::Warning, 0).is_empty());
        assert!(m.evaluate(&calm, SecurityMode::Warning, 500).is_empty());
        // a soft reading restarts the window
        assert!(m.evaluate(&warm, SecurityMode::Warning, 900).is_empty());
        assert!(m.evaluate(&calm, SecurityMode::Warning, 1000).is_empty());
        assert!(m.evaluate(&calm, SecurityMode::Warning, 1999).is_empty());
        assert_eq!(
            m.evaluate(&calm, SecurityMode::Warning, 2000),
            vec![SecurityEvent::ReadingsRecovered]
        );
    }
}
