//! Simulated sensor source
//!
//! Produces one round of readings per interval for every configured sensor:
//! a noisy baseline well inside the limits with occasional excursions past
//! the soft and hard thresholds.

use std::collections::BTreeMap;
use std::time::Duration;

use dronesec_shared::config::{ThresholdConfig, ThresholdDirection};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Readings by sensor name
pub type Readings = BTreeMap<String, f64>;

/// Chance per round that a sensor produces an excursion
const EXCURSION_PROBABILITY: f64 = 0.02;

pub struct SimulatedSensors {
    thresholds: BTreeMap<String, ThresholdConfig>,
}

impl SimulatedSensors {
    pub fn new(thresholds: BTreeMap<String, ThresholdConfig>) -> Self {
        Self { thresholds }
    }

    /// Take one round of readings
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Readings {
        self.thresholds
            .iter()
            .map(|(sensor, threshold)| (sensor.clone(), simulate(threshold, rng)))
            .collect()
    }

    /// Emit readings every `period` until shutdown or the receiver goes away
    pub async fn run(self, period: Duration, tx: mpsc::Sender<Readings>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let readings = self.sample(&mut rand::thread_rng());
                    debug!("Sensor readings: {:?}", readings);
                    if tx.send(readings).await.is_err() {
                        return;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

fn simulate<R: Rng>(threshold: &ThresholdConfig, rng: &mut R) -> f64 {
    let excursion = rng.gen_bool(EXCURSION_PROBABILITY);
    let soft = threshold.soft;
    let hard = threshold.hard;
    match threshold.direction {
        ThresholdDirection::Above => {
            if excursion {
                let top = hard + (hard - soft).abs().max(1.0) * 0.1;
                rng.gen_range(soft..=top)
            } else {
                soft * rng.gen_range(0.4..0.8)
            }
        }
        ThresholdDirection::Below => {
            if excursion {
                rng.gen_range(hard * 0.5..=soft)
            } else {
                soft * rng.gen_range(1.5..3.0)
            }
        }
        ThresholdDirection::Magnitude => {
            if excursion {
                let magnitude = rng.gen_range(soft..=hard * 1.2);
                if rng.gen_bool(0.5) {
                    magnitude
                } else {
                    -magnitude
                }
            } else {
                rng.gen_range(-soft * 0.5..soft * 0.5)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::{classify, Severity};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn thresholds() -> BTreeMap<String, ThresholdConfig> {
        let mut t = BTreeMap::new();
        t.insert(
            "temperature".into(),
            ThresholdConfig {
                direction: ThresholdDirection::Above,
                soft: 70.0,
                hard: 90.0,
            },
        );
        t.insert(
            "proximity".into(),
            ThresholdConfig {
                direction: ThresholdDirection::Below,
                soft: 50.0,
                hard: 25.0,
            },
        );
        t
    }

    #[test]
    fn test_every_sensor_sampled_and_mostly_within() {
        let sensors = SimulatedSensors::new(thresholds());
        let mut rng = StdRng::seed_from_u64(7);
        let mut within = 0;
        for _ in 0..500 {
            let readings = sensors.sample(&mut rng);
            assert_eq!(readings.len(), 2);
            if readings
                .iter()
                .all(|(s, v)| classify(&sensors.thresholds[s], *v) == Severity::Within)
            {
                within += 1;
            }
        }
        assert!(within > 400);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let sensors = SimulatedSensors::new(thresholds());
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(sensors.run(Duration::from_millis(100), tx, shutdown_rx));

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
