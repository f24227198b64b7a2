//! Seeded synthetic history shared by the integration tests
#![allow(dead_code)]

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use vitalrs::config::AnalyticsConfig;
use vitalrs::models::{CycleRecord, RecoveryRecord, SleepRecord, WorkoutRecord};
use vitalrs::source::{InMemoryRecordSource, RecordExport};

pub const USER: &str = "athlete-1";
const MILLIS_PER_HOUR: f64 = 3_600_000.0;

pub fn as_of() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
}

pub fn computed_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 6, 0, 0).unwrap()
}

/// Default config with the window pinned to [`as_of`]
pub fn config(lookback_days: u32) -> AnalyticsConfig {
    let mut config = AnalyticsConfig::default();
    config.window.as_of = Some(as_of());
    config.window.lookback_days = lookback_days;
    config.forest.n_trees = 40;
    config
}

fn at(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(hour, minute, 0).unwrap())
}

/// Approximately standard normal: centred sum of twelve uniforms
fn normal(rng: &mut ChaCha8Rng) -> f64 {
    (0..12).map(|_| rng.gen::<f64>()).sum::<f64>() - 6.0
}

/// Generator for a user's daily records ending on [`as_of`].
///
/// Sleep duration drives recovery (true r around 0.85) and HRV; the previous
/// day's strain pulls recovery down.
#[derive(Debug, Clone)]
pub struct SyntheticHistory {
    pub days: usize,
    pub seed: u64,
    pub end: NaiveDate,
    /// Noise sd on recovery
    pub recovery_noise: f64,
}

impl SyntheticHistory {
    pub fn new(days: usize) -> Self {
        Self {
            days,
            seed: 7,
            end: as_of(),
            recovery_noise: 5.0,
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn export(&self) -> RecordExport {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let first = self.end - Duration::days(self.days as i64 - 1);
        let mut export = RecordExport::default();
        let mut prev_strain = 12.0;

        for i in 0..self.days {
            let date = first + Duration::days(i as i64);
            let sleep_hours = (7.2 + 0.9 * normal(&mut rng)).clamp(4.0, 10.0);
            let awake = 0.4 + 0.1 * rng.gen::<f64>();
            let deep = 1.2 + 0.25 * (sleep_hours - 7.2) + 0.1 * normal(&mut rng);
            let rem = 1.6 + 0.3 * (sleep_hours - 7.2) + 0.15 * normal(&mut rng);
            let light = (sleep_hours - deep - rem).max(0.5);
            let strain = (12.0 + 3.5 * normal(&mut rng)).clamp(2.0, 21.0);

            let recovery = (60.0 + 12.0 * (sleep_hours - 7.2) - 1.5 * (prev_strain - 12.0)
                + self.recovery_noise * normal(&mut rng))
            .clamp(1.0, 99.0);
            let hrv = 55.0 + 6.0 * (sleep_hours - 7.2) + 4.0 * normal(&mut rng);
            let rhr = 54.0 - 1.5 * (sleep_hours - 7.2) + 1.5 * normal(&mut rng);
            let bedtime = at(date - Duration::days(1), 22, 30 + (rng.gen::<u32>() % 29));

            export.sleep.push(SleepRecord {
                id: format!("sleep-{}", i),
                user_id: USER.to_string(),
                start: bedtime,
                end: bedtime + Duration::minutes(((sleep_hours + awake) * 60.0) as i64),
                nap: false,
                efficiency: Some((100.0 * sleep_hours / (sleep_hours + awake)).min(100.0)),
                consistency: Some(70.0 + 10.0 * rng.gen::<f64>()),
                performance: Some((sleep_hours / 8.0 * 100.0).min(100.0)),
                respiratory_rate: Some(15.0 + 0.5 * normal(&mut rng)),
                in_bed_milli: Some((sleep_hours + awake) * MILLIS_PER_HOUR),
                awake_milli: Some(awake * MILLIS_PER_HOUR),
                rem_milli: Some(rem * MILLIS_PER_HOUR),
                slow_wave_milli: Some(deep * MILLIS_PER_HOUR),
                light_milli: Some(light * MILLIS_PER_HOUR),
                disturbance_count: Some(f64::from(5 + rng.gen::<u32>() % 10)),
            });

            export.recovery.push(RecoveryRecord {
                id: format!("recovery-{}", i),
                user_id: USER.to_string(),
                timestamp: at(date, 8, 0),
                recovery_score: Some(recovery),
                hrv_rmssd_milli: Some(hrv),
                resting_heart_rate: Some(rhr),
                spo2_percentage: Some(96.0 + normal(&mut rng) * 0.8),
                skin_temp_celsius: Some(33.5 + normal(&mut rng) * 0.3),
            });

            export.cycles.push(CycleRecord {
                id: format!("cycle-{}", i),
                user_id: USER.to_string(),
                start: at(date, 8, 30),
                strain: Some(strain),
                kilojoule: Some(8000.0 + 400.0 * strain + 300.0 * normal(&mut rng)),
                avg_hr: Some(65.0 + strain + 2.0 * normal(&mut rng)),
                max_hr: Some(140.0 + 2.0 * strain + 6.0 * normal(&mut rng)),
            });

            if rng.gen_bool(0.6) {
                let start = if rng.gen_bool(0.5) { at(date, 7, 0) } else { at(date, 18, 0) };
                export.workouts.push(WorkoutRecord {
                    id: format!("workout-{}", i),
                    user_id: USER.to_string(),
                    start,
                    end: start + Duration::minutes(60),
                    strain: Some(strain * 0.7),
                    kilojoule: Some(300.0 * strain),
                    avg_hr: Some(120.0 + 2.0 * strain),
                    max_hr: Some(160.0 + 1.5 * strain),
                });
            }

            prev_strain = strain;
        }

        export
    }

    pub fn source(&self) -> InMemoryRecordSource {
        InMemoryRecordSource::new(self.export().into_records())
    }
}
