//! Raw level ↔ dB conversion
//!
//! Raw MIDI values are what the device stores and what this crate keeps in
//! state. dB is only for display. The device spans 58 dB from -48 dB up to
//! +10 dB, with raw 0 meaning fully off.

use crate::types::{Level, MAX_LEVEL};

/// Lowest finite dB the device reports
pub const MIN_DB: f64 = -48.0;

/// Highest dB the device reports
pub const MAX_DB: f64 = 10.0;

/// (raw, dB) anchors, strictly increasing in both columns
const LEVEL_DB_TABLE: [(Level, f64); 5] = [
    (1, -47.543),
    (32, -33.386),
    (64, -18.772),
    (96, -4.157),
    (127, 10.0),
];

/// Convert a raw level to dB. Raw 0 is `-inf`.
pub fn level_to_db(level: Level) -> f64 {
    if level == 0 {
        return f64::NEG_INFINITY;
    }
    let level = level.min(MAX_LEVEL);
    for pair in LEVEL_DB_TABLE.windows(2) {
        let (lo, lo_db) = pair[0];
        let (hi, hi_db) = pair[1];
        if level <= hi {
            let t = (level - lo) as f64 / (hi - lo) as f64;
            return lo_db + t * (hi_db - lo_db);
        }
    }
    MAX_DB
}

/// Convert dB to the nearest raw level, clamping to the device range
pub fn db_to_level(db: f64) -> Level {
    if db.is_nan() || db <= MIN_DB {
        return 0;
    }
    let (first, first_db) = LEVEL_DB_TABLE[0];
    if db <= first_db {
        return first;
    }
    for pair in LEVEL_DB_TABLE.windows(2) {
        let (lo, lo_db) = pair[0];
        let (hi, hi_db) = pair[1];
        if db <= hi_db {
            let t = (db - lo_db) / (hi_db - lo_db);
            return (lo as f64 + t * (hi - lo) as f64).round() as Level;
        }
    }
    MAX_LEVEL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints() {
        assert_eq!(level_to_db(0), f64::NEG_INFINITY);
        assert!((level_to_db(127) - MAX_DB).abs() < 1e-9);
        assert!((level_to_db(1) + 47.543).abs() < 1e-9);
        assert_eq!(db_to_level(f64::NEG_INFINITY), 0);
        assert_eq!(db_to_level(-60.0), 0);
        assert_eq!(db_to_level(MAX_DB), 127);
        assert_eq!(db_to_level(20.0), 127);
    }

    #[test]
    fn conversion_is_monotonic() {
        let mut last = f64::NEG_INFINITY;
        for level in 1..=MAX_LEVEL {
            let db = level_to_db(level);
            assert!(db > last, "level {} not above previous", level);
            last = db;
        }
    }

    #[test]
    fn nearest_level_recovers_raw_value() {
        for level in 0..=MAX_LEVEL {
            assert_eq!(db_to_level(level_to_db(level)), level);
        }
    }

    #[test]
    fn unity_gain_level() {
        // 0 dB sits between raw 105 and 106 on the device's linear scale
        let level = db_to_level(0.0);
        assert!((105..=106).contains(&level));
    }
}
