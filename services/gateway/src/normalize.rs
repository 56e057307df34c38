//! Telemetry validation and normalization.
//!
//! Tracker fleets produce a steady trickle of garbage positions: all-zero
//! fixes, sentinel values from uninitialized firmware buffers, mirrored
//! lat/lon pairs, digit-repetition artifacts from corrupted BCD. The
//! filters here reject those outright; plausible fixes get their scalar
//! fields clamped into physical ranges rather than dropped.
//!
//! The rules are heuristics tuned against real fleet traffic. They reject
//! a handful of legitimate-looking positions (an exact power-of-two
//! latitude, a single-repeated-digit coordinate) — acceptable losses
//! against the volume of garbage they stop.

use tg_protocol::TelemetryFix;

/// Minimum |lat| + |lon| for a fix to count as non-zero.
const ZERO_EPSILON: f64 = 1e-6;

const SPEED_MAX: f64 = 1000.0;
const ALTITUDE_MIN: f64 = -1000.0;
const ALTITUDE_MAX: f64 = 20_000.0;

// ---------------------------------------------------------------------------
// Coordinate validation
// ---------------------------------------------------------------------------

/// Full validity check for a coordinate pair.
pub fn coordinates_valid(lat: f64, lon: f64) -> bool {
    if garbage_scalar(lat) || garbage_scalar(lon) {
        return false;
    }
    if lat.abs() > 90.0 || lon.abs() > 180.0 {
        return false;
    }
    if lat.abs() + lon.abs() <= ZERO_EPSILON {
        return false;
    }
    // Grid artifacts: whole-degree latitude on a multiple of 90 combined
    // with whole-degree longitude on a multiple of 180.
    if (lat.trunc() as i64) % 90 == 0 && (lon.trunc() as i64) % 180 == 0 {
        return false;
    }
    if has_triplet_repetition(lat, lon) {
        return false;
    }
    // Mirrored coordinates.
    if format!("{lat:.4}") == format!("{lon:.4}") {
        return false;
    }
    true
}

/// Garbage sentinel detection for a single coordinate value.
fn garbage_scalar(v: f64) -> bool {
    if !v.is_finite() {
        return true;
    }
    if v == f64::MAX || v == f64::MIN {
        return true;
    }
    if is_power_of_two(v.abs()) {
        return true;
    }
    single_repeated_digit(v)
}

/// Exact powers of two (0.5, 1, 2, 4, ...) show up when raw register
/// contents leak into coordinate fields.
fn is_power_of_two(v: f64) -> bool {
    if v <= 0.0 || !v.is_finite() {
        return false;
    }
    const MANTISSA_MASK: u64 = 0x000F_FFFF_FFFF_FFFF;
    v.to_bits() & MANTISSA_MASK == 0
}

/// True when the decimal digits of `v` are one repeated digit ("55.555").
fn single_repeated_digit(v: f64) -> bool {
    let digits: Vec<u8> = format!("{}", v.abs())
        .bytes()
        .filter(u8::is_ascii_digit)
        .collect();
    digits.len() >= 2 && digits.windows(2).all(|w| w[0] == w[1])
}

/// True when the concatenated digit text of the pair contains an
/// immediately repeated 3-digit group.
fn has_triplet_repetition(lat: f64, lon: f64) -> bool {
    let digits: Vec<u8> = format!("{}{}", lat, lon)
        .bytes()
        .filter(u8::is_ascii_digit)
        .collect();
    digits
        .windows(6)
        .any(|w| w[0] == w[3] && w[1] == w[4] && w[2] == w[5])
}

// ---------------------------------------------------------------------------
// Scalar normalization
// ---------------------------------------------------------------------------

pub fn clamp_speed(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, SPEED_MAX)
    } else {
        0.0
    }
}

pub fn clamp_altitude(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(ALTITUDE_MIN, ALTITUDE_MAX)
    } else {
        0.0
    }
}

/// Reduce a heading into [0, 360).
pub fn normalize_angle(v: f64) -> f64 {
    if v.is_finite() {
        v.rem_euclid(360.0)
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Batch pipeline
// ---------------------------------------------------------------------------

/// Validate and clamp one fix. `None` means the coordinates were garbage.
pub fn sanitize(mut fix: TelemetryFix) -> Option<TelemetryFix> {
    if !coordinates_valid(fix.latitude, fix.longitude) {
        return None;
    }
    fix.speed = clamp_speed(fix.speed);
    fix.course = normalize_angle(fix.course);
    fix.altitude = fix.altitude.map(clamp_altitude);
    Some(fix)
}

/// Sanitize a whole batch and sort survivors by timestamp ascending.
pub fn prepare_batch(fixes: Vec<TelemetryFix>) -> Vec<TelemetryFix> {
    let mut out: Vec<TelemetryFix> = fixes.into_iter().filter_map(sanitize).collect();
    out.sort_by_key(|f| f.timestamp);
    out
}

/// Stationary consolidation: a batch whose fixes all sit at speed 0
/// collapses to the most recent one. Mixed batches pass through.
pub fn consolidate_stationary(fixes: Vec<TelemetryFix>) -> Vec<TelemetryFix> {
    if fixes.len() > 1 && fixes.iter().all(|f| f.speed == 0.0) {
        // Sorted ascending, so the last fix is the latest.
        let last = fixes.len() - 1;
        fixes.into_iter().skip(last).collect()
    } else {
        fixes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn fix(lat: f64, lon: f64, speed: f64, ts: i64) -> TelemetryFix {
        TelemetryFix {
            imei: "356938035643809".to_owned(),
            timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
            latitude: lat,
            longitude: lon,
            speed,
            course: 90.0,
            altitude: Some(123.4),
            satellites: 9,
            positioned: true,
            valid: true,
            protocol: "jimi/0x22".to_owned(),
            serial: None,
            source_port: 7000,
            cell: None,
            io_elements: BTreeMap::new(),
        }
    }

    #[test]
    fn plausible_coordinates_pass() {
        assert!(coordinates_valid(54.6872, 25.2787));
        assert!(coordinates_valid(-33.8688, 151.2093));
        assert!(coordinates_valid(46.3889, -63.7427));
    }

    #[test]
    fn zero_pair_rejected() {
        assert!(!coordinates_valid(0.0, 0.0));
        assert!(!coordinates_valid(0.0, 1e-9));
    }

    #[test]
    fn out_of_range_rejected() {
        assert!(!coordinates_valid(90.1, 25.0));
        assert!(!coordinates_valid(54.0, -180.5));
    }

    #[test]
    fn grid_artifacts_rejected() {
        // Whole-degree lat multiple of 90 with whole-degree lon multiple
        // of 180: near-equator/meridian junk.
        assert!(!coordinates_valid(0.5, 0.25));
        assert!(!coordinates_valid(-0.2, 0.9));
    }

    #[test]
    fn sentinel_extremes_rejected() {
        assert!(!coordinates_valid(f64::MAX, 25.0));
        assert!(!coordinates_valid(54.0, f64::NAN));
        assert!(!coordinates_valid(f64::INFINITY, 25.0));
    }

    #[test]
    fn power_of_two_rejected() {
        assert!(!coordinates_valid(64.0, 25.2787));
        assert!(!coordinates_valid(54.6872, 32.0));
        assert!(!coordinates_valid(54.6872, 0.5));
    }

    #[test]
    fn repeated_digit_rejected() {
        assert!(!coordinates_valid(55.5555, 25.2787));
        assert!(!coordinates_valid(54.6872, 33.333));
    }

    #[test]
    fn triplet_repetition_rejected() {
        // "123123..." in the concatenated digit text.
        assert!(!coordinates_valid(12.3123, 45.6789));
    }

    #[test]
    fn mirrored_pair_rejected() {
        assert!(!coordinates_valid(46.3889, 46.3889));
        // Different signs are not mirrors.
        assert!(coordinates_valid(46.3889, -46.3889));
    }

    #[test]
    fn clamps() {
        assert_eq!(clamp_speed(-5.0), 0.0);
        assert_eq!(clamp_speed(1500.0), 1000.0);
        assert_eq!(clamp_speed(88.0), 88.0);
        assert_eq!(clamp_altitude(-2000.0), -1000.0);
        assert_eq!(clamp_altitude(30_000.0), 20_000.0);
        assert_eq!(normalize_angle(370.0), 10.0);
        assert_eq!(normalize_angle(-10.0), 350.0);
        assert_eq!(normalize_angle(359.5), 359.5);
    }

    #[test]
    fn prepare_batch_filters_and_sorts() {
        let batch = vec![
            fix(54.6875, 25.2790, 47.0, 2000),
            fix(0.0, 0.0, 10.0, 1500),
            fix(54.6872, 25.2787, 45.0, 1000),
        ];
        let out = prepare_batch(batch);
        assert_eq!(out.len(), 2);
        assert!(out[0].timestamp < out[1].timestamp);
        assert_eq!(out[0].speed, 45.0);
    }

    #[test]
    fn normalized_output_is_always_in_range() {
        let out = prepare_batch(vec![
            fix(89.9, 179.9, 2000.0, 1),
            fix(-89.9, -179.9, -1.0, 2),
        ]);
        for f in &out {
            assert!(f.latitude.abs() <= 90.0);
            assert!(f.longitude.abs() <= 180.0);
            assert!((0.0..=1000.0).contains(&f.speed));
            assert!((0.0..360.0).contains(&f.course));
        }
    }

    #[test]
    fn stationary_batch_collapses_to_latest() {
        let batch: Vec<_> = (0..5).map(|i| fix(54.6872, 25.2787, 0.0, 1000 + i)).collect();
        let out = consolidate_stationary(prepare_batch(batch));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp.timestamp(), 1004);
    }

    #[test]
    fn moving_batch_not_consolidated() {
        let batch = vec![
            fix(54.6872, 25.2787, 0.0, 1000),
            fix(54.6875, 25.2790, 12.0, 1001),
        ];
        let out = consolidate_stationary(prepare_batch(batch));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn single_stationary_fix_passes() {
        let out = consolidate_stationary(vec![fix(54.6872, 25.2787, 0.0, 1000)]);
        assert_eq!(out.len(), 1);
    }
}
