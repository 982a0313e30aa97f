//! Periodic stats snapshots and the delta engine turning two snapshots
//! into throughput numbers and discrete counter-change signals.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StatsError;

/// One point-in-time reading of the transport and encoder counters.
///
/// Byte counters come from the peer connection's stats reports; the
/// encoder fields come from whatever telemetry the embedding application
/// feeds in, and stay `None` until a first value is published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub captured_at: DateTime<Utc>,
    pub audio_bytes_sent: u64,
    pub audio_bytes_received: u64,
    pub video_bytes_sent: u64,
    pub video_bytes_received: u64,
    pub encoded_width: Option<u32>,
    pub encoded_height: Option<u32>,
    pub frames_per_second: Option<f64>,
    pub pli_count: Option<u64>,
    pub fir_count: Option<u64>,
    pub key_frames_encoded: Option<u64>,
    pub key_frames_decoded: Option<u64>,
}

/// Encoder-side counters the session cannot observe from the transport.
/// Published by the embedding application through a watch channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncoderTelemetry {
    pub encoded_width: Option<u32>,
    pub encoded_height: Option<u32>,
    pub frames_per_second: Option<f64>,
    pub key_frames_encoded: Option<u64>,
    pub key_frames_decoded: Option<u64>,
}

/// Per-interval throughput, kbit/s rounded to one decimal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsDelta {
    pub elapsed_seconds: f64,
    pub audio_up_kbps: f64,
    pub audio_down_kbps: f64,
    pub video_up_kbps: f64,
    pub video_down_kbps: f64,
}

/// A discrete counter whose value changed between two snapshots. Fires
/// only when the new value is defined and differs from the previous one;
/// a counter that never got a value never signals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CounterChange {
    Resolution { width: u32, height: u32 },
    FrameRate(f64),
    PliCount(u64),
    FirCount(u64),
    KeyFramesEncoded(u64),
    KeyFramesDecoded(u64),
}

/// kbit/s over the interval, one-decimal rounding.
pub fn kbps(bytes: u64, elapsed_seconds: f64) -> f64 {
    let raw = (bytes as f64) * 8.0 / elapsed_seconds / 1024.0;
    (raw * 10.0).round() / 10.0
}

/// Compute throughput between two snapshots.
///
/// Byte counters saturate on decrease so a transport restart reads as a
/// silent interval rather than a panic or a bogus negative rate.
pub fn diff(prev: &StatsSnapshot, cur: &StatsSnapshot) -> Result<StatsDelta, StatsError> {
    let elapsed_seconds =
        (cur.captured_at - prev.captured_at).num_milliseconds() as f64 / 1000.0;
    if elapsed_seconds <= 0.0 {
        return Err(StatsError::NonPositiveInterval(elapsed_seconds));
    }

    Ok(StatsDelta {
        elapsed_seconds,
        audio_up_kbps: kbps(
            cur.audio_bytes_sent.saturating_sub(prev.audio_bytes_sent),
            elapsed_seconds,
        ),
        audio_down_kbps: kbps(
            cur.audio_bytes_received.saturating_sub(prev.audio_bytes_received),
            elapsed_seconds,
        ),
        video_up_kbps: kbps(
            cur.video_bytes_sent.saturating_sub(prev.video_bytes_sent),
            elapsed_seconds,
        ),
        video_down_kbps: kbps(
            cur.video_bytes_received.saturating_sub(prev.video_bytes_received),
            elapsed_seconds,
        ),
    })
}

/// Collect the discrete counters that changed between two snapshots.
pub fn counter_changes(prev: &StatsSnapshot, cur: &StatsSnapshot) -> Vec<CounterChange> {
    let mut changes = Vec::new();

    if let (Some(width), Some(height)) = (cur.encoded_width, cur.encoded_height) {
        if Some(width) != prev.encoded_width || Some(height) != prev.encoded_height {
            changes.push(CounterChange::Resolution { width, height });
        }
    }
    if let Some(fps) = cur.frames_per_second {
        if Some(fps) != prev.frames_per_second {
            changes.push(CounterChange::FrameRate(fps));
        }
    }
    if let Some(count) = cur.pli_count {
        if Some(count) != prev.pli_count {
            changes.push(CounterChange::PliCount(count));
        }
    }
    if let Some(count) = cur.fir_count {
        if Some(count) != prev.fir_count {
            changes.push(CounterChange::FirCount(count));
        }
    }
    if let Some(count) = cur.key_frames_encoded {
        if Some(count) != prev.key_frames_encoded {
            changes.push(CounterChange::KeyFramesEncoded(count));
        }
    }
    if let Some(count) = cur.key_frames_decoded {
        if Some(count) != prev.key_frames_decoded {
            changes.push(CounterChange::KeyFramesDecoded(count));
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn at(base: DateTime<Utc>, ms: i64) -> DateTime<Utc> {
        base + TimeDelta::milliseconds(ms)
    }

    #[test]
    fn kbps_rounds_to_one_decimal() {
        // 2048 bytes over 2s is exactly 8 kbit/s.
        assert_eq!(kbps(2048, 2.0), 8.0);
        // 1000 bytes over 1s is 7.8125 kbit/s.
        assert_eq!(kbps(1000, 1.0), 7.8);
    }

    #[test]
    fn diff_computes_per_kind_throughput() {
        let base = Utc::now();
        let prev = StatsSnapshot {
            captured_at: base,
            audio_bytes_sent: 1000,
            video_bytes_received: 5000,
            ..Default::default()
        };
        let cur = StatsSnapshot {
            captured_at: at(base, 2000),
            audio_bytes_sent: 3048,
            video_bytes_received: 5000,
            ..Default::default()
        };

        let delta = diff(&prev, &cur).unwrap();
        assert_eq!(delta.elapsed_seconds, 2.0);
        assert_eq!(delta.audio_up_kbps, 8.0);
        assert_eq!(delta.video_down_kbps, 0.0);
    }

    #[test]
    fn non_positive_interval_is_an_error() {
        let base = Utc::now();
        let prev = StatsSnapshot { captured_at: base, ..Default::default() };
        let same = prev.clone();
        let earlier = StatsSnapshot { captured_at: at(base, -500), ..Default::default() };

        assert!(matches!(diff(&prev, &same), Err(StatsError::NonPositiveInterval(_))));
        assert!(matches!(diff(&prev, &earlier), Err(StatsError::NonPositiveInterval(_))));
    }

    #[test]
    fn counter_decrease_saturates_to_zero_rate() {
        let base = Utc::now();
        let prev = StatsSnapshot {
            captured_at: base,
            video_bytes_sent: 9000,
            ..Default::default()
        };
        let cur = StatsSnapshot {
            captured_at: at(base, 1000),
            video_bytes_sent: 100,
            ..Default::default()
        };
        assert_eq!(diff(&prev, &cur).unwrap().video_up_kbps, 0.0);
    }

    #[test]
    fn undefined_counters_never_signal() {
        let prev = StatsSnapshot::default();
        let cur = StatsSnapshot::default();
        assert!(counter_changes(&prev, &cur).is_empty());
    }

    #[test]
    fn value_going_undefined_never_signals() {
        // Even when every previous counter was defined and differs.
        let prev = StatsSnapshot {
            encoded_width: Some(800),
            encoded_height: Some(600),
            frames_per_second: Some(30.0),
            pli_count: Some(2),
            fir_count: Some(1),
            key_frames_encoded: Some(10),
            key_frames_decoded: Some(12),
            ..Default::default()
        };
        let cur = StatsSnapshot::default();
        assert!(counter_changes(&prev, &cur).is_empty());
    }

    #[test]
    fn first_defined_value_signals() {
        let prev = StatsSnapshot::default();
        let cur = StatsSnapshot {
            encoded_width: Some(800),
            encoded_height: Some(600),
            frames_per_second: Some(30.0),
            pli_count: Some(0),
            ..Default::default()
        };

        let changes = counter_changes(&prev, &cur);
        assert!(changes.contains(&CounterChange::Resolution { width: 800, height: 600 }));
        assert!(changes.contains(&CounterChange::FrameRate(30.0)));
        assert!(changes.contains(&CounterChange::PliCount(0)));
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn unchanged_values_stay_silent() {
        let snapshot = StatsSnapshot {
            encoded_width: Some(800),
            encoded_height: Some(600),
            frames_per_second: Some(30.0),
            pli_count: Some(2),
            fir_count: Some(1),
            key_frames_encoded: Some(10),
            key_frames_decoded: Some(12),
            ..Default::default()
        };
        assert!(counter_changes(&snapshot, &snapshot).is_empty());
    }

    #[test]
    fn each_counter_signals_independently() {
        let prev = StatsSnapshot {
            pli_count: Some(2),
            fir_count: Some(1),
            key_frames_encoded: Some(10),
            key_frames_decoded: Some(12),
            ..Default::default()
        };
        let cur = StatsSnapshot {
            pli_count: Some(3),
            fir_count: Some(1),
            key_frames_encoded: Some(11),
            key_frames_decoded: Some(12),
            ..Default::default()
        };

        let changes = counter_changes(&prev, &cur);
        assert_eq!(
            changes,
            vec![CounterChange::PliCount(3), CounterChange::KeyFramesEncoded(11)]
        );
    }
}
