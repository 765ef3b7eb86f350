//! Breakout classification against zone midpoints
//!
//! A breakout is a close crossing a zone midpoint by more than a relative
//! threshold, with the previous close on the other side of the midpoint.
//! Zones are checked in the order the builder ranked them and the first
//! qualifying zone wins; at most one signal per bar.

use super::zones::Zone;
use crate::types::Signal;

#[derive(Debug, Clone)]
pub struct BreakoutClassifier {
    /// Relative distance beyond the midpoint a close must reach
    threshold: f64,
}

impl BreakoutClassifier {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn classify(&self, zones: &[Zone], prev_close: f64, close: f64) -> Signal {
        for zone in zones {
            let mid = zone.midpoint();

            if prev_close <= mid && close > mid * (1.0 + self.threshold) {
                return Signal::Long;
            }
            if prev_close >= mid && close < mid * (1.0 - self.threshold) {
                return Signal::Short;
            }
        }
        Signal::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(low: f64, high: f64, strength: u32) -> Zone {
        Zone { low, high, strength }
    }

    #[test]
    fn cross_below_threshold_is_rejected() {
        // Zone [100,102], mid 101. Close above mid but under 101 * 1.002.
        let zones = [zone(100.0, 102.0, 3)];
        let classifier = BreakoutClassifier::new(0.002);

        assert_eq!(classifier.classify(&zones, 100.9, 101.15), Signal::None);
    }

    #[test]
    fn cross_beyond_threshold_fires_long() {
        let zones = [zone(100.0, 102.0, 3)];
        let classifier = BreakoutClassifier::new(0.002);

        // 101 * 1.002 = 101.202; just beyond it
        assert_eq!(classifier.classify(&zones, 100.9, 101.21), Signal::Long);
    }

    #[test]
    fn downward_cross_fires_short() {
        let zones = [zone(100.0, 102.0, 3)];
        let classifier = BreakoutClassifier::new(0.002);

        // 101 * 0.998 = 100.798
        assert_eq!(classifier.classify(&zones, 101.1, 100.7), Signal::Short);
    }

    #[test]
    fn prev_close_already_beyond_mid_does_not_signal() {
        let zones = [zone(100.0, 102.0, 3)];
        let classifier = BreakoutClassifier::new(0.002);

        // Already above mid last bar: no fresh cross
        assert_eq!(classifier.classify(&zones, 101.5, 102.0), Signal::None);
    }

    #[test]
    fn first_matching_zone_wins() {
        // Strongest zone first; both midpoints crossed upward but only the
        // first is consulted.
        let zones = [zone(100.0, 102.0, 5), zone(95.0, 97.0, 2)];
        let classifier = BreakoutClassifier::new(0.002);

        assert_eq!(classifier.classify(&zones, 96.0, 101.3), Signal::Long);
    }

    #[test]
    fn no_zones_no_signal() {
        let classifier = BreakoutClassifier::new(0.002);
        assert_eq!(classifier.classify(&[], 100.0, 110.0), Signal::None);
    }
}
