//! Dynamic support/resistance zone clustering
//!
//! Clusters the bounded pivot history into overlap-free price bands. Each
//! pivot seeds a candidate zone that absorbs every other pivot reachable
//! within the channel width; candidates are then ranked by strength and
//! accepted greedily while they stay disjoint from the zones already kept.
//! O(P^2) per bar with P bounded by `max_pivots`.

/// A clustered price band with its pivot count
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Zone {
    pub high: f64,
    pub low: f64,
    /// Number of pivots absorbed by the zone
    pub strength: u32,
}

impl Zone {
    pub fn midpoint(&self) -> f64 {
        (self.high + self.low) / 2.0
    }

    /// Interval intersection test on [low, high]
    pub fn overlaps(&self, other: &Zone) -> bool {
        self.high >= other.low && other.high >= self.low
    }
}

/// Builds the ranked, overlap-free zone set for one bar.
#[derive(Debug, Clone)]
pub struct ZoneBuilder {
    max_sr_levels: usize,
    min_strength: u32,
}

impl ZoneBuilder {
    pub fn new(max_sr_levels: usize, min_strength: u32) -> Self {
        Self {
            max_sr_levels,
            min_strength,
        }
    }

    /// `pivot_values` is ordered most-recent-first; `channel_width` is the
    /// maximum price span a single zone may grow to.
    pub fn build(&self, pivot_values: &[f64], channel_width: f64) -> Vec<Zone> {
        let mut candidates: Vec<Zone> = Vec::with_capacity(pivot_values.len());

        for &p_ref in pivot_values {
            let mut lo = p_ref;
            let mut hi = p_ref;
            let mut strength = 0u32;

            for &p_comp in pivot_values {
                // Width the zone would need to reach p_comp from its
                // current extent
                let width = if p_comp <= lo { hi - p_comp } else { p_comp - lo };

                if width <= channel_width {
                    if p_comp <= hi {
                        lo = lo.min(p_comp);
                    } else {
                        hi = hi.max(p_comp);
                    }
                    strength += 1;
                }
            }

            candidates.push(Zone {
                high: hi,
                low: lo,
                strength,
            });
        }

        candidates.sort_by(|a, b| b.strength.cmp(&a.strength));

        let mut accepted: Vec<Zone> = Vec::new();
        for zone in candidates {
            if zone.strength < self.min_strength {
                continue;
            }
            if accepted.iter().any(|a| a.overlaps(&zone)) {
                continue;
            }
            accepted.push(zone);
            if accepted.len() >= self.max_sr_levels {
                break;
            }
        }

        accepted
    }
}
