//! Level of Detail (LOD) and quality tier selection for previews
//!
//! Every prepared model carries all of its LOD geometries, highest detail
//! first. Which one a widget draws, and at what material tier, follows from
//! the widget's priority and the current performance state.

use serde::Serialize;

use crate::optimize::material::MaterialTier;
use crate::render::monitor::PerformanceState;

/// Default LOD ratios relative to the base triangle count
/// - LOD 0: full detail
/// - LOD 1: half the triangles
/// - LOD 2: a quarter of the triangles
pub const DEFAULT_LOD_RATIOS: [f32; 3] = [1.0, 0.5, 0.25];

/// Pick a LOD level from a widget priority
///
/// Priorities are clamped to `0.0..=1.0`; the range is split into
/// `lod_count` equal bands with the highest band drawing LOD 0.
///
/// # Arguments
/// * `priority` - Widget priority, higher is more important
/// * `lod_count` - Number of LOD levels the model carries
///
/// # Returns
/// LOD level in `0..lod_count` (0 when the model has no levels)
///
/// # Examples
/// ```
/// use figview::streaming::lod::lod_for_priority;
///
/// assert_eq!(lod_for_priority(1.0, 3), 0);  // Full detail
/// assert_eq!(lod_for_priority(0.5, 3), 1);
/// assert_eq!(lod_for_priority(0.1, 3), 2);  // Coarsest
/// assert_eq!(lod_for_priority(7.5, 3), 0);  // Clamped
/// assert_eq!(lod_for_priority(0.5, 0), 0);
/// ```
pub fn lod_for_priority(priority: f32, lod_count: usize) -> usize {
    if lod_count == 0 {
        return 0;
    }
    let p = if priority.is_nan() { 0.0 } else { priority.clamp(0.0, 1.0) };
    let level = ((1.0 - p) * lod_count as f32).floor() as usize;
    level.min(lod_count - 1)
}

/// Material tier matching a LOD level
///
/// # Examples
/// ```
/// use figview::optimize::MaterialTier;
/// use figview::streaming::lod::material_tier_for_lod;
///
/// assert_eq!(material_tier_for_lod(0, 3), MaterialTier::High);
/// assert_eq!(material_tier_for_lod(1, 3), MaterialTier::Medium);
/// assert_eq!(material_tier_for_lod(2, 3), MaterialTier::Low);
/// assert_eq!(material_tier_for_lod(0, 1), MaterialTier::High);
/// ```
pub fn material_tier_for_lod(level: usize, lod_count: usize) -> MaterialTier {
    if level == 0 || lod_count <= 1 {
        MaterialTier::High
    } else if level + 1 >= lod_count {
        MaterialTier::Low
    } else {
        MaterialTier::Medium
    }
}

/// What a preview should draw with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct QualityTier {
    pub lod_level: usize,
    pub material: MaterialTier,
    pub antialias: bool,
}

impl QualityTier {
    /// Full quality: LOD 0, full material, antialiasing on
    pub const FULL: QualityTier = QualityTier {
        lod_level: 0,
        material: MaterialTier::High,
        antialias: true,
    };

    /// Pick a tier from the performance state and widget priority
    ///
    /// `fair` draws one level coarser than the priority alone would choose;
    /// `degraded` forces the coarsest level, the cheapest material and no
    /// antialiasing.
    ///
    /// # Examples
    /// ```
    /// use figview::optimize::MaterialTier;
    /// use figview::render::monitor::PerformanceState;
    /// use figview::streaming::lod::QualityTier;
    ///
    /// let tier = QualityTier::for_state(PerformanceState::Optimal, 1.0, 3);
    /// assert_eq!(tier, QualityTier::FULL);
    ///
    /// let tier = QualityTier::for_state(PerformanceState::Degraded, 1.0, 3);
    /// assert_eq!(tier.lod_level, 2);
    /// assert_eq!(tier.material, MaterialTier::Low);
    /// assert!(!tier.antialias);
    /// ```
    pub fn for_state(state: PerformanceState, priority: f32, lod_count: usize) -> Self {
        let coarsest = lod_count.saturating_sub(1);
        match state {
            PerformanceState::Optimal => {
                let lod_level = lod_for_priority(priority, lod_count);
                Self {
                    lod_level,
                    material: material_tier_for_lod(lod_level, lod_count),
                    antialias: true,
                }
            }
            PerformanceState::Fair => {
                let lod_level = (lod_for_priority(priority, lod_count) + 1).min(coarsest);
                Self {
                    lod_level,
                    material: material_tier_for_lod(lod_level, lod_count),
                    antialias: true,
                }
            }
            PerformanceState::Degraded => Self {
                lod_level: coarsest,
                material: MaterialTier::Low,
                antialias: false,
            },
        }
    }
}

impl Default for QualityTier {
    fn default() -> Self {
        Self::FULL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_bands_cover_all_levels() {
        let levels: Vec<_> = [1.0, 0.8, 0.6, 0.4, 0.2, 0.0]
            .iter()
            .map(|&p| lod_for_priority(p, 3))
            .collect();
        assert_eq!(levels, vec![0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn test_nan_priority_is_coarsest() {
        assert_eq!(lod_for_priority(f32::NAN, 3), 2);
    }

    #[test]
    fn test_fair_steps_one_level_coarser() {
        let tier = QualityTier::for_state(PerformanceState::Fair, 1.0, 3);
        assert_eq!(tier.lod_level, 1);
        assert_eq!(tier.material, MaterialTier::Medium);
        assert!(tier.antialias);

        // Never beyond the coarsest level
        let tier = QualityTier::for_state(PerformanceState::Fair, 0.0, 3);
        assert_eq!(tier.lod_level, 2);
    }

    #[test]
    fn test_degraded_single_level_model() {
        let tier = QualityTier::for_state(PerformanceState::Degraded, 1.0, 1);
        assert_eq!(tier.lod_level, 0);
        assert_eq!(tier.material, MaterialTier::Low);
        assert!(!tier.antialias);
    }

    #[test]
    fn test_default_ratios_descend() {
        assert!(DEFAULT_LOD_RATIOS.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(DEFAULT_LOD_RATIOS[0], 1.0);
    }
}
