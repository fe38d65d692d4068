//! Channel registry: data categories, channel plans, unit and ventilation-mode
//! tables, and the linear raw-to-physical conversion.
//!
//! The Servo streams three kinds of data, each with its own consumption policy:
//! continuous curve samples, once-per-breath numerics, and discrete settings.
//! Channels are declared per category before streaming starts and stay fixed
//! for the lifetime of a connection; their gain/offset coefficients are fetched
//! from the device afterwards and a channel only becomes usable once both
//! coefficients are known.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

// ============================================================================
// Well-known channels
// ============================================================================

/// Setting channel carrying the active ventilation mode code.
pub const MODE_CHANNEL: u16 = 310;

/// Breath channel whose meaning depends on the active ventilation mode:
/// I:E in the machine-timed modes, Ti:Ttot otherwise.
pub const RATIO_CHANNEL: u16 = 238;

/// Modes in which the ratio channel reports an I:E ratio.
pub const RATIO_MODES: [&str; 3] = [
    "Pressure Control",
    "Volume Control",
    "Pressure Reg. Volume Control",
];

/// Whether the ratio channel carries an I:E value in the given mode.
pub fn is_ratio_mode(mode: &str) -> bool {
    RATIO_MODES.contains(&mode)
}

/// Label and unit the ratio channel should display under the given mode.
/// Pure function of the latest observed mode, so re-applying it is idempotent.
pub fn ratio_binding(mode: &str) -> (&'static str, &'static str) {
    if is_ratio_mode(mode) {
        ("I:E", "ratio")
    } else {
        ("Ti:Ttot", "ratio")
    }
}

// ============================================================================
// Categories and drain policy
// ============================================================================

/// Data categories the CIE streams, with their protocol letters.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Category {
    /// Continuous waveform samples ('C').
    Curve,
    /// Per-breath numeric values ('B').
    Breath,
    /// Discrete device settings ('S'), e.g. the ventilation mode.
    Setting,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Curve, Category::Breath, Category::Setting];

    /// Letter used on the wire to address this category.
    pub fn letter(self) -> u8 {
        match self {
            Category::Curve => b'C',
            Category::Breath => b'B',
            Category::Setting => b'S',
        }
    }

    /// How the acquisition loop consumes this category's queues.
    ///
    /// Curves keep their most recent sample behind so a "current" point is
    /// always available to the display; breath and setting data are consumed
    /// completely.
    pub fn drain_policy(self) -> DrainPolicy {
        match self {
            Category::Curve => DrainPolicy::KeepLast,
            Category::Breath | Category::Setting => DrainPolicy::All,
        }
    }
}

/// Queue consumption policy applied when draining a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Remove every queued value.
    All,
    /// Remove every queued value except the most recent one.
    KeepLast,
}

// ============================================================================
// Channel plan
// ============================================================================

/// One channel the monitor wants streamed, with its display metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub id: u16,
    pub label: String,
    pub unit: String,
}

impl ChannelSpec {
    fn new(id: u16, label: &str, unit: &str) -> Self {
        Self {
            id,
            label: label.to_string(),
            unit: unit.to_string(),
        }
    }
}

/// The set of channels to declare per category. Declaration order matters:
/// the device streams samples positionally in this order within a category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelPlan {
    pub curve: Vec<ChannelSpec>,
    pub breath: Vec<ChannelSpec>,
    pub setting: Vec<ChannelSpec>,
}

impl ChannelPlan {
    /// The channel set displayed by the reference Servo-i layout.
    pub fn servo_default() -> Self {
        Self {
            curve: vec![
                ChannelSpec::new(100, "Flow", "l/min BTPS"),
                ChannelSpec::new(101, "Paw", "cmH2O"),
                ChannelSpec::new(114, "Flow exp", "l/min BTPS"),
            ],
            breath: vec![
                ChannelSpec::new(200, "RR", "br/min"),
                ChannelSpec::new(201, "VTe", "ml"),
                ChannelSpec::new(202, "VTi", "ml"),
                ChannelSpec::new(205, "Ppeak", "cmH2O"),
                ChannelSpec::new(206, "Pmean", "cmH2O"),
                ChannelSpec::new(208, "PEEP", "cmH2O"),
                ChannelSpec::new(209, "O2", "%"),
                ChannelSpec::new(238, "I:E", "ratio"),
                ChannelSpec::new(244, "CH244", ""),
                ChannelSpec::new(248, "MVe", "l/min"),
            ],
            setting: vec![ChannelSpec::new(310, "Ventilation Mode", "")],
        }
    }

    pub fn specs(&self, category: Category) -> &[ChannelSpec] {
        match category {
            Category::Curve => &self.curve,
            Category::Breath => &self.breath,
            Category::Setting => &self.setting,
        }
    }

    /// Channel ids for a category, in declaration order.
    pub fn ids(&self, category: Category) -> Vec<u16> {
        self.specs(category).iter().map(|spec| spec.id).collect()
    }
}

// ============================================================================
// Channel configuration and conversion
// ============================================================================

/// Per-channel conversion coefficients as fetched from the device.
///
/// A channel whose configuration read failed (or reported `--` fields) stays
/// not ready; its raw values cannot be converted and are never shown with a
/// default gain/offset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub gain: Option<f64>,
    pub offset: Option<f64>,
    pub unit: Option<String>,
}

impl ChannelConfig {
    /// Whether both conversion coefficients are known.
    pub fn ready(&self) -> bool {
        self.gain.is_some() && self.offset.is_some()
    }

    /// Convert a raw register value to physical units, rounded to the
    /// 3-decimal display precision. `None` while the channel is not ready.
    pub fn convert(&self, raw: i32) -> Option<f64> {
        let gain = self.gain?;
        let offset = self.offset?;
        Some(round3(f64::from(raw) * gain - offset))
    }
}

/// Round to 3 decimal places; raw device units carry more precision than is
/// meaningful to display.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

// ============================================================================
// Static tables
// ============================================================================

static UNITS: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (1, "ml"),
        (2, "ml/s"),
        (3, "ml/min"),
        (4, "cmH2O"),
        (5, "ml/cmH2O"),
        (6, "breaths/min"),
        (7, "%"),
        (8, "l/min"),
        (9, "cmH2O/l/s"),
        (10, "mmHg"),
        (11, "kPa"),
        (12, "mbar"),
        (13, "mV"),
        (14, "s"),
        (15, "l/s"),
        (16, "cmH2O/l"),
        (17, "l"),
        (18, "Joule/l"),
        (19, "μV"),
        (20, "no unit"),
        (21, "cmH2O/μV"),
        (22, "breaths/min/l"),
        (23, "min"),
    ])
});

static VENTILATION_MODES: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (2, "Pressure Control"),
        (3, "Volume Control"),
        (4, "Pressure Reg. Volume Control"),
        (5, "Volume Support"),
        (6, "SIMV (Vol. Cont.) + Pressure Support"),
        (7, "SIMV (Pressure Control) + Pressure Support"),
        (8, "Pressure Support / CPAP"),
        (9, "Ventilation mode not supported by CIE"),
        (10, "SIMV (Pressure Reg. Volume Control) + Pressure Support"),
        (11, "Bivent"),
        (12, "Pressure Control in NIV"),
        (13, "Pressure Support / CPAP in NIV"),
        (14, "Nasal CPAP"),
        (15, "NAVA"),
        (17, "NIV NAVA"),
        (18, "Pressure Control, No Patient Trigger"),
        (19, "Volume Control, No Patient Trigger"),
        (20, "Pressure Reg. Volume Control, No Patient Trigger"),
        (
            21,
            "Pressure Support / CPAP (Switch to Pressure Control if No Patient Trigger)",
        ),
        (
            22,
            "Volume Support (Switch to Volume Control if No Patient Trigger)",
        ),
        (
            23,
            "Volume Support (Switch to Pressure Reg. Volume Control if No Patient Trigger)",
        ),
    ])
});

/// Unit string for a CIE unit code.
pub fn unit_name(code: u16) -> Option<&'static str> {
    UNITS.get(&code).copied()
}

/// Ventilation mode name for a raw mode code. Codes outside the table are
/// unknown and must be surfaced as such, never defaulted to a known mode.
pub fn mode_name(code: u16) -> Option<&'static str> {
    VENTILATION_MODES.get(&code).copied()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_applies_gain_then_offset() {
        let config = ChannelConfig {
            gain: Some(0.5),
            offset: Some(10.0),
            unit: None,
        };
        assert_eq!(config.convert(100), Some(40.0));
    }

    #[test]
    fn convert_rounds_to_three_decimals() {
        let config = ChannelConfig {
            gain: Some(0.0001),
            offset: Some(0.0),
            unit: None,
        };
        assert_eq!(config.convert(123456), Some(12.346));
    }

    #[test]
    fn convert_requires_both_coefficients() {
        let missing_offset = ChannelConfig {
            gain: Some(1.0),
            offset: None,
            unit: None,
        };
        assert!(!missing_offset.ready());
        assert_eq!(missing_offset.convert(42), None);

        let missing_gain = ChannelConfig {
            gain: None,
            offset: Some(0.0),
            unit: None,
        };
        assert!(!missing_gain.ready());
        assert_eq!(missing_gain.convert(42), None);
    }

    #[test]
    fn mode_table_lookup() {
        assert_eq!(mode_name(2), Some("Pressure Control"));
        assert_eq!(mode_name(8), Some("Pressure Support / CPAP"));
        // Code 16 is a gap in the CIE mode table.
        assert_eq!(mode_name(16), None);
        assert_eq!(mode_name(99), None);
    }

    #[test]
    fn unit_table_lookup() {
        assert_eq!(unit_name(6), Some("breaths/min"));
        assert_eq!(unit_name(0), None);
        assert_eq!(unit_name(24), None);
    }

    #[test]
    fn ratio_binding_follows_mode() {
        assert_eq!(ratio_binding("Pressure Control"), ("I:E", "ratio"));
        assert_eq!(ratio_binding("Volume Control"), ("I:E", "ratio"));
        assert_eq!(
            ratio_binding("Pressure Reg. Volume Control"),
            ("I:E", "ratio")
        );
        assert_eq!(ratio_binding("NAVA"), ("Ti:Ttot", "ratio"));
        // Re-applying the same mode yields the same binding.
        assert_eq!(ratio_binding("NAVA"), ratio_binding("NAVA"));
    }

    #[test]
    fn default_plan_declares_reference_channels() {
        let plan = ChannelPlan::servo_default();
        assert_eq!(plan.ids(Category::Curve), vec![100, 101, 114]);
        assert_eq!(
            plan.ids(Category::Breath),
            vec![200, 201, 202, 205, 206, 208, 209, 238, 244, 248]
        );
        assert_eq!(plan.ids(Category::Setting), vec![MODE_CHANNEL]);
    }
}
