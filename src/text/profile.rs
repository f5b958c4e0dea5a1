//! Reading profile
//!
//! Enumerated synthesis-shaping options. Every field participates in the
//! segment cache key, so the canonical JSON form must stay deterministic.

use serde::{Deserialize, Serialize};

/// Pause handling inside dialogue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuoteMode {
    #[default]
    Normal,
    /// Reduced pause variance inside quoted speech
    Tight,
}

/// Acronym handling before resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AcronymMode {
    #[default]
    Off,
    /// Spell out uppercase runs letter by letter
    Spell,
}

/// Number-reading style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NumberMode {
    #[default]
    Cardinal,
    Ordinal,
    /// Four-digit numbers read as two-digit pairs
    Year,
}

/// Synthesis-shaping options carried by every job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingProfile {
    /// Synthesis speed multiplier
    #[serde(default = "default_rate")]
    pub rate: f32,

    /// Inter-segment silence multiplier applied at merge time
    #[serde(default = "default_pause_scale")]
    pub pause_scale: f32,

    #[serde(default)]
    pub quote_mode: QuoteMode,

    #[serde(default)]
    pub acronym_mode: AcronymMode,

    #[serde(default)]
    pub number_mode: NumberMode,
}

fn default_rate() -> f32 {
    1.0
}

fn default_pause_scale() -> f32 {
    1.0
}

impl Default for ReadingProfile {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            pause_scale: default_pause_scale(),
            quote_mode: QuoteMode::default(),
            acronym_mode: AcronymMode::default(),
            number_mode: NumberMode::default(),
        }
    }
}

impl ReadingProfile {
    /// Clamp numeric fields into their documented ranges
    pub fn clamped(mut self) -> Self {
        self.rate = self.rate.clamp(0.8, 1.2);
        self.pause_scale = self.pause_scale.clamp(0.8, 1.3);
        self
    }

    /// Deterministic JSON form used inside cache keys.
    ///
    /// Field order is fixed and floats are rendered with three decimals so
    /// that equal profiles always hash identically.
    pub fn canonical_json(&self) -> String {
        format!(
            "{{\"acronym_mode\":\"{}\",\"number_mode\":\"{}\",\"pause_scale\":{:.3},\"quote_mode\":\"{}\",\"rate\":{:.3}}}",
            match self.acronym_mode {
                AcronymMode::Off => "off",
                AcronymMode::Spell => "spell",
            },
            match self.number_mode {
                NumberMode::Cardinal => "cardinal",
                NumberMode::Ordinal => "ordinal",
                NumberMode::Year => "year",
            },
            self.pause_scale,
            match self.quote_mode {
                QuoteMode::Normal => "normal",
                QuoteMode::Tight => "tight",
            },
            self.rate,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile() {
        let profile = ReadingProfile::default();
        assert_eq!(profile.rate, 1.0);
        assert_eq!(profile.pause_scale, 1.0);
        assert_eq!(profile.quote_mode, QuoteMode::Normal);
        assert_eq!(profile.acronym_mode, AcronymMode::Off);
        assert_eq!(profile.number_mode, NumberMode::Cardinal);
    }

    #[test]
    fn test_clamping() {
        let profile = ReadingProfile {
            rate: 2.0,
            pause_scale: 0.1,
            ..Default::default()
        }
        .clamped();
        assert_eq!(profile.rate, 1.2);
        assert_eq!(profile.pause_scale, 0.8);
    }

    #[test]
    fn test_canonical_json_is_stable() {
        let a = ReadingProfile::default().canonical_json();
        let b = ReadingProfile::default().canonical_json();
        assert_eq!(a, b);
        assert!(a.contains("\"rate\":1.000"));
        assert!(a.contains("\"quote_mode\":\"normal\""));
    }

    #[test]
    fn test_canonical_json_reflects_fields() {
        let profile = ReadingProfile {
            number_mode: NumberMode::Year,
            pause_scale: 1.25,
            ..Default::default()
        };
        let json = profile.canonical_json();
        assert!(json.contains("\"number_mode\":\"year\""));
        assert!(json.contains("\"pause_scale\":1.250"));
    }

    #[test]
    fn test_deserialize_partial() {
        let profile: ReadingProfile = serde_json::from_str("{\"rate\": 1.1}").unwrap();
        assert_eq!(profile.rate, 1.1);
        assert_eq!(profile.pause_scale, 1.0);
    }
}
