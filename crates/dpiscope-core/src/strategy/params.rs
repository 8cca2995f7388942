//! TLS fragment parameter parsing
//!
//! Plans reach the executor from different producers, so the same setting
//! may arrive as an int array, a delimited string or a mixed array, and the
//! preset under one of several keys. Everything lands in
//! [`TlsFragmentParams`] and resolves to one [`FragmentPreset`].

use super::StrategyParams;
use serde_json::Value;

/// Keys that may carry the preset name, in lookup order
const PRESET_KEYS: [&str; 5] = [
    "TlsFragmentPreset",
    "TlsFragmentPresetName",
    "Preset",
    "PresetName",
    "FragmentPreset",
];

/// Smallest fragment the engine emits
pub const MIN_FRAGMENT_SIZE: u32 = 4;
/// Most fragments in one list
pub const MAX_FRAGMENTS: usize = 4;
/// Fragment list when nothing usable was given
pub const DEFAULT_FRAGMENT_SIZES: [u32; 1] = [64];
/// Name of the preset synthesized from an explicit size list
pub const PLAN_PRESET_NAME: &str = "INTEL Plan";

/// Named fragment size list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPreset {
    /// Display name
    pub name: String,
    /// Fragment sizes in bytes
    pub sizes: Vec<u32>,
}

impl FragmentPreset {
    /// Built-in presets
    pub fn builtin() -> [Self; 3] {
        [
            Self::new("Standard", vec![64]),
            Self::new("Moderate", vec![96]),
            Self::new("Aggressive", vec![32, 32]),
        ]
    }

    fn new(name: &str, sizes: Vec<u32>) -> Self {
        Self {
            name: name.to_string(),
            sizes,
        }
    }

    /// Built-in preset by name or alias, case-insensitive
    pub fn by_name(name: &str) -> Option<Self> {
        let canonical = match name.trim().to_ascii_lowercase().as_str() {
            "standard" | "std" => "Standard",
            "moderate" | "medium" => "Moderate",
            "aggressive" | "agg" => "Aggressive",
            _ => return None,
        };
        Self::builtin().into_iter().find(|p| p.name == canonical)
    }

    /// Preset for an explicit size list: a built-in one when the sizes match,
    /// otherwise a synthesized plan preset
    pub fn for_sizes(sizes: &[u32]) -> Self {
        let sizes = normalize_sizes(sizes.iter().map(|s| i64::from(*s)));
        Self::builtin()
            .into_iter()
            .find(|p| p.sizes == sizes)
            .unwrap_or_else(|| Self {
                name: PLAN_PRESET_NAME.to_string(),
                sizes,
            })
    }
}

/// Keep positive sizes, floor them at [`MIN_FRAGMENT_SIZE`], cap the list at
/// [`MAX_FRAGMENTS`]; fall back to [`DEFAULT_FRAGMENT_SIZES`]
pub fn normalize_sizes(input: impl IntoIterator<Item = i64>) -> Vec<u32> {
    let sizes: Vec<u32> = input
        .into_iter()
        .filter(|v| *v > 0)
        .map(|v| u32::try_from(v).unwrap_or(u32::MAX).max(MIN_FRAGMENT_SIZE))
        .take(MAX_FRAGMENTS)
        .collect();
    if sizes.is_empty() {
        DEFAULT_FRAGMENT_SIZES.to_vec()
    } else {
        sizes
    }
}

/// Fragment settings recovered from a strategy's parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsFragmentParams {
    /// Requested preset name
    pub preset_name: Option<String>,
    /// Explicit sizes, already normalized
    pub sizes: Option<Vec<u32>>,
    /// Let the engine shrink fragments further on failure
    pub auto_adjust_aggressive: Option<bool>,
}

impl TlsFragmentParams {
    /// Parse; `None` when nothing recognizable is present
    pub fn parse(params: &StrategyParams) -> Option<Self> {
        let preset_name = PRESET_KEYS
            .iter()
            .find_map(|k| params.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let sizes = params
            .get("TlsFragmentSizes")
            .and_then(parse_sizes)
            .filter(|raw| raw.iter().any(|v| *v > 0))
            .map(normalize_sizes);

        let auto_adjust_aggressive = params.get("AutoAdjustAggressive").and_then(|v| match v {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.trim().to_ascii_lowercase().parse::<bool>().ok(),
            _ => None,
        });

        if preset_name.is_none() && sizes.is_none() && auto_adjust_aggressive.is_none() {
            return None;
        }
        Some(Self {
            preset_name,
            sizes,
            auto_adjust_aggressive,
        })
    }

    /// Preset to apply: an explicit size list wins, then a known preset name,
    /// then the default
    pub fn resolve_preset(&self) -> FragmentPreset {
        if let Some(sizes) = &self.sizes {
            return FragmentPreset::for_sizes(sizes);
        }
        self.preset_name
            .as_deref()
            .and_then(FragmentPreset::by_name)
            .unwrap_or_else(|| FragmentPreset::for_sizes(&DEFAULT_FRAGMENT_SIZES))
    }
}

fn parse_sizes(value: &Value) -> Option<Vec<i64>> {
    match value {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                })
                .collect(),
        ),
        Value::String(s) => Some(
            s.split([',', ';', '/', ' '])
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .filter_map(|p| p.parse().ok())
                .collect(),
        ),
        Value::Number(n) => n.as_i64().map(|v| vec![v]),
        _ => None,
    }
}
