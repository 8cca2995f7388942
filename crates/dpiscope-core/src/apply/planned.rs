//! Plan → target state

use super::record::BypassApplyStateSnapshot;
use crate::bypass::TlsBypassOptions;
use crate::progress::{emit, ProgressSink};
use crate::strategy::{BypassPlan, FragmentPreset, StrategyId, TlsFragmentParams};
use serde::Serialize;
use tracing::debug;

/// State an apply call aims for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedState {
    /// Rollback target
    pub before: BypassApplyStateSnapshot,
    /// Options to apply
    pub options: TlsBypassOptions,
    /// DoH after the apply
    pub doh_enabled: bool,
    /// DNS preset after the apply
    pub dns_preset: String,
    /// Fragment preset requested by the plan
    pub fragment_preset: Option<String>,
    /// Auto-adjust requested by the plan
    pub auto_adjust_aggressive: Option<bool>,
}

fn fragment_request(params: &TlsFragmentParams, progress: Option<&dyn ProgressSink>) -> Option<FragmentPreset> {
    if let Some(sizes) = &params.sizes {
        let preset = FragmentPreset::for_sizes(sizes);
        emit(
            progress,
            &format!("[APPLY] TlsFragment param: sizes={sizes:?} -> preset '{}'", preset.name),
        );
        return Some(preset);
    }
    let name = params.preset_name.as_deref()?;
    match FragmentPreset::by_name(name) {
        Some(preset) => {
            emit(progress, &format!("[APPLY] TlsFragment param: preset '{name}' -> '{}'", preset.name));
            Some(preset)
        }
        None => {
            emit(progress, &format!("[APPLY] TlsFragment param: preset '{name}' not recognized, ignored"));
            None
        }
    }
}

/// Options the plan asks for, layered over the current ones.
///
/// Techniques the plan does not mention keep their current setting. DoH is
/// only switched on when the plan carries `UseDoh`, never switched off.
pub fn build_planned_state(
    before: &BypassApplyStateSnapshot,
    plan: &BypassPlan,
    progress: Option<&dyn ProgressSink>,
) -> PlannedState {
    let mut options = before.options.clone();
    let mut doh_enabled = before.doh_enabled;
    let mut preset: Option<FragmentPreset> = None;
    let mut auto_adjust: Option<bool> = None;

    for strategy in &plan.strategies {
        match strategy.id {
            StrategyId::TlsFragment => {
                options.fragment_enabled = true;
                options.disorder_enabled = false;
                if let Some(params) = TlsFragmentParams::parse(&strategy.parameters) {
                    if let Some(p) = fragment_request(&params, progress) {
                        preset = Some(p);
                    }
                    if let Some(flag) = params.auto_adjust_aggressive {
                        emit(progress, &format!("[APPLY] TlsFragment param: autoAdjustAggressive={flag}"));
                        auto_adjust = Some(flag);
                    }
                }
            }
            StrategyId::AggressiveFragment => {
                options.fragment_enabled = true;
                options.disorder_enabled = false;
                preset = FragmentPreset::by_name("aggressive");
                auto_adjust = Some(true);
            }
            StrategyId::TlsDisorder => {
                options.disorder_enabled = true;
                options.fragment_enabled = false;
            }
            StrategyId::TlsFakeTtl => options.fake_enabled = true,
            StrategyId::DropRst => options.drop_rst_enabled = true,
            StrategyId::UseDoh => {
                doh_enabled = true;
                emit(progress, "[APPLY] UseDoh: plan asks for DoH (needs explicit consent)");
            }
            StrategyId::QuicObfuscation => {
                options.drop_udp_443 = true;
                options.drop_udp_443_global = false;
            }
            StrategyId::HttpHostTricks => {
                options.http_host_tricks_enabled = true;
                emit(progress, "[APPLY] HttpHostTricks: enabling HTTP Host tricks");
            }
            StrategyId::BadChecksum => {
                options.bad_checksum_enabled = true;
                emit(progress, "[APPLY] BadChecksum: enabling bad checksum (fake packets only)");
            }
            StrategyId::None => {
                debug!(strategy = %strategy.id, "strategy has no option mapping; skipped");
            }
        }
    }

    if plan.drop_udp_443 {
        options.drop_udp_443 = true;
        options.drop_udp_443_global = false;
        emit(progress, "[APPLY] Assist: QUIC -> TCP (DROP UDP/443)");
    }
    if plan.allow_no_sni {
        options.allow_no_sni = true;
        emit(progress, "[APPLY] Assist: allow ClientHellos without SNI");
    }

    if let Some(p) = &preset {
        options.fragment_sizes = p.sizes.clone();
        options.preset_name = p.name.clone();
    }
    match auto_adjust {
        Some(flag) => options.auto_adjust_aggressive = flag,
        None if preset.as_ref().is_some_and(|p| p.name == "Aggressive") => options.auto_adjust_aggressive = true,
        None => {}
    }

    PlannedState {
        before: before.clone(),
        options,
        doh_enabled,
        dns_preset: before.dns_preset.clone(),
        fragment_preset: preset.map(|p| p.name),
        auto_adjust_aggressive: auto_adjust,
    }
}
