//! OPEN intent issuer.
//!
//! Safety invariant, enforced unconditionally: if the risk mode forbids new
//! risk at the instant this stage runs, any existing `open_intent.json` is
//! deleted before any other work. A stale open must never survive a
//! downgrade.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use odk_gateway::{GateCandidate, GateDecision, GateOut, OrderPlan};
use odk_state::{
    utc_now, RiskMode, RiskModeState, RiskModeStore, StateDir, GATE_OUT, OMS_OPEN_STATE,
    OPEN_INTENT, OPEN_PLAN,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpenIssuerState {
    OpenBlocked,
    NoCandidate,
    CandidateBlocked,
    Done,
}

/// The `open_intent.json` record, consumed exactly once by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenIntent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub mode: String,
    pub candidate: String,
    pub risk_mode: RiskModeState,
    pub order_plan: OrderPlan,
    pub decision: GateDecision,
}

pub const OPEN_INTENT_KIND: &str = "OPEN_INTENT";

/// Audit snapshot of what the issuer saw (`open_plan.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenPlanSnapshot {
    ts: DateTime<Utc>,
    source: String,
    candidate: Option<String>,
    risk_mode: RiskModeState,
    selected: Option<GateCandidate>,
}

/// The `oms_open_state.json` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmsOpenState {
    pub ts: DateTime<Utc>,
    pub mode: String,
    pub risk_mode: RiskMode,
    pub state: OpenIssuerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_reasons: Option<Vec<String>>,
    pub deleted_stale_intent: bool,
    pub open_intent_written: bool,
}

/// Candidate rank: allowed first, then sizing headroom, penalized per
/// refusal reason.
pub fn candidate_score(c: &GateCandidate) -> f64 {
    let allow_bit = if c.allow { 1.0 } else { 0.0 };
    allow_bit * 1000.0 + c.decision.max_contracts as f64 * 10.0
        - c.decision.reasons.len() as f64 * 50.0
}

fn select_best(out: &GateOut) -> Option<(String, GateCandidate)> {
    out.out
        .iter()
        .max_by(|a, b| {
            candidate_score(a.1)
                .partial_cmp(&candidate_score(b.1))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
}

/// Run the issuer once.
pub fn run_open_issuer(dir: &StateDir) -> Result<OmsOpenState> {
    let rm = RiskModeStore::new(dir).load();

    let gate: Option<GateOut> = dir.read_json(GATE_OUT)?;
    let best = gate.as_ref().and_then(select_best);

    dir.write_json_atomic(
        OPEN_PLAN,
        &OpenPlanSnapshot {
            ts: utc_now(),
            source: "gateway".to_string(),
            candidate: best.as_ref().map(|(k, _)| k.clone()),
            risk_mode: rm.clone(),
            selected: best.as_ref().map(|(_, v)| v.clone()),
        },
    )?;

    let mut state = OmsOpenState {
        ts: utc_now(),
        mode: "PLAN_ONLY".to_string(),
        risk_mode: rm.mode,
        state: OpenIssuerState::Done,
        reason: None,
        candidate: best.as_ref().map(|(k, _)| k.clone()),
        candidate_reasons: None,
        deleted_stale_intent: false,
        open_intent_written: false,
    };

    // Safety invariant: a non-NORMAL mode deletes the stale intent first.
    if !rm.mode.allow_open() {
        state.deleted_stale_intent = dir.delete(OPEN_INTENT)?;
        state.state = OpenIssuerState::OpenBlocked;
        state.reason = Some(format!("RISK_MODE_{}_OPEN_BLOCKED:{}", rm.mode, rm.reason));
        dir.write_json_atomic(OMS_OPEN_STATE, &state)?;
        tracing::warn!(mode = %rm.mode, deleted = state.deleted_stale_intent, "open blocked by risk mode");
        return Ok(state);
    }

    let Some((cand_name, cand)) = best else {
        state.deleted_stale_intent = dir.delete(OPEN_INTENT)?;
        state.state = OpenIssuerState::NoCandidate;
        state.reason = Some("NO_GATE_CANDIDATE".to_string());
        dir.write_json_atomic(OMS_OPEN_STATE, &state)?;
        return Ok(state);
    };

    if !cand.allow {
        state.deleted_stale_intent = dir.delete(OPEN_INTENT)?;
        state.state = OpenIssuerState::CandidateBlocked;
        state.reason = Some("CANDIDATE_NOT_ALLOWED".to_string());
        state.candidate_reasons = Some(cand.decision.reasons.clone());
        dir.write_json_atomic(OMS_OPEN_STATE, &state)?;
        return Ok(state);
    }

    let Some(order_plan) = cand.order_plan else {
        // An allowed candidate without a plan is a malformed gate output.
        state.deleted_stale_intent = dir.delete(OPEN_INTENT)?;
        state.state = OpenIssuerState::CandidateBlocked;
        state.reason = Some("CANDIDATE_MISSING_ORDER_PLAN".to_string());
        dir.write_json_atomic(OMS_OPEN_STATE, &state)?;
        return Ok(state);
    };

    let intent = OpenIntent {
        ts: utc_now(),
        kind: OPEN_INTENT_KIND.to_string(),
        mode: "PLAN_ONLY".to_string(),
        candidate: cand_name,
        risk_mode: rm,
        order_plan,
        decision: cand.decision,
    };
    dir.write_json_atomic(OPEN_INTENT, &intent)?;

    state.open_intent_written = true;
    dir.write_json_atomic(OMS_OPEN_STATE, &state)?;
    tracing::info!(candidate = ?state.candidate, "open intent written");
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn candidate(allow: bool, max_contracts: i64, n_reasons: usize) -> GateCandidate {
        GateCandidate {
            allow,
            order_plan: allow.then(|| OrderPlan {
                kind: "VERTICAL".to_string(),
                underlier: "QQQ".to_string(),
                is_call: true,
                k_long: 600.0,
                k_short: 610.0,
                dte_days: 30,
                qty: max_contracts,
                limit_logic: "MID_THEN_STEP".to_string(),
                tag: "t".to_string(),
                spot_used: Some(601.0),
                spot_src: Some("TRADE".to_string()),
            }),
            decision: GateDecision {
                allow,
                max_contracts,
                reasons: vec!["R".to_string(); n_reasons],
                worst_pnl_gap10: Some(-400.0),
                worst_pnl_combo: Some(-240.0),
            },
        }
    }

    fn write_gate(dir: &StateDir, cands: Vec<(&str, GateCandidate)>) {
        let mut out = BTreeMap::new();
        for (k, v) in cands {
            out.insert(k.to_string(), v);
        }
        dir.write_json_atomic(GATE_OUT, &GateOut { ts: utc_now(), out }).unwrap();
    }

    fn dir() -> (tempfile::TempDir, StateDir) {
        let td = tempfile::tempdir().unwrap();
        let sd = StateDir::new(td.path());
        (td, sd)
    }

    #[test]
    fn score_prefers_allowed_then_headroom_then_fewer_reasons() {
        let a = candidate(true, 3, 0);
        let b = candidate(false, 50, 0);
        assert!(candidate_score(&a) > candidate_score(&b));

        let c = candidate(true, 5, 0);
        let d = candidate(true, 5, 2);
        assert!(candidate_score(&c) > candidate_score(&d));
    }

    #[test]
    fn normal_mode_with_allowed_candidate_issues_intent() {
        let (_td, sd) = dir();
        RiskModeStore::new(&sd).set(RiskMode::Normal, "OK").unwrap();
        write_gate(&sd, vec![("demo1", candidate(true, 3, 0)), ("demo2", candidate(false, 0, 1))]);

        let st = run_open_issuer(&sd).unwrap();
        assert_eq!(st.state, OpenIssuerState::Done);
        assert!(st.open_intent_written);
        assert_eq!(st.candidate.as_deref(), Some("demo1"));

        let intent: OpenIntent = sd.read_json(OPEN_INTENT).unwrap().unwrap();
        assert_eq!(intent.kind, OPEN_INTENT_KIND);
        assert_eq!(intent.order_plan.qty, 3);
    }

    #[test]
    fn non_normal_mode_deletes_stale_intent_first() {
        let (_td, sd) = dir();
        RiskModeStore::new(&sd).set(RiskMode::Normal, "OK").unwrap();
        write_gate(&sd, vec![("demo1", candidate(true, 3, 0))]);
        run_open_issuer(&sd).unwrap();
        assert!(sd.exists(OPEN_INTENT));

        RiskModeStore::new(&sd).set(RiskMode::Halt, "DELTA_LIMIT 250.00 > 200.0").unwrap();
        let st = run_open_issuer(&sd).unwrap();
        assert_eq!(st.state, OpenIssuerState::OpenBlocked);
        assert!(st.deleted_stale_intent);
        assert!(!sd.exists(OPEN_INTENT));
        assert!(st.reason.unwrap().starts_with("RISK_MODE_HALT_OPEN_BLOCKED:"));
    }

    #[test]
    fn degraded_mode_blocks_opens() {
        let (_td, sd) = dir();
        RiskModeStore::new(&sd).set(RiskMode::Degraded, "IV_FALLBACK_DEFAULT_PRESENT").unwrap();
        write_gate(&sd, vec![("demo1", candidate(true, 3, 0))]);

        let st = run_open_issuer(&sd).unwrap();
        assert_eq!(st.state, OpenIssuerState::OpenBlocked);
        assert!(!sd.exists(OPEN_INTENT));
    }

    #[test]
    fn missing_mode_file_is_treated_as_blocked() {
        let (_td, sd) = dir();
        write_gate(&sd, vec![("demo1", candidate(true, 3, 0))]);
        let st = run_open_issuer(&sd).unwrap();
        assert_eq!(st.state, OpenIssuerState::OpenBlocked);
        assert_eq!(st.risk_mode, RiskMode::Unknown);
    }

    #[test]
    fn no_gate_output_is_no_candidate() {
        let (_td, sd) = dir();
        RiskModeStore::new(&sd).set(RiskMode::Normal, "OK").unwrap();
        let st = run_open_issuer(&sd).unwrap();
        assert_eq!(st.state, OpenIssuerState::NoCandidate);
        assert!(!st.open_intent_written);
    }

    #[test]
    fn blocked_winner_reports_candidate_reasons() {
        let (_td, sd) = dir();
        RiskModeStore::new(&sd).set(RiskMode::Normal, "OK").unwrap();
        write_gate(&sd, vec![("demo1", candidate(false, 0, 1))]);

        let st = run_open_issuer(&sd).unwrap();
        assert_eq!(st.state, OpenIssuerState::CandidateBlocked);
        assert_eq!(st.candidate_reasons.unwrap().len(), 1);
        assert!(!sd.exists(OPEN_INTENT));
    }
}
