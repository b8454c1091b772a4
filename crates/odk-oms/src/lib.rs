//! Order-management: intent issuance and consumption.
//!
//! Four planes, each single-shot and file-fenced:
//!
//! - **OPEN** issues `open_intent.json` from gate output, never while the
//!   risk mode forbids new risk (a forbidden mode *deletes* any stale intent
//!   before doing anything else).
//! - **OPEN_EXEC** consumes the intent through the broker seam; the intent
//!   file is deleted only after a success event is journaled.
//! - **CLOSE** consumes `close_intent.json` under a process-wide lock with
//!   reduce-only validation; it is the sole writer of the positions book.
//! - **POLL** tracks live orders to terminal status, with deduplicated
//!   severity alerts.

mod close;
mod open;
mod open_exec;
mod poll;
mod store;
mod vertical;

pub use close::{
    normalize_actions, run_close, validate_reduce_only, CloseConfig, CloseState, CloseStep,
    OmsCloseState, DEFAULT_INTENT_MAX_AGE_SEC,
};
pub use open::{candidate_score, run_open_issuer, OmsOpenState, OpenIntent, OpenIssuerState};
pub use open_exec::{run_open_exec, OmsOpenExecState, OpenExecState};
pub use poll::{norm_status, poll_once, severity_for, PollChange, PollOutcome, PollState, Severity};
pub use store::{is_active_status, load_open_orders, save_open_orders, OpenOrdersStore, TrackedOrder};
pub use vertical::{
    run_vertical_open, LegOrder, VerticalConfig, VerticalPlan, VerticalSnapshot, VerticalState,
};
