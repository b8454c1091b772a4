//! `odk`: options desk control plane CLI.
//!
//! Each subcommand is one pipeline stage (the external timer invokes `tick`);
//! everything else exists for operators poking at a single stage. All
//! environment reading happens here, at the process edge; the library
//! crates take explicit configs.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

use odk_broker::{Broker, BrokerMode, LiveConfig, PaperBroker};
use odk_gateway::{GateConfig, VerticalIntent};
use odk_journal::Journal;
use odk_oms::CloseConfig;
use odk_portfolio::{GreeksConfig, Side};
use odk_risk::{load_risk_policy, RiskLimits, RiskPolicy};
use odk_state::{RiskModeStore, StateDir};
use odk_tick::{DeriskLoopConfig, TickConfig};

#[derive(Parser)]
#[command(name = "odk")]
#[command(about = "Options desk risk governor + OMS", long_about = None)]
struct Cli {
    /// State directory (overrides STATE_DIR).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one full pipeline tick.
    Tick,

    /// Bounded de-risk re-entry loop (greeks → eval → plan → exec → close).
    DeriskLoop {
        #[arg(long)]
        max_rounds: Option<u32>,
    },

    /// Rebuild the positions book from the fills log.
    Book,

    /// Rebuild portfolio greeks.
    Greeks,

    /// Evaluate portfolio limits and rewrite the risk mode.
    RiskEval,

    /// Plan reduce-only closes against the buffered limit band.
    DeriskPlan,

    /// Convert the latest de-risk plan into a close intent.
    DeriskExec,

    /// Gate strategy intents into sized candidates.
    Gateway,

    /// Issue (or delete) the open intent from gate output.
    Open,

    /// Consume the open intent through the broker.
    OpenExec,

    /// Consume the close intent (reduce-only).
    Close,

    /// Poll tracked live orders.
    Poll,

    /// Work a resolved vertical through the leg-sequencing state machine.
    VerticalOpen {
        #[arg(long)]
        long_symbol: String,
        #[arg(long)]
        long_limit: f64,
        #[arg(long)]
        short_symbol: String,
        #[arg(long)]
        short_limit: f64,
        #[arg(long)]
        qty: i64,
        #[arg(long, default_value_t = 60)]
        max_seconds: u64,
    },

    /// Print the current risk mode.
    RiskMode,

    /// Append one fill to the positions ledger.
    RecordFill {
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        qty: i64,
        #[arg(long)]
        side: String,
        #[arg(long)]
        price: f64,
        #[arg(long, default_value = "MANUAL")]
        tag: String,
    },

    /// Size a resolved vertical against portfolio limits.
    Dealloc {
        #[arg(long)]
        long_symbol: String,
        #[arg(long)]
        short_symbol: String,
        #[arg(long)]
        qty: i64,
    },
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn env_i64(name: &str) -> Option<i64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn state_dir(cli: &Cli) -> StateDir {
    let root = cli
        .state_dir
        .clone()
        .or_else(|| std::env::var("STATE_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("state"));
    StateDir::new(root)
}

fn broker_mode_from_env() -> BrokerMode {
    let mode = std::env::var("BROKER_MODE").unwrap_or_default();
    match mode.trim().to_ascii_uppercase().as_str() {
        "LIVE" => BrokerMode::Live(LiveConfig {
            allow_live_orders: std::env::var("ALLOW_LIVE_ORDERS")
                .map(|v| v.trim() == "1")
                .unwrap_or(false),
            limit_price: env_f64("LIVE_LIMIT_PRICE"),
        }),
        _ => BrokerMode::PlanOnly,
    }
}

fn load_policy() -> Option<RiskPolicy> {
    let path = PathBuf::from("configs/risk_policy.yaml");
    if !path.exists() {
        return None;
    }
    match load_risk_policy(&path) {
        Ok(p) => Some(p),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "risk policy unreadable; using defaults");
            None
        }
    }
}

fn gate_config(policy: Option<&RiskPolicy>) -> GateConfig {
    let mut cfg = GateConfig::default();
    if let Some(p) = policy {
        cfg.equity_usd = p.account.equity_usd;
        cfg.max_defined_risk_pct = p.position_limits.per_trade.max_defined_risk_pct_equity;
    }
    if let Some(v) = env_f64("RISK_ACCOUNT_EQUITY") {
        cfg.equity_usd = v;
    }
    if let Some(v) = env_f64("RISK_MAX_DEFINED_RISK_PCT") {
        cfg.max_defined_risk_pct = v;
    }
    if let Some(v) = env_f64("GATE_MAX_UNDERLIER_SPREAD_PCT") {
        cfg.max_underlier_spread_pct = v;
    }
    cfg
}

fn greeks_config() -> GreeksConfig {
    let mut cfg = GreeksConfig::default();
    if let Some(v) = env_f64("RISK_FREE_RATE") {
        cfg.r = v;
    }
    cfg
}

fn limits(policy: Option<&RiskPolicy>) -> RiskLimits {
    policy.map(|p| p.portfolio_limits()).unwrap_or_default()
}

fn close_config() -> CloseConfig {
    let mut cfg = CloseConfig::default();
    if let Some(v) = env_i64("OMS_INTENT_MAX_AGE_SEC") {
        cfg.max_age_sec = v;
    }
    cfg
}

fn tick_config(policy: Option<&RiskPolicy>) -> TickConfig {
    TickConfig {
        greeks: greeks_config(),
        limits: limits(policy),
        buffer_pct: odk_risk::DEFAULT_BUFFER_PCT,
        max_contracts_to_close: odk_risk::DEFAULT_MAX_CONTRACTS_TO_CLOSE,
        gate: gate_config(policy),
        close: close_config(),
    }
}

/// Strategy intents: `configs/intents.yaml` when present, otherwise a fixed
/// demo pair so a fresh checkout produces a full pipeline run.
fn load_intents() -> Vec<(String, VerticalIntent)> {
    #[derive(serde::Deserialize)]
    struct IntentsFile {
        intents: BTreeMap<String, VerticalIntent>,
    }

    let path = PathBuf::from("configs/intents.yaml");
    if path.exists() {
        match std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_yaml::from_str::<IntentsFile>(&raw).map_err(Into::into))
        {
            Ok(f) => return f.intents.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "intents file unreadable; using demo intents");
            }
        }
    }

    let r = env_f64("RISK_FREE_RATE").unwrap_or(0.04);
    vec![
        (
            "demo1".to_string(),
            VerticalIntent {
                underlier: "QQQ".to_string(),
                is_call: true,
                k_long: 600.0,
                k_short: 610.0,
                dte_days: 30,
                qty_requested: 10,
                r,
                iv_long: 0.22,
                iv_short: 0.22,
                tag: "GATE_QQQ_600_610C".to_string(),
            },
        ),
        (
            "demo2".to_string(),
            VerticalIntent {
                underlier: "SPY".to_string(),
                is_call: true,
                k_long: 680.0,
                k_short: 690.0,
                dte_days: 30,
                qty_requested: 5,
                r,
                iv_long: 0.20,
                iv_short: 0.20,
                tag: "GATE_SPY_680_690C".to_string(),
            },
        ),
    ]
}

fn paper_broker() -> Broker<PaperBroker> {
    let today = odk_state::utc_now().date_naive();
    Broker::new(broker_mode_from_env(), PaperBroker::new(today))
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v).context("serialize output")?);
    Ok(())
}

fn main() -> Result<()> {
    // Dev-time .env bootstrap; absence is fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let dir = state_dir(&cli);
    let policy = load_policy();

    match cli.cmd {
        Commands::Tick => {
            let cfg = tick_config(policy.as_ref());
            let intents = load_intents();
            let broker = paper_broker();
            let state = odk_tick::run_tick(&dir, &cfg, &intents, &broker)?;
            print_json(&state)?;
        }

        Commands::DeriskLoop { max_rounds } => {
            let mut cfg = DeriskLoopConfig {
                greeks: greeks_config(),
                limits: limits(policy.as_ref()),
                close: close_config(),
                ..DeriskLoopConfig::default()
            };
            if let Some(n) = max_rounds {
                cfg.max_rounds = n;
            }
            let report = odk_tick::run_derisk_loop(&dir, &cfg)?;
            print_json(&report)?;
        }

        Commands::Book => {
            let book = odk_portfolio::rebuild_positions_book(&dir)?;
            print_json(&book)?;
        }

        Commands::Greeks => {
            let snap = odk_portfolio::build_portfolio_greeks(&dir, &greeks_config())?;
            print_json(&snap)?;
        }

        Commands::RiskEval => {
            let eval = odk_risk::evaluate_portfolio(&dir, &limits(policy.as_ref()))?;
            print_json(&eval)?;
        }

        Commands::DeriskPlan => {
            let plan = odk_risk::run_derisk_plan(
                &dir,
                &limits(policy.as_ref()),
                odk_risk::DEFAULT_BUFFER_PCT,
                odk_risk::DEFAULT_MAX_CONTRACTS_TO_CLOSE,
            )?;
            print_json(&plan)?;
        }

        Commands::DeriskExec => {
            let out = odk_risk::execute_derisk_plan(&dir)?;
            print_json(&out)?;
        }

        Commands::Gateway => {
            let out = odk_gateway::run_gateway(&dir, &load_intents(), &gate_config(policy.as_ref()))?;
            print_json(&out)?;
        }

        Commands::Open => {
            let st = odk_oms::run_open_issuer(&dir)?;
            print_json(&st)?;
        }

        Commands::OpenExec => {
            let journal = Journal::new(&dir);
            let broker = paper_broker();
            let st = odk_oms::run_open_exec(&dir, &journal, &broker)?;
            print_json(&st)?;
        }

        Commands::Close => {
            let journal = Journal::new(&dir);
            let st = odk_oms::run_close(&dir, &journal, &close_config())?;
            print_json(&st)?;
        }

        Commands::Poll => {
            let journal = Journal::new(&dir);
            let broker = paper_broker();
            let st = odk_oms::poll_once(&dir, &journal, broker.api(), broker.mode().as_str())?;
            print_json(&st)?;
        }

        Commands::VerticalOpen {
            long_symbol,
            long_limit,
            short_symbol,
            short_limit,
            qty,
            max_seconds,
        } => {
            let plan = odk_oms::VerticalPlan {
                long: odk_oms::LegOrder {
                    symbol: long_symbol,
                    qty,
                    limit: long_limit,
                },
                short: odk_oms::LegOrder {
                    symbol: short_symbol,
                    qty,
                    limit: short_limit,
                },
            };
            let cfg = odk_oms::VerticalConfig {
                plan_only: matches!(broker_mode_from_env(), BrokerMode::PlanOnly),
                max_seconds,
            };
            let snap = odk_oms::run_vertical_open(&dir, &plan, &cfg)?;
            print_json(&snap)?;
        }

        Commands::RiskMode => {
            let st = RiskModeStore::new(&dir).load_or_boot()?;
            print_json(&st)?;
        }

        Commands::RecordFill {
            symbol,
            qty,
            side,
            price,
            tag,
        } => {
            let side = match side.trim().to_ascii_uppercase().as_str() {
                "BUY" => Side::Buy,
                "SELL" => Side::Sell,
                other => anyhow::bail!("side must be BUY or SELL, got {other}"),
            };
            let fill = odk_portfolio::record_fill(&dir, &symbol, qty, side, price, &tag)?;
            print_json(&fill)?;
        }

        Commands::Dealloc {
            long_symbol,
            short_symbol,
            qty,
        } => {
            let plan =
                odk_risk::run_dealloc(&dir, &long_symbol, &short_symbol, qty, &limits(policy.as_ref()))?;
            print_json(&plan)?;
        }
    }

    Ok(())
}
