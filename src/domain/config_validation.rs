//! Configuration validation and construction.
//!
//! Every value is checked before a run starts. The `build_*` functions turn
//! a validated [`ConfigPort`] into the domain types the harness needs.

use crate::domain::backtest::RunConfig;
use crate::domain::contract::ContractSpec;
use crate::domain::error::PerpError;
use crate::domain::ladder::{LadderConfig, LadderStrategy, RunOverrides};
use crate::domain::ledger::LedgerConfig;
use crate::domain::rule_parser;
use crate::domain::signal::{Category, RuleSet, Step};
use crate::domain::strategy::{RuleStrategy, Strategy};
use crate::ports::config_port::ConfigPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Rules,
    Ladder,
}

impl StrategyKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "rules" => Some(StrategyKind::Rules),
            "ladder" => Some(StrategyKind::Ladder),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Rules => "rules",
            StrategyKind::Ladder => "ladder",
        }
    }
}

/// A parsed strategy file.
#[derive(Debug, Clone)]
pub struct StrategyDefinition {
    pub name: String,
    pub kind: StrategyKind,
    pub rules: RuleSet,
    pub ladder: LadderConfig,
    /// Run settings the `[strategy]` section sets for the ladder.
    pub pinned: RunOverrides,
}

impl StrategyDefinition {
    /// Fresh strategy value for one session.
    pub fn instantiate(&self, run: &RunConfig) -> Box<dyn Strategy + Send> {
        match self.kind {
            StrategyKind::Rules => Box::new(RuleStrategy::new(
                self.name.clone(),
                self.rules.clone(),
                run.clone(),
            )),
            StrategyKind::Ladder => Box::new(LadderStrategy::new(
                self.name.clone(),
                self.ladder_config(run),
            )),
        }
    }

    /// Ladder settings for one run: the run's multiplier, leverage and loss
    /// thresholds unless the strategy file sets its own.
    pub fn ladder_config(&self, run: &RunConfig) -> LadderConfig {
        self.ladder.for_run(run, &self.pinned)
    }
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> PerpError {
    PerpError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn missing(section: &str, key: &str) -> PerpError {
    PerpError::ConfigMissing {
        section: section.to_string(),
        key: key.to_string(),
    }
}

/// Reads a finite float, rejecting present-but-unparseable values (and
/// `nan`/`inf`) instead of silently falling back to the default.
fn read_optional_double(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
) -> Result<Option<f64>, PerpError> {
    match config.get_string(section, key) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(invalid(section, key, format!("not a number: {raw}"))),
        },
    }
}

fn read_double(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: f64,
) -> Result<f64, PerpError> {
    Ok(read_optional_double(config, section, key)?.unwrap_or(default))
}

fn read_int(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: i64,
) -> Result<i64, PerpError> {
    match config.get_string(section, key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(section, key, format!("not an integer: {raw}"))),
    }
}

fn require_positive(section: &str, key: &str, value: f64) -> Result<f64, PerpError> {
    if value <= 0.0 {
        return Err(invalid(section, key, format!("{key} must be positive")));
    }
    Ok(value)
}

fn require_non_negative(section: &str, key: &str, value: f64) -> Result<f64, PerpError> {
    if value < 0.0 {
        return Err(invalid(section, key, format!("{key} must be non-negative")));
    }
    Ok(value)
}

pub fn validate_run_config(config: &dyn ConfigPort) -> Result<(), PerpError> {
    build_run_config(config)?;
    build_contract(config)?;
    build_ledger_config(config)?;
    Ok(())
}

pub fn validate_strategy_config(config: &dyn ConfigPort) -> Result<(), PerpError> {
    build_strategy(config).map(|_| ())
}

/// `[run]` section.
pub fn build_run_config(config: &dyn ConfigPort) -> Result<RunConfig, PerpError> {
    let defaults = RunConfig::default();
    let start_capital = require_positive(
        "run",
        "start_capital",
        read_double(config, "run", "start_capital", defaults.start_capital)?,
    )?;

    let steps = read_int(config, "run", "steps", i64::from(defaults.steps))?;
    if !(1..=i64::from(u32::MAX)).contains(&steps) {
        return Err(invalid("run", "steps", "steps must be at least 1"));
    }

    let multiplier = require_positive(
        "run",
        "multiplier",
        read_double(config, "run", "multiplier", defaults.multiplier)?,
    )?;
    let stop_loss_percent = require_non_negative(
        "run",
        "stop_loss_percent",
        read_double(config, "run", "stop_loss_percent", defaults.stop_loss_percent)?,
    )?;
    let lever_reduce_percent = require_non_negative(
        "run",
        "lever_reduce_percent",
        read_double(
            config,
            "run",
            "lever_reduce_percent",
            defaults.lever_reduce_percent,
        )?,
    )?;
    let leverage = read_double(config, "run", "leverage", defaults.leverage)?;
    if leverage < 1.0 {
        return Err(invalid("run", "leverage", "leverage must be at least 1"));
    }

    Ok(RunConfig {
        start_capital,
        steps: steps as u32,
        multiplier,
        stop_loss_percent,
        lever_reduce_percent,
        leverage,
        close_at_end: config.get_bool("run", "close_at_end", defaults.close_at_end),
    })
}

/// `[contract]` section: the symbol and its contract spec.
pub fn build_contract(config: &dyn ConfigPort) -> Result<(String, ContractSpec), PerpError> {
    let symbol = match config.get_string("contract", "symbol") {
        Some(s) if !s.trim().is_empty() => s.trim().to_string(),
        _ => return Err(missing("contract", "symbol")),
    };

    let mut spec = ContractSpec::linear(
        read_double(config, "contract", "min_size", 1.0)?,
        read_double(config, "contract", "size_step", 1.0)?,
        read_double(config, "contract", "max_leverage", 50.0)?,
        read_double(config, "contract", "fee_rate", 0.0005)?,
    );
    spec.contract_value = read_double(config, "contract", "contract_value", 1.0)?;
    spec.contract_multiplier = read_double(config, "contract", "contract_multiplier", 1.0)?;

    spec.validate().map_err(|e| invalid("contract", "spec", e.to_string()))?;
    Ok((symbol, spec))
}

/// `[ledger]` section: leverage-change safety factors.
pub fn build_ledger_config(config: &dyn ConfigPort) -> Result<LedgerConfig, PerpError> {
    let defaults = LedgerConfig::default();
    let ledger = LedgerConfig {
        margin_release_factor: read_double(
            config,
            "ledger",
            "margin_release_factor",
            defaults.margin_release_factor,
        )?,
        margin_topup_factor: read_double(
            config,
            "ledger",
            "margin_topup_factor",
            defaults.margin_topup_factor,
        )?,
    };
    ledger
        .validate()
        .map_err(|e| invalid("ledger", "safety factors", e.to_string()))?;
    Ok(ledger)
}

/// Steps of one category, ordered by their numeric suffix. Keys other than
/// `stepN` are rejected so a typo does not silently drop a step.
pub fn build_steps(config: &dyn ConfigPort, category: Category) -> Result<Vec<Step>, PerpError> {
    let section = category.section();
    let mut numbered = Vec::new();
    for key in config.keys(section) {
        let index = key
            .strip_prefix("step")
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|n| *n >= 1)
            .ok_or_else(|| invalid(section, &key, "expected step1..stepN"))?;
        numbered.push((index, key));
    }
    numbered.sort_by_key(|(index, _)| *index);

    let mut steps = Vec::with_capacity(numbered.len());
    for (_, key) in numbered {
        let text = config
            .get_string(section, &key)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| invalid(section, &key, "empty step"))?;
        steps.push(rule_parser::parse_step(&text)?);
    }
    Ok(steps)
}

pub fn build_rule_set(config: &dyn ConfigPort) -> Result<RuleSet, PerpError> {
    let mut rules = RuleSet::default();
    for category in Category::ALL {
        rules.set_steps(category, build_steps(config, category)?);
    }
    Ok(rules)
}

/// Ladder tuning keys from `[strategy]`, each overriding its default.
pub fn build_ladder_config(config: &dyn ConfigPort) -> Result<LadderConfig, PerpError> {
    let d = LadderConfig::default();
    let f = |key: &str, default: f64| read_double(config, "strategy", key, default);
    let ladder = LadderConfig {
        multiplier: f("multiplier", d.multiplier)?,
        initial_leverage: f("initial_leverage", d.initial_leverage)?,
        stop_loss_percent: f("stop_loss_percent", d.stop_loss_percent)?,
        lever_reduce_percent: f("lever_reduce_percent", d.lever_reduce_percent)?,
        min_reduce_leverage: f("min_reduce_leverage", d.min_reduce_leverage)?,
        buy_low_ratio: f("buy_low_ratio", d.buy_low_ratio)?,
        buy_high_pullback: f("buy_high_pullback", d.buy_high_pullback)?,
        buy_high_floor: f("buy_high_floor", d.buy_high_floor)?,
        buy_high_fraction: f("buy_high_fraction", d.buy_high_fraction)?,
        take_profit_percent: f("take_profit_percent", d.take_profit_percent)?,
        take_profit_ratio: f("take_profit_ratio", d.take_profit_ratio)?,
        take_profit_divisor: f("take_profit_divisor", d.take_profit_divisor)?,
        dca_ratio: f("dca_ratio", d.dca_ratio)?,
        dca_spacing_minutes: read_int(
            config,
            "strategy",
            "dca_spacing_minutes",
            d.dca_spacing_minutes,
        )?,
        dca_margin_fraction: f("dca_margin_fraction", d.dca_margin_fraction)?,
        ladder_ratio: f("ladder_ratio", d.ladder_ratio)?,
        ladder_step: f("ladder_step", d.ladder_step)?,
        ladder_max_leverage: f("ladder_max_leverage", d.ladder_max_leverage)?,
        ladder_spacing: f("ladder_spacing", d.ladder_spacing)?,
        top_up_divisor: f("top_up_divisor", d.top_up_divisor)?,
        deleverage_leverage: f("deleverage_leverage", d.deleverage_leverage)?,
        breakeven_ratio: f("breakeven_ratio", d.breakeven_ratio)?,
        scale_back_peak_ratio: f("scale_back_peak_ratio", d.scale_back_peak_ratio)?,
    };

    require_positive("strategy", "multiplier", ladder.multiplier)?;
    require_non_negative("strategy", "stop_loss_percent", ladder.stop_loss_percent)?;
    require_non_negative("strategy", "lever_reduce_percent", ladder.lever_reduce_percent)?;
    require_positive("strategy", "take_profit_divisor", ladder.take_profit_divisor)?;
    require_positive("strategy", "top_up_divisor", ladder.top_up_divisor)?;
    require_non_negative("strategy", "dca_spacing_minutes", ladder.dca_spacing_minutes as f64)?;
    for (key, value) in [
        ("initial_leverage", ladder.initial_leverage),
        ("min_reduce_leverage", ladder.min_reduce_leverage),
        ("ladder_max_leverage", ladder.ladder_max_leverage),
    ] {
        if value < 1.0 {
            return Err(invalid("strategy", key, format!("{key} must be at least 1")));
        }
    }
    Ok(ladder)
}

/// The run-level keys present in `[strategy]`. Values are checked by
/// [`build_ladder_config`].
pub fn build_run_overrides(config: &dyn ConfigPort) -> Result<RunOverrides, PerpError> {
    let f = |key: &str| read_optional_double(config, "strategy", key);
    Ok(RunOverrides {
        multiplier: f("multiplier")?,
        initial_leverage: f("initial_leverage")?,
        stop_loss_percent: f("stop_loss_percent")?,
        lever_reduce_percent: f("lever_reduce_percent")?,
    })
}

/// `[strategy]` plus the four step sections.
pub fn build_strategy(config: &dyn ConfigPort) -> Result<StrategyDefinition, PerpError> {
    let name = config
        .get_string("strategy", "name")
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| missing("strategy", "name"))?;

    let kind = match config.get_string("strategy", "kind") {
        None => StrategyKind::Rules,
        Some(raw) => StrategyKind::parse(&raw)
            .ok_or_else(|| invalid("strategy", "kind", format!("unknown kind {raw}")))?,
    };

    let rules = build_rule_set(config)?;
    let ladder = build_ladder_config(config)?;
    let pinned = build_run_overrides(config)?;

    if kind == StrategyKind::Rules && rules.long_entry.is_empty() && rules.short_entry.is_empty()
    {
        return Err(PerpError::RuleInvalid {
            reason: "rules strategy needs [long_entry] or [short_entry] steps".to_string(),
        });
    }

    Ok(StrategyDefinition {
        name: name.trim().to_string(),
        kind,
        rules,
        ladder,
        pinned,
    })
}
