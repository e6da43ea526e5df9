//! Rule AST for entry/exit predicates.
//!
//! - `Operand`: a numeric value resolved against the current snapshot, the
//!   previous snapshot, or the open position
//! - `IndicatorRef`: a (granularity, field) pair into the snapshot's indicators
//! - `PositionField`: a mark-to-market figure of the open position
//! - `Rule`: comparisons, boolean combinators and constants

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Constant(f64),
    Price,
    Indicator(IndicatorRef),
    /// Indicator value on the previous snapshot.
    Previous(IndicatorRef),
    Position(PositionField),
    /// `operand × factor × run multiplier`.
    Scaled { operand: Box<Operand>, factor: f64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndicatorRef {
    pub granularity: String,
    pub field: String,
}

impl IndicatorRef {
    pub fn new(granularity: impl Into<String>, field: impl Into<String>) -> Self {
        IndicatorRef {
            granularity: granularity.into(),
            field: field.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PositionField {
    PnlPercent,
    PnlUsd,
    HoldMinutes,
    Leverage,
    AvgEntry,
    Highest,
    Lowest,
    Margin,
}

impl PositionField {
    pub fn keyword(&self) -> &'static str {
        match self {
            PositionField::PnlPercent => "pnl_pct",
            PositionField::PnlUsd => "pnl_usd",
            PositionField::HoldMinutes => "hold_minutes",
            PositionField::Leverage => "leverage",
            PositionField::AvgEntry => "avg_entry",
            PositionField::Highest => "highest",
            PositionField::Lowest => "lowest",
            PositionField::Margin => "margin",
        }
    }

    pub fn from_keyword(word: &str) -> Option<Self> {
        const ALL: [PositionField; 8] = [
            PositionField::PnlPercent,
            PositionField::PnlUsd,
            PositionField::HoldMinutes,
            PositionField::Leverage,
            PositionField::AvgEntry,
            PositionField::Highest,
            PositionField::Lowest,
            PositionField::Margin,
        ];
        ALL.into_iter().find(|f| f.keyword() == word)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    CrossAbove {
        left: Operand,
        right: Operand,
    },
    CrossBelow {
        left: Operand,
        right: Operand,
    },
    Above {
        left: Operand,
        right: Operand,
    },
    Below {
        left: Operand,
        right: Operand,
    },
    Between {
        operand: Operand,
        lower: f64,
        upper: f64,
    },
    Equals {
        left: Operand,
        right: Operand,
    },
    And(Vec<Rule>),
    Or(Vec<Rule>),
    Not(Box<Rule>),
    True,
    False,
}

impl Rule {
    /// Whether any operand in the rule reads from the open position.
    pub fn references_position(&self) -> bool {
        fn operand_refs(op: &Operand) -> bool {
            match op {
                Operand::Position(_) => true,
                Operand::Scaled { operand, .. } => operand_refs(operand),
                _ => false,
            }
        }
        match self {
            Rule::CrossAbove { left, right }
            | Rule::CrossBelow { left, right }
            | Rule::Above { left, right }
            | Rule::Below { left, right }
            | Rule::Equals { left, right } => operand_refs(left) || operand_refs(right),
            Rule::Between { operand, .. } => operand_refs(operand),
            Rule::And(rules) | Rule::Or(rules) => rules.iter().any(Rule::references_position),
            Rule::Not(rule) => rule.references_position(),
            Rule::True | Rule::False => false,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Constant(v) => write!(f, "{v}"),
            Operand::Price => f.write_str("price"),
            Operand::Indicator(ind) => write!(f, "IND({}, {})", ind.granularity, ind.field),
            Operand::Previous(ind) => write!(f, "PREV({}, {})", ind.granularity, ind.field),
            Operand::Position(field) => f.write_str(field.keyword()),
            Operand::Scaled { operand, factor } => write!(f, "SCALE({operand}, {factor})"),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, name: &str, rules: &[Rule]) -> fmt::Result {
            write!(f, "{name}(")?;
            for (i, rule) in rules.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{rule}")?;
            }
            f.write_str(")")
        }
        match self {
            Rule::CrossAbove { left, right } => write!(f, "CROSS_ABOVE({left}, {right})"),
            Rule::CrossBelow { left, right } => write!(f, "CROSS_BELOW({left}, {right})"),
            Rule::Above { left, right } => write!(f, "ABOVE({left}, {right})"),
            Rule::Below { left, right } => write!(f, "BELOW({left}, {right})"),
            Rule::Equals { left, right } => write!(f, "EQUALS({left}, {right})"),
            Rule::Between {
                operand,
                lower,
                upper,
            } => write!(f, "BETWEEN({operand}, {lower}, {upper})"),
            Rule::And(rules) => join(f, "AND", rules),
            Rule::Or(rules) => join(f, "OR", rules),
            Rule::Not(rule) => write!(f, "NOT({rule})"),
            Rule::True => f.write_str("TRUE"),
            Rule::False => f.write_str("FALSE"),
        }
    }
}
