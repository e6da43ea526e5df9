//! Multi-step signal state machine.
//!
//! A [`RuleSet`] holds four ordered step lists, one per [`Category`]. Each call
//! to [`evaluate`] advances the gated categories by at most one step and
//! reports the first category, in fixed order, that completed its last step.
//! Whenever anything fires all four counters go back to zero.

use std::fmt;

use crate::domain::order::Direction;
use crate::domain::rule::Rule;
use crate::domain::rule_eval::{EvalContext, evaluate_step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    LongEntry,
    LongExit,
    ShortEntry,
    ShortExit,
}

impl Category {
    /// Evaluation order; earlier categories win ties.
    pub const ALL: [Category; 4] = [
        Category::LongEntry,
        Category::LongExit,
        Category::ShortEntry,
        Category::ShortExit,
    ];

    pub fn direction(&self) -> Direction {
        match self {
            Category::LongEntry | Category::LongExit => Direction::Long,
            Category::ShortEntry | Category::ShortExit => Direction::Short,
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, Category::LongEntry | Category::ShortEntry)
    }

    pub fn entry(direction: Direction) -> Self {
        match direction {
            Direction::Long => Category::LongEntry,
            Direction::Short => Category::ShortEntry,
        }
    }

    pub fn exit(direction: Direction) -> Self {
        match direction {
            Direction::Long => Category::LongExit,
            Direction::Short => Category::ShortExit,
        }
    }

    /// Config section holding this category's steps.
    pub fn section(&self) -> &'static str {
        match self {
            Category::LongEntry => "long_entry",
            Category::LongExit => "long_exit",
            Category::ShortEntry => "short_entry",
            Category::ShortExit => "short_exit",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.section())
    }
}

/// Conjunction of predicates.
pub type Step = Vec<Rule>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    pub long_entry: Vec<Step>,
    pub long_exit: Vec<Step>,
    pub short_entry: Vec<Step>,
    pub short_exit: Vec<Step>,
}

impl RuleSet {
    pub fn steps(&self, category: Category) -> &[Step] {
        match category {
            Category::LongEntry => &self.long_entry,
            Category::LongExit => &self.long_exit,
            Category::ShortEntry => &self.short_entry,
            Category::ShortExit => &self.short_exit,
        }
    }

    pub fn set_steps(&mut self, category: Category, steps: Vec<Step>) {
        match category {
            Category::LongEntry => self.long_entry = steps,
            Category::LongExit => self.long_exit = steps,
            Category::ShortEntry => self.short_entry = steps,
            Category::ShortExit => self.short_exit = steps,
        }
    }

    pub fn is_empty(&self) -> bool {
        Category::ALL.iter().all(|c| self.steps(*c).is_empty())
    }

    pub fn trades(&self, direction: Direction) -> bool {
        !self.steps(Category::entry(direction)).is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalProgress {
    pub long_entry: usize,
    pub long_exit: usize,
    pub short_entry: usize,
    pub short_exit: usize,
}

impl SignalProgress {
    pub fn get(&self, category: Category) -> usize {
        match category {
            Category::LongEntry => self.long_entry,
            Category::LongExit => self.long_exit,
            Category::ShortEntry => self.short_entry,
            Category::ShortExit => self.short_exit,
        }
    }

    fn set(&mut self, category: Category, value: usize) {
        match category {
            Category::LongEntry => self.long_entry = value,
            Category::LongExit => self.long_exit = value,
            Category::ShortEntry => self.short_entry = value,
            Category::ShortExit => self.short_exit = value,
        }
    }

    pub fn reset(&mut self) {
        *self = SignalProgress::default();
    }

    pub fn is_reset(&self) -> bool {
        *self == SignalProgress::default()
    }
}

/// Advances the `gated` categories one step against `ctx`.
///
/// Returns the updated progress and the category that fired, if any. Only
/// gated categories move; a category whose counter already sits at the end of
/// its steps stays there until a reset.
pub fn evaluate(
    rule_set: &RuleSet,
    progress: &SignalProgress,
    ctx: &EvalContext<'_>,
    gated: &[Category],
) -> (SignalProgress, Option<Category>) {
    let mut next = *progress;
    let mut fired = None;

    for category in Category::ALL {
        if !gated.contains(&category) {
            continue;
        }
        let steps = rule_set.steps(category);
        let idx = next.get(category);
        let Some(step) = steps.get(idx) else {
            continue;
        };
        if evaluate_step(step, ctx) {
            next.set(category, idx + 1);
            if idx + 1 == steps.len() && fired.is_none() {
                fired = Some(category);
            }
        }
    }

    if fired.is_some() {
        next.reset();
    }
    (next, fired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rule_parser::parse;
    use crate::domain::snapshot::MarketSnapshot;
    use chrono::{NaiveDate, NaiveDateTime};

    fn ts(min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(1, min, 0)
            .unwrap()
    }

    fn tick(n: u32) -> MarketSnapshot {
        MarketSnapshot::new(ts(n), 1.0).with_indicator("5m", "tick", f64::from(n))
    }

    fn step(text: &str) -> Step {
        vec![parse(text).unwrap()]
    }

    const ENTRIES: [Category; 2] = [Category::LongEntry, Category::ShortEntry];

    #[test]
    fn two_step_entry_fires_only_after_both_steps() {
        let rules = RuleSet {
            long_entry: vec![
                step("EQUALS(IND(5m, tick), 3)"),
                step("EQUALS(IND(5m, tick), 7)"),
            ],
            ..RuleSet::default()
        };
        let mut progress = SignalProgress::default();
        for n in 1..=10 {
            let snap = tick(n);
            let ctx = EvalContext::new(&snap);
            let (next, fired) = evaluate(&rules, &progress, &ctx, &ENTRIES);
            match n {
                1 | 2 => {
                    assert_eq!(fired, None);
                    assert_eq!(next.long_entry, 0);
                }
                3..=6 => {
                    assert_eq!(fired, None, "tick {n}");
                    assert_eq!(next.long_entry, 1, "tick {n}");
                }
                7 => {
                    assert_eq!(fired, Some(Category::LongEntry));
                    assert!(next.is_reset());
                }
                _ => {
                    assert_eq!(fired, None);
                    assert_eq!(next.long_entry, 0);
                }
            }
            progress = next;
        }
    }

    #[test]
    fn step_only_advances_once_per_tick() {
        let rules = RuleSet {
            long_entry: vec![step("TRUE"), step("TRUE"), step("TRUE")],
            ..RuleSet::default()
        };
        let snap = tick(1);
        let ctx = EvalContext::new(&snap);
        let (p1, f1) = evaluate(&rules, &SignalProgress::default(), &ctx, &ENTRIES);
        assert_eq!((p1.long_entry, f1), (1, None));
        let (p2, f2) = evaluate(&rules, &p1, &ctx, &ENTRIES);
        assert_eq!((p2.long_entry, f2), (2, None));
        let (p3, f3) = evaluate(&rules, &p2, &ctx, &ENTRIES);
        assert_eq!(f3, Some(Category::LongEntry));
        assert!(p3.is_reset());
    }

    #[test]
    fn empty_category_never_fires() {
        let rules = RuleSet::default();
        let snap = tick(1);
        let ctx = EvalContext::new(&snap);
        let (next, fired) = evaluate(&rules, &SignalProgress::default(), &ctx, &Category::ALL);
        assert_eq!(fired, None);
        assert!(next.is_reset());
    }

    #[test]
    fn ungated_categories_do_not_advance() {
        let rules = RuleSet {
            long_entry: vec![step("TRUE"), step("TRUE")],
            long_exit: vec![step("TRUE"), step("TRUE")],
            ..RuleSet::default()
        };
        let snap = tick(1);
        let ctx = EvalContext::new(&snap);
        let (next, _) = evaluate(&rules, &SignalProgress::default(), &ctx, &[Category::LongExit]);
        assert_eq!(next.long_entry, 0);
        assert_eq!(next.long_exit, 1);
    }

    #[test]
    fn long_wins_when_both_entries_fire() {
        let rules = RuleSet {
            long_entry: vec![step("TRUE")],
            short_entry: vec![step("TRUE")],
            ..RuleSet::default()
        };
        let snap = tick(1);
        let ctx = EvalContext::new(&snap);
        let (next, fired) = evaluate(&rules, &SignalProgress::default(), &ctx, &ENTRIES);
        assert_eq!(fired, Some(Category::LongEntry));
        assert!(next.is_reset());
    }

    #[test]
    fn firing_resets_other_partial_progress() {
        let rules = RuleSet {
            long_entry: vec![step("FALSE"), step("TRUE")],
            short_entry: vec![step("TRUE"), step("TRUE")],
            ..RuleSet::default()
        };
        let snap = tick(1);
        let ctx = EvalContext::new(&snap);
        let progress = SignalProgress {
            short_entry: 1,
            ..SignalProgress::default()
        };
        let (next, fired) = evaluate(&rules, &progress, &ctx, &ENTRIES);
        assert_eq!(fired, Some(Category::ShortEntry));
        assert!(next.is_reset());
    }

    #[test]
    fn counter_past_end_is_inert() {
        let rules = RuleSet {
            long_entry: vec![step("TRUE")],
            ..RuleSet::default()
        };
        let snap = tick(1);
        let ctx = EvalContext::new(&snap);
        let progress = SignalProgress {
            long_entry: 5,
            ..SignalProgress::default()
        };
        let (next, fired) = evaluate(&rules, &progress, &ctx, &ENTRIES);
        assert_eq!(fired, None);
        assert_eq!(next.long_entry, 5);
    }

    #[test]
    fn failed_step_keeps_progress() {
        let rules = RuleSet {
            short_exit: vec![step("TRUE"), step("FALSE")],
            ..RuleSet::default()
        };
        let snap = tick(1);
        let ctx = EvalContext::new(&snap);
        let progress = SignalProgress {
            short_exit: 1,
            ..SignalProgress::default()
        };
        let (next, fired) = evaluate(&rules, &progress, &ctx, &[Category::ShortExit]);
        assert_eq!(fired, None);
        assert_eq!(next.short_exit, 1);
    }

    #[test]
    fn category_helpers() {
        assert_eq!(Category::entry(Direction::Short), Category::ShortEntry);
        assert_eq!(Category::exit(Direction::Long), Category::LongExit);
        assert_eq!(Category::ShortExit.direction(), Direction::Short);
        assert!(Category::LongEntry.is_entry());
        assert!(!Category::LongExit.is_entry());
        assert_eq!(Category::ShortEntry.to_string(), "short_entry");
    }

    #[test]
    fn rule_set_accessors() {
        let mut rules = RuleSet::default();
        assert!(rules.is_empty());
        rules.set_steps(Category::ShortEntry, vec![step("TRUE")]);
        assert!(!rules.is_empty());
        assert!(rules.trades(Direction::Short));
        assert!(!rules.trades(Direction::Long));
        assert_eq!(rules.steps(Category::ShortEntry).len(), 1);
    }
}
