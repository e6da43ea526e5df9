//! Rule DSL parser.
//!
//! Recursive descent parser for the predicate grammar. Converts text to AST
//! with error messages carrying the character offset and the expected/found
//! tokens.
//!
//! A strategy step is a `;`-separated list of predicates, all of which must
//! hold for the step to pass; see [`parse_step`].

use crate::domain::error::ParseError;
use crate::domain::rule::{IndicatorRef, Operand, PositionField, Rule};

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some(ch) if ch == expected => {
                self.advance();
                Ok(())
            }
            Some(ch) => Err(ParseError {
                message: format!("expected '{}', found '{}'", expected, ch),
                position: self.pos,
            }),
            None => Err(ParseError {
                message: format!("expected '{}', found end of input", expected),
                position: self.pos,
            }),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        let remaining = self.remaining();
        remaining.starts_with(keyword)
            && !remaining[keyword.len()..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_')
    }

    fn consume_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParseError> {
        if self.consume_keyword(keyword) {
            Ok(())
        } else {
            let found = self.peek_word();
            Err(ParseError {
                message: format!("expected '{}', found '{}'", keyword, found),
                position: self.pos,
            })
        }
    }

    fn peek_word(&self) -> String {
        let word: String = self
            .remaining()
            .chars()
            .take_while(|ch| ch.is_alphanumeric() || *ch == '_')
            .collect();
        if word.is_empty() {
            self.peek()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "end of input".to_string())
        } else {
            word
        }
    }

    fn parse_number(&mut self) -> Result<f64, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        let mut has_dot = false;
        let mut digits = 0;

        if self.peek() == Some('-') {
            self.advance();
        }

        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                digits += 1;
                self.advance();
            } else if ch == '.' && !has_dot {
                has_dot = true;
                self.advance();
            } else {
                break;
            }
        }

        if digits == 0 {
            return Err(ParseError {
                message: "expected number".to_string(),
                position: start,
            });
        }

        let num_str = &self.input[start..self.pos];
        num_str.parse::<f64>().map_err(|_| ParseError {
            message: format!("invalid number: {}", num_str),
            position: start,
        })
    }

    /// Granularity or field name: letters, digits and underscores.
    fn parse_identifier(&mut self, what: &str) -> Result<String, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(ParseError {
                message: format!("expected {}, found '{}'", what, self.peek_word()),
                position: start,
            });
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_indicator_ref(&mut self) -> Result<IndicatorRef, ParseError> {
        self.expect_char('(')?;
        let granularity = self.parse_identifier("granularity")?;
        self.expect_char(',')?;
        let field = self.parse_identifier("indicator field")?;
        self.expect_char(')')?;
        Ok(IndicatorRef { granularity, field })
    }

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        self.skip_whitespace();

        if self
            .peek()
            .is_some_and(|ch| ch.is_ascii_digit() || ch == '-' || ch == '.')
        {
            let num = self.parse_number()?;
            return Ok(Operand::Constant(num));
        }

        if self.consume_keyword("IND") {
            return Ok(Operand::Indicator(self.parse_indicator_ref()?));
        }
        if self.consume_keyword("PREV") {
            return Ok(Operand::Previous(self.parse_indicator_ref()?));
        }
        if self.consume_keyword("SCALE") {
            self.expect_char('(')?;
            let operand = self.parse_operand()?;
            self.expect_char(',')?;
            let factor = self.parse_number()?;
            self.expect_char(')')?;
            return Ok(Operand::Scaled {
                operand: Box::new(operand),
                factor,
            });
        }
        if self.consume_keyword("price") {
            return Ok(Operand::Price);
        }

        let word = self.peek_word();
        if let Some(field) = PositionField::from_keyword(&word) {
            self.pos += word.len();
            return Ok(Operand::Position(field));
        }

        Err(ParseError {
            message: format!(
                "expected operand (number, price, IND, PREV, SCALE or position field), found '{}'",
                word
            ),
            position: self.pos,
        })
    }

    fn parse_comparison(&mut self, keyword: &str) -> Result<Rule, ParseError> {
        let start = self.pos;
        self.expect_keyword(keyword)?;
        self.expect_char('(')?;

        let left = self.parse_operand()?;
        self.expect_char(',')?;
        let right = self.parse_operand()?;
        self.expect_char(')')?;

        match keyword {
            "CROSS_ABOVE" => Ok(Rule::CrossAbove { left, right }),
            "CROSS_BELOW" => Ok(Rule::CrossBelow { left, right }),
            "ABOVE" => Ok(Rule::Above { left, right }),
            "BELOW" => Ok(Rule::Below { left, right }),
            "EQUALS" => Ok(Rule::Equals { left, right }),
            other => Err(ParseError {
                message: format!("unknown comparison '{}'", other),
                position: start,
            }),
        }
    }

    fn parse_between(&mut self) -> Result<Rule, ParseError> {
        self.expect_keyword("BETWEEN")?;
        self.expect_char('(')?;

        let operand = self.parse_operand()?;
        self.expect_char(',')?;
        let lower_pos = self.pos;
        let lower = self.parse_number()?;
        self.expect_char(',')?;
        let upper = self.parse_number()?;
        self.expect_char(')')?;

        if lower > upper {
            return Err(ParseError {
                message: format!("BETWEEN lower bound {} exceeds upper bound {}", lower, upper),
                position: lower_pos,
            });
        }

        Ok(Rule::Between {
            operand,
            lower,
            upper,
        })
    }

    fn parse_rule(&mut self) -> Result<Rule, ParseError> {
        self.skip_whitespace();

        for keyword in ["CROSS_ABOVE", "CROSS_BELOW", "ABOVE", "BELOW", "EQUALS"] {
            if self.peek_keyword(keyword) {
                return self.parse_comparison(keyword);
            }
        }
        if self.peek_keyword("BETWEEN") {
            return self.parse_between();
        }

        if self.peek_keyword("AND") {
            return self.parse_composite("AND").map(Rule::And);
        }
        if self.peek_keyword("OR") {
            return self.parse_composite("OR").map(Rule::Or);
        }
        if self.peek_keyword("NOT") {
            return self.parse_not();
        }

        if self.consume_keyword("TRUE") {
            return Ok(Rule::True);
        }
        if self.consume_keyword("FALSE") {
            return Ok(Rule::False);
        }

        let word = self.peek_word();
        Err(ParseError {
            message: format!("expected rule, found '{}'", word),
            position: self.pos,
        })
    }

    fn parse_composite(&mut self, keyword: &str) -> Result<Vec<Rule>, ParseError> {
        self.expect_keyword(keyword)?;
        self.expect_char('(')?;

        let mut rules = vec![self.parse_rule()?];

        loop {
            self.skip_whitespace();
            if self.peek() == Some(')') {
                self.advance();
                break;
            }
            self.expect_char(',')?;
            rules.push(self.parse_rule()?);
        }

        if rules.len() < 2 {
            return Err(ParseError {
                message: format!("{} requires at least 2 rules", keyword),
                position: self.pos,
            });
        }

        Ok(rules)
    }

    fn parse_not(&mut self) -> Result<Rule, ParseError> {
        self.expect_keyword("NOT")?;
        self.expect_char('(')?;
        let rule = self.parse_rule()?;
        self.expect_char(')')?;
        Ok(Rule::Not(Box::new(rule)))
    }

    fn parse(&mut self) -> Result<Rule, ParseError> {
        let rule = self.parse_rule()?;
        self.skip_whitespace();
        if self.pos < self.input.len() {
            return Err(ParseError {
                message: format!("unexpected input after rule: '{}'", self.remaining()),
                position: self.pos,
            });
        }
        Ok(rule)
    }
}

pub fn parse(input: &str) -> Result<Rule, ParseError> {
    let mut parser = Parser::new(input);
    parser.parse()
}

/// Parses a `;`-separated conjunction of predicates. Error positions are
/// offsets into the whole step text.
pub fn parse_step(input: &str) -> Result<Vec<Rule>, ParseError> {
    let mut rules = Vec::new();
    let mut offset = 0;
    for segment in input.split(';') {
        if !segment.trim().is_empty() {
            let rule = parse(segment).map_err(|err| ParseError {
                message: err.message,
                position: err.position + offset,
            })?;
            rules.push(rule);
        }
        offset += segment.len() + 1;
    }
    if rules.is_empty() {
        return Err(ParseError {
            message: "step has no predicates".to_string(),
            position: 0,
        });
    }
    Ok(rules)
}
