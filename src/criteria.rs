//! Boolean criteria over property values.
//!
//! A criteria string such as `age > 10 AND (city = 'New York' OR city LIKE 'Bos%')`
//! is tokenized, grouped into clauses and turned into a postfix instruction list
//! by the shunting-yard algorithm, where `AND` binds tighter than `OR` and both
//! associate to the left. Evaluation walks the instructions with a stack of
//! object id sets: every clause is one parameterized query, `AND` intersects
//! and `OR` unions.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use roaring::RoaringTreemap;
use rusqlite::types::Value as SqlValue;
use tracing::{debug, trace};

use crate::construct::{Database, Loaded, ObjectId, Selection, normalize_class, normalize_property};
use crate::datatype::{Family, Raw, Value, infer_literal};
use crate::error::{Result, TesseraError};
use crate::persist::text_value;

lazy_static! {
    static ref LEXEME: Regex = Regex::new(
        r#"^\s*(?:(?P<open>\()|(?P<close>\))|(?P<symbol>!=|<=|>=|=|<|>)|'(?P<single>[^']*)'|"(?P<double>[^"]*)"|(?P<word>[^\s()'"!=<>]+))"#
    )
    .unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Lexeme {
    Open,
    Close,
    Symbol(String),
    Quoted(String),
    Word(String),
}

fn lex(criteria: &str) -> Result<Vec<Lexeme>> {
    let mut lexemes = Vec::new();
    let mut rest = criteria;
    while !rest.trim_start().is_empty() {
        let captures = LEXEME.captures(rest).ok_or_else(|| {
            syntax(
                criteria,
                format!("unexpected input at '{}'", rest.trim_start()),
            )
        })?;
        let lexeme = if captures.name("open").is_some() {
            Lexeme::Open
        } else if captures.name("close").is_some() {
            Lexeme::Close
        } else if let Some(symbol) = captures.name("symbol") {
            Lexeme::Symbol(symbol.as_str().to_string())
        } else if let Some(quoted) = captures.name("single").or_else(|| captures.name("double")) {
            Lexeme::Quoted(quoted.as_str().to_string())
        } else if let Some(word) = captures.name("word") {
            Lexeme::Word(word.as_str().to_string())
        } else {
            return Err(syntax(criteria, "unrecognized token".to_string()));
        };
        lexemes.push(lexeme);
        rest = &rest[captures.get(0).map_or(rest.len(), |m| m.end())..];
    }
    Ok(lexemes)
}

fn syntax(criteria: &str, message: String) -> TesseraError {
    TesseraError::Syntax {
        criteria: criteria.to_string(),
        message,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Like,
    Range,
}
impl Operator {
    fn parse(token: &str) -> Option<Operator> {
        Some(match token.to_uppercase().as_str() {
            "=" => Operator::Equal,
            "!=" => Operator::NotEqual,
            "<" => Operator::Less,
            "<=" => Operator::LessOrEqual,
            ">" => Operator::Greater,
            ">=" => Operator::GreaterOrEqual,
            "LIKE" => Operator::Like,
            "RANGE" => Operator::Range,
            _ => return None,
        })
    }
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Equal => "=",
            Operator::NotEqual => "!=",
            Operator::Less => "<",
            Operator::LessOrEqual => "<=",
            Operator::Greater => ">",
            Operator::GreaterOrEqual => ">=",
            Operator::Like => "LIKE",
            Operator::Range => "RANGE",
        }
    }
    fn operands(&self) -> usize {
        match self {
            Operator::Range => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub property: String,
    pub operator: Operator,
    pub literals: Vec<String>,
}
impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.property, self.operator.symbol(), self.literals.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Clause(Clause),
    And,
    Or,
}
impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Instruction::Clause(clause) => write!(f, "{clause}"),
            Instruction::And => write!(f, "AND"),
            Instruction::Or => write!(f, "OR"),
        }
    }
}

#[derive(Debug)]
enum Term {
    Clause(Clause),
    And,
    Or,
    Open,
    Close,
}
impl Term {
    fn precedence(&self) -> Option<u8> {
        match self {
            Term::And => Some(2),
            Term::Or => Some(1),
            _ => None,
        }
    }
    fn into_instruction(self) -> Option<Instruction> {
        match self {
            Term::Clause(clause) => Some(Instruction::Clause(clause)),
            Term::And => Some(Instruction::And),
            Term::Or => Some(Instruction::Or),
            Term::Open | Term::Close => None,
        }
    }
}

fn group(criteria: &str, lexemes: Vec<Lexeme>) -> Result<Vec<Term>> {
    let mut terms = Vec::new();
    let mut lexemes = lexemes.into_iter();
    while let Some(lexeme) = lexemes.next() {
        let property = match lexeme {
            Lexeme::Open => {
                terms.push(Term::Open);
                continue;
            }
            Lexeme::Close => {
                terms.push(Term::Close);
                continue;
            }
            Lexeme::Word(word) if word.eq_ignore_ascii_case("and") => {
                terms.push(Term::And);
                continue;
            }
            Lexeme::Word(word) if word.eq_ignore_ascii_case("or") => {
                terms.push(Term::Or);
                continue;
            }
            Lexeme::Word(word) => word,
            Lexeme::Symbol(symbol) => {
                return Err(syntax(criteria, format!("operator {symbol} is missing a property")));
            }
            Lexeme::Quoted(text) => {
                return Err(syntax(criteria, format!("expected a property, found '{text}'")));
            }
        };
        let operator = match lexemes.next() {
            Some(Lexeme::Symbol(token)) | Some(Lexeme::Word(token)) => Operator::parse(&token)
                .ok_or_else(|| syntax(criteria, format!("unknown operator {token}")))?,
            _ => {
                return Err(syntax(criteria, format!("expected an operator after {property}")));
            }
        };
        let mut literals = Vec::with_capacity(operator.operands());
        for _ in 0..operator.operands() {
            match lexemes.next() {
                Some(Lexeme::Word(literal)) | Some(Lexeme::Quoted(literal)) => literals.push(literal),
                _ => {
                    return Err(syntax(
                        criteria,
                        format!("{property} {} is missing a value", operator.symbol()),
                    ));
                }
            }
        }
        terms.push(Term::Clause(Clause {
            property: normalize_property(&property),
            operator,
            literals,
        }));
    }
    Ok(terms)
}

fn to_postfix(criteria: &str, terms: Vec<Term>) -> Result<Vec<Instruction>> {
    let mut output = Vec::new();
    let mut stack: Vec<Term> = Vec::new();
    for term in terms {
        match term {
            Term::Clause(_) => output.extend(term.into_instruction()),
            Term::And | Term::Or => {
                let precedence = term.precedence();
                while stack
                    .last()
                    .is_some_and(|top| top.precedence().is_some() && top.precedence() >= precedence)
                {
                    output.extend(stack.pop().and_then(Term::into_instruction));
                }
                stack.push(term);
            }
            Term::Open => stack.push(term),
            Term::Close => loop {
                match stack.pop() {
                    Some(Term::Open) => break,
                    Some(operator) => output.extend(operator.into_instruction()),
                    None => return Err(syntax(criteria, "unbalanced ')'".to_string())),
                }
            },
        }
    }
    while let Some(term) = stack.pop() {
        match term {
            Term::Open => return Err(syntax(criteria, "unbalanced '('".to_string())),
            operator => output.extend(operator.into_instruction()),
        }
    }
    Ok(output)
}

fn validate(criteria: &str, postfix: &[Instruction]) -> Result<()> {
    if postfix.is_empty() {
        return Err(syntax(criteria, "no clauses".to_string()));
    }
    let mut depth = 0usize;
    for instruction in postfix {
        match instruction {
            Instruction::Clause(_) => depth += 1,
            Instruction::And | Instruction::Or => {
                if depth < 2 {
                    return Err(syntax(criteria, format!("{instruction} is missing an operand")));
                }
                depth -= 1;
            }
        }
    }
    if depth != 1 {
        return Err(syntax(criteria, "clauses must be joined by AND or OR".to_string()));
    }
    Ok(())
}

/// A compiled criteria string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criteria {
    source: String,
    postfix: Vec<Instruction>,
}
impl Criteria {
    pub fn compile(criteria: &str) -> Result<Criteria> {
        let terms = group(criteria, lex(criteria)?)?;
        let postfix = to_postfix(criteria, terms)?;
        validate(criteria, &postfix)?;
        trace!(criteria, instructions = postfix.len(), "compiled criteria");
        Ok(Criteria {
            source: criteria.to_string(),
            postfix,
        })
    }
    pub fn source(&self) -> &str {
        &self.source
    }
    pub fn postfix(&self) -> &[Instruction] {
        &self.postfix
    }
}
impl fmt::Display for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let rendered: Vec<String> = self.postfix.iter().map(Instruction::to_string).collect();
        write!(f, "{}", rendered.join(" | "))
    }
}

fn ordered_literal(criteria: &Criteria, literal: &str) -> Result<(Family, SqlValue)> {
    let value = infer_literal(&Raw::from(literal))?;
    let family = value.value_type().family();
    let bound = match value {
        Value::Integer(i) => SqlValue::Integer(i),
        Value::Float(f) => SqlValue::Real(f),
        other => text_value(other.canonical()),
    };
    if family == Family::Reference {
        return Err(syntax(criteria.source(), format!("{literal} cannot be ordered")));
    }
    Ok((family, bound))
}

fn family_filter(family: Family) -> String {
    let names: Vec<String> = family
        .type_names()
        .iter()
        .map(|name| format!("'{name}'"))
        .collect();
    format!("d.ValueType in ({})", names.join(", "))
}

impl Database {
    fn objects_meeting_clause(
        &self,
        class: &str,
        clause: &Clause,
        criteria: &Criteria,
    ) -> Result<RoaringTreemap> {
        let mut params = vec![text_value(class), text_value(clause.property.as_str())];
        let condition = match clause.operator {
            Operator::Equal | Operator::NotEqual => {
                let literal = infer_literal(&Raw::from(clause.literals[0].as_str()))?;
                params.push(text_value(literal.content_hash()));
                format!("d.ValueHash {} ?", clause.operator.symbol())
            }
            Operator::Like => {
                params.push(text_value(clause.literals[0].as_str()));
                "d.Value like ?".to_string()
            }
            Operator::Range => {
                let (low_family, low) = ordered_literal(criteria, &clause.literals[0])?;
                let (high_family, high) = ordered_literal(criteria, &clause.literals[1])?;
                if low_family != high_family {
                    return Err(syntax(
                        criteria.source(),
                        format!("the bounds of {clause} are of different types"),
                    ));
                }
                params.push(low);
                params.push(high);
                format!("{} and d.Value >= ? and d.Value <= ?", family_filter(low_family))
            }
            _ => {
                let (family, bound) = ordered_literal(criteria, &clause.literals[0])?;
                params.push(bound);
                format!("{} and d.Value {} ?", family_filter(family), clause.operator.symbol())
            }
        };
        let sql = format!(
            "select distinct d.Object_Identity from PropertyValue d \
             join Object o on o.Object_Identity = d.Object_Identity \
             where o.Class = ? and d.Property = ? and {condition}"
        );
        let rows = self.persistor()?.query(&sql, &params)?;
        let objects = rows
            .iter()
            .map(|row| row.object(0))
            .collect::<Result<RoaringTreemap>>()?;
        trace!(%clause, matches = objects.len(), "evaluated clause");
        Ok(objects)
    }

    /// Evaluates compiled criteria against the objects of a class.
    pub fn evaluate(&self, class: &str, criteria: &Criteria) -> Result<RoaringTreemap> {
        let class = normalize_class(class);
        let mut stack: Vec<RoaringTreemap> = Vec::new();
        for instruction in criteria.postfix() {
            match instruction {
                Instruction::Clause(clause) => {
                    stack.push(self.objects_meeting_clause(&class, clause, criteria)?)
                }
                Instruction::And | Instruction::Or => {
                    let (Some(right), Some(mut left)) = (stack.pop(), stack.pop()) else {
                        return Err(TesseraError::Invariant(format!(
                            "{instruction} without two operands in {}",
                            criteria.source()
                        )));
                    };
                    if *instruction == Instruction::And {
                        left &= right;
                    } else {
                        left |= right;
                    }
                    stack.push(left);
                }
            }
        }
        match (stack.pop(), stack.is_empty()) {
            (Some(objects), true) => Ok(objects),
            _ => Err(TesseraError::Invariant(format!(
                "criteria {} did not reduce to one result",
                criteria.source()
            ))),
        }
    }

    /// Objects of the class meeting the criteria, in ascending id order.
    pub fn objects_of_class_that_meet_criteria(
        &self,
        class: &str,
        criteria: &str,
    ) -> Result<Vec<ObjectId>> {
        let compiled = Criteria::compile(criteria)?;
        let objects: Vec<ObjectId> = self.evaluate(class, &compiled)?.iter().collect();
        debug!(class, criteria, count = objects.len(), "criteria evaluated");
        Ok(objects)
    }

    pub fn load_objects_of_class_that_meet_criteria(
        &self,
        class: &str,
        criteria: &str,
        selection: &Selection,
        bypass_cache: bool,
    ) -> Result<Vec<(ObjectId, Loaded)>> {
        self.objects_of_class_that_meet_criteria(class, criteria)?
            .into_iter()
            .map(|object| Ok((object, self.load(object, selection, bypass_cache)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(criteria: &str) -> Vec<String> {
        Criteria::compile(criteria)
            .expect("compiles")
            .postfix()
            .iter()
            .map(Instruction::to_string)
            .collect()
    }

    #[test]
    fn and_binds_tighter_than_or() {
        assert_eq!(
            rendered("a = 1 OR b = 2 AND c = 3"),
            vec!["a = 1", "b = 2", "c = 3", "AND", "OR"]
        );
        assert_eq!(
            rendered("a = 1 AND b = 2 OR c = 3"),
            vec!["a = 1", "b = 2", "AND", "c = 3", "OR"]
        );
    }

    #[test]
    fn parentheses_override_precedence() {
        assert_eq!(
            rendered("(a = 1 OR b = 2) and c = 3"),
            vec!["a = 1", "b = 2", "OR", "c = 3", "AND"]
        );
    }

    #[test]
    fn operators_need_no_spaces_and_quotes_keep_them() {
        assert_eq!(rendered("age>10"), vec!["age > 10"]);
        assert_eq!(rendered("City = \"New York\""), vec!["city = New York"]);
        assert_eq!(rendered("name like 'Jo%'"), vec!["name LIKE Jo%"]);
        assert_eq!(rendered("age range 10 30"), vec!["age RANGE 10 30"]);
    }

    #[test]
    fn malformed_criteria_are_rejected() {
        for bad in [
            "",
            "(a = 1",
            "a = 1)",
            "a = 1 AND",
            "AND a = 1",
            "a ~ 1",
            "a =",
            "a RANGE 1",
            "a = 1 b = 2",
            "a = 'open",
        ] {
            match Criteria::compile(bad) {
                Err(TesseraError::Syntax { criteria, .. }) => assert_eq!(criteria, bad),
                other => panic!("{bad:?} compiled to {other:?}"),
            }
        }
    }
}
