use std::{collections::HashMap, fs, path::Path};

use tracing::warn;

use crate::error::{AuditError, Result};
use crate::identity::AuthContext;

const MAX_RULE_DEPTH: usize = 16;

/// A compiled declarative rule set mapping action identifiers
/// (`event:list`, `event:show`) to boolean expressions over the
/// authorization context. Evaluation is stateless and synchronous.
///
/// Expression syntax: `role:NAME`, `rule:NAME`, `KEY:VALUE` (where VALUE
/// may be a literal, a quoted literal, or `%(key)s` referring to another
/// auth key), the constants `@` (always true) and `!` (always false),
/// combined with `and`, `or`, `not` and parentheses.
#[derive(Debug, Default)]
pub struct Policy {
    rules: HashMap<String, RuleExpr>,
}

impl Policy {
    /// Loads a JSON rule file of `{"action": "expression", ...}`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            AuditError::Config(format!("cannot read policy file {}: {err}", path.display()))
        })?;
        let raw: HashMap<String, String> = serde_json::from_str(&contents).map_err(|err| {
            AuditError::Config(format!("cannot parse policy file {}: {err}", path.display()))
        })?;
        Self::from_rules(raw)
    }

    pub fn from_rules(raw: HashMap<String, String>) -> Result<Self> {
        let mut rules = HashMap::with_capacity(raw.len());
        for (action, expression) in raw {
            let parsed = parse_rule(&expression).map_err(|err| {
                AuditError::Config(format!("invalid policy rule '{action}': {err}"))
            })?;
            rules.insert(action, parsed);
        }
        Ok(Self { rules })
    }

    /// A rule set that admits any authenticated context for the read
    /// endpoints. Used when no policy file is configured.
    pub fn permissive() -> Self {
        let mut rules = HashMap::new();
        rules.insert("event:list".to_string(), RuleExpr::True);
        rules.insert("event:show".to_string(), RuleExpr::True);
        Self { rules }
    }

    /// Evaluates the rule for `action`. A missing action falls back to the
    /// `default` rule when one is defined, otherwise denies.
    pub fn enforce(&self, action: &str, context: &AuthContext) -> bool {
        let rule = self.rules.get(action).or_else(|| self.rules.get("default"));
        match rule {
            Some(expr) => expr.eval(context, &self.rules, 0),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RuleExpr {
    True,
    False,
    Not(Box<RuleExpr>),
    All(Vec<RuleExpr>),
    Any(Vec<RuleExpr>),
    Role(String),
    Rule(String),
    Match { key: String, value: MatchValue },
}

#[derive(Debug, Clone, PartialEq)]
enum MatchValue {
    Literal(String),
    AuthRef(String),
}

impl RuleExpr {
    fn eval(&self, context: &AuthContext, rules: &HashMap<String, RuleExpr>, depth: usize) -> bool {
        if depth > MAX_RULE_DEPTH {
            warn!("policy rule nesting exceeds {MAX_RULE_DEPTH} levels, denying");
            return false;
        }
        match self {
            Self::True => true,
            Self::False => false,
            Self::Not(inner) => !inner.eval(context, rules, depth + 1),
            Self::All(parts) => parts.iter().all(|part| part.eval(context, rules, depth + 1)),
            Self::Any(parts) => parts.iter().any(|part| part.eval(context, rules, depth + 1)),
            Self::Role(role) => context.roles.iter().any(|held| held == role),
            Self::Rule(name) => match rules.get(name) {
                Some(inner) => inner.eval(context, rules, depth + 1),
                None => false,
            },
            Self::Match { key, value } => {
                let Some(actual) = context.auth.get(key) else {
                    return false;
                };
                match value {
                    MatchValue::Literal(expected) => actual == expected,
                    MatchValue::AuthRef(reference) => {
                        context.auth.get(reference) == Some(actual)
                    }
                }
            }
        }
    }
}

fn parse_rule(input: &str) -> std::result::Result<RuleExpr, String> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        // An empty expression always matches.
        return Ok(RuleExpr::True);
    }
    let mut parser = RuleParser {
        tokens,
        position: 0,
    };
    let expr = parser.parse_any()?;
    if parser.position < parser.tokens.len() {
        return Err("unexpected tokens after expression".into());
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    And,
    Or,
    Not,
    True,
    False,
    LParen,
    RParen,
    Term(String),
}

/// Splits on whitespace; parentheses are structural only at the edges of
/// a chunk, so `%(key)s` substitutions stay inside their term.
fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    for chunk in input.split_whitespace() {
        let mut rest = chunk;
        while let Some(stripped) = rest.strip_prefix('(') {
            tokens.push(Token::LParen);
            rest = stripped;
        }
        let mut trailing = 0;
        while let Some(stripped) = rest.strip_suffix(')') {
            trailing += 1;
            rest = stripped;
        }

        if !rest.is_empty() {
            match rest.to_ascii_lowercase().as_str() {
                "and" => tokens.push(Token::And),
                "or" => tokens.push(Token::Or),
                "not" => tokens.push(Token::Not),
                "@" => tokens.push(Token::True),
                "!" => tokens.push(Token::False),
                _ => {
                    if !rest.contains(':') {
                        return Err(format!("term '{rest}' is missing a ':'"));
                    }
                    tokens.push(Token::Term(rest.to_string()));
                }
            }
        }

        for _ in 0..trailing {
            tokens.push(Token::RParen);
        }
    }

    Ok(tokens)
}

struct RuleParser {
    tokens: Vec<Token>,
    position: usize,
}

impl RuleParser {
    fn parse_any(&mut self) -> std::result::Result<RuleExpr, String> {
        let mut expr = self.parse_all()?;
        while self.consume(&Token::Or) {
            let right = self.parse_all()?;
            expr = match expr {
                RuleExpr::Any(mut parts) => {
                    parts.push(right);
                    RuleExpr::Any(parts)
                }
                other => RuleExpr::Any(vec![other, right]),
            };
        }
        Ok(expr)
    }

    fn parse_all(&mut self) -> std::result::Result<RuleExpr, String> {
        let mut expr = self.parse_unary()?;
        while self.consume(&Token::And) {
            let right = self.parse_unary()?;
            expr = match expr {
                RuleExpr::All(mut parts) => {
                    parts.push(right);
                    RuleExpr::All(parts)
                }
                other => RuleExpr::All(vec![other, right]),
            };
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> std::result::Result<RuleExpr, String> {
        if self.consume(&Token::Not) {
            let inner = self.parse_unary()?;
            return Ok(RuleExpr::Not(Box::new(inner)));
        }
        if self.consume(&Token::LParen) {
            let expr = self.parse_any()?;
            if !self.consume(&Token::RParen) {
                return Err("expected ')'".into());
            }
            return Ok(expr);
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> std::result::Result<RuleExpr, String> {
        let token = self
            .tokens
            .get(self.position)
            .cloned()
            .ok_or_else(|| "unexpected end of expression".to_string())?;
        self.position += 1;
        match token {
            Token::True => Ok(RuleExpr::True),
            Token::False => Ok(RuleExpr::False),
            Token::Term(word) => parse_term(&word),
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn consume(&mut self, expected: &Token) -> bool {
        if self.tokens.get(self.position) == Some(expected) {
            self.position += 1;
            true
        } else {
            false
        }
    }
}

fn parse_term(word: &str) -> std::result::Result<RuleExpr, String> {
    let (key, value) = word
        .split_once(':')
        .ok_or_else(|| format!("term '{word}' is missing a ':'"))?;
    let value = value.trim_matches('\'').trim_matches('"');

    match key {
        "role" => Ok(RuleExpr::Role(value.to_string())),
        "rule" => Ok(RuleExpr::Rule(value.to_string())),
        _ => {
            let value = if let Some(reference) = value
                .strip_prefix("%(")
                .and_then(|rest| rest.strip_suffix(")s"))
            {
                MatchValue::AuthRef(reference.to_string())
            } else {
                MatchValue::Literal(value.to_string())
            };
            Ok(RuleExpr::Match {
                key: key.to_string(),
                value,
            })
        }
    }
}
