//! Topic filters and routing rules.
//!
//! A filter is an MQTT-style pattern: `+` matches exactly one level, `#`
//! matches any number of trailing levels (including none) and must be last.
//! A rule wraps a filter in a small SQL dialect:
//!
//! ```text
//! SELECT * FROM 'cache/+/+/data/#' WHERE topic(3) = 'swic' AND properties.kind <> 'test'
//! ```

use serde_json::Value;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Literal(String),
    Single,
    Multi,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    raw: String,
    levels: Vec<Level>,
}

impl TopicFilter {
    pub fn parse(filter: &str) -> Result<Self, EngineError> {
        if filter.is_empty() {
            return Err(EngineError::filter(filter, "empty filter"));
        }

        let parts: Vec<&str> = filter.split('/').collect();
        let mut levels = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let level = match *part {
                "#" if i + 1 == parts.len() => Level::Multi,
                "#" => return Err(EngineError::filter(filter, "'#' must be the last level")),
                "+" => Level::Single,
                p if p.contains(['+', '#']) => {
                    return Err(EngineError::filter(filter, "wildcard must occupy a whole level"));
                }
                p => Level::Literal(p.to_string()),
            };
            levels.push(level);
        }

        Ok(Self { raw: filter.to_string(), levels })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &str) -> bool {
        // Wildcards in the first level never match system topics.
        if topic.starts_with('$')
            && matches!(self.levels.first(), Some(Level::Single | Level::Multi))
        {
            return false;
        }

        let mut parts = topic.split('/');
        for level in &self.levels {
            match level {
                Level::Multi => return true,
                Level::Single => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Level::Literal(expected) => match parts.next() {
                    Some(part) if part == expected => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }
}

// ---------------------------------------------------------------------------
// Rule: filter + predicate over topic levels and payload fields
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    /// 1-based topic level.
    TopicLevel(usize),
    /// Dotted path into the JSON payload.
    Field(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
struct Condition {
    operand: Operand,
    negate: bool,
    value: Value,
}

impl Condition {
    /// A missing level or field makes the condition false for either operator.
    fn holds(&self, topic: &str, payload: Option<&Value>) -> bool {
        let actual = match &self.operand {
            Operand::TopicLevel(n) => topic
                .split('/')
                .nth(n - 1)
                .map(|level| Value::String(level.to_string())),
            Operand::Field(path) => payload.and_then(|v| lookup(v, path)).cloned(),
        };
        match actual {
            Some(actual) => values_equal(&actual, &self.value) != self.negate,
            None => false,
        }
    }
}

fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(key.as_str()))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicRule {
    filter: TopicFilter,
    conditions: Vec<Condition>,
}

impl TopicRule {
    /// Parse a bare filter or a `SELECT * FROM '<filter>' [WHERE ...]` rule.
    pub fn parse(rule: &str) -> Result<Self, EngineError> {
        let trimmed = rule.trim();
        let is_select = trimmed
            .get(..6)
            .is_some_and(|head| head.eq_ignore_ascii_case("select"))
            && trimmed[6..].starts_with(char::is_whitespace);
        if !is_select {
            return Ok(Self { filter: TopicFilter::parse(trimmed)?, conditions: Vec::new() });
        }

        let tokens = tokenize(trimmed).map_err(|reason| EngineError::filter(rule, reason))?;
        RuleParser { rule, tokens, pos: 0 }.parse()
    }

    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    /// Whether evaluation needs the payload parsed as JSON.
    pub fn needs_payload(&self) -> bool {
        self.conditions.iter().any(|c| matches!(c.operand, Operand::Field(_)))
    }

    pub fn matches(&self, topic: &str, payload: Option<&Value>) -> bool {
        self.filter.matches(topic) && self.conditions.iter().all(|c| c.holds(topic, payload))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Number(serde_json::Number),
    Star,
    LParen,
    RParen,
    Eq,
    Ne,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '<' | '!' if chars.get(i + 1) == Some(&if c == '<' { '>' } else { '=' }) => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some(&ch) if ch == quote => {
                            // Doubled quote is an escaped quote.
                            if chars.get(i + 1) == Some(&quote) {
                                text.push(quote);
                                i += 2;
                            } else {
                                i += 1;
                                break;
                            }
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E' | '+' | '-')) {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = serde_json::from_str::<serde_json::Number>(&text)
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.')) {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}

struct RuleParser<'a> {
    rule: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl RuleParser<'_> {
    fn parse(mut self) -> Result<TopicRule, EngineError> {
        self.keyword("select")?;
        self.expect(Token::Star, "'*'")?;
        self.keyword("from")?;
        let filter = match self.next() {
            Some(Token::Str(filter)) => TopicFilter::parse(&filter)?,
            _ => return Err(self.error("expected quoted topic filter after FROM")),
        };

        let mut conditions = Vec::new();
        if self.peek().is_some() {
            self.keyword("where")?;
            loop {
                conditions.push(self.condition()?);
                match self.next() {
                    None => break,
                    Some(Token::Word(w)) if w.eq_ignore_ascii_case("and") => continue,
                    Some(_) => return Err(self.error("expected AND between conditions")),
                }
            }
        }

        Ok(TopicRule { filter, conditions })
    }

    fn condition(&mut self) -> Result<Condition, EngineError> {
        let operand = match self.next() {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("topic") => {
                self.expect(Token::LParen, "'(' after topic")?;
                let level = match self.next() {
                    Some(Token::Number(n)) => n.as_u64().filter(|n| *n >= 1),
                    _ => None,
                };
                let level = level.ok_or_else(|| self.error("topic() takes a level number >= 1"))?;
                self.expect(Token::RParen, "')'")?;
                Operand::TopicLevel(level as usize)
            }
            Some(Token::Word(path)) => Operand::Field(path.split('.').map(str::to_string).collect()),
            _ => return Err(self.error("expected topic(n) or a field path")),
        };

        let negate = match self.next() {
            Some(Token::Eq) => false,
            Some(Token::Ne) => true,
            _ => return Err(self.error("expected '=' or '<>'")),
        };

        let value = match self.next() {
            Some(Token::Str(s)) => Value::String(s),
            Some(Token::Number(n)) => Value::Number(n),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("true") => Value::Bool(true),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("false") => Value::Bool(false),
            _ => return Err(self.error("expected a literal")),
        };

        Ok(Condition { operand, negate, value })
    }

    fn keyword(&mut self, word: &str) -> Result<(), EngineError> {
        match self.next() {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case(word) => Ok(()),
            _ => Err(self.error(format!("expected {}", word.to_uppercase()))),
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), EngineError> {
        if self.next() == Some(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn error(&self, reason: impl Into<String>) -> EngineError {
        EngineError::filter(self.rule, reason)
    }
}
