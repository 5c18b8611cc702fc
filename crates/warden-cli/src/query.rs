//! The statement language accepted by `--query`.
//!
//! ```text
//! SELECT * FROM policy [WHERE name = 'bluetooth'] [;]
//! SELECT name, value FROM policy [;]
//! UPDATE policy SET value = 10 WHERE name = 'bluetooth' [;]
//! ```
//!
//! Keywords and column names are case-insensitive. String literals use single
//! quotes, with `''` standing for a quote inside the literal.

use std::fmt;

pub const TABLE: &str = "policy";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("empty statement")]
    Empty,

    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),

    #[error("unexpected character {found:?} at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },

    #[error("expected {expected}, found {found}")]
    Unexpected { expected: String, found: String },

    #[error("expected {0}, found end of statement")]
    UnexpectedEnd(String),

    #[error("unknown table {0:?}, only {TABLE:?} exists")]
    UnknownTable(String),

    #[error("unknown column {0:?}")]
    UnknownColumn(String),

    #[error("unsupported statement {0:?}")]
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Str(String),
    Number(String),
    Star,
    Comma,
    Eq,
    Semicolon,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) => write!(f, "{w}"),
            Token::Str(s) => write!(f, "'{s}'"),
            Token::Number(n) => write!(f, "{n}"),
            Token::Star => f.write_str("*"),
            Token::Comma => f.write_str(","),
            Token::Eq => f.write_str("="),
            Token::Semicolon => f.write_str(";"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, QueryError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '*' | ',' | '=' | ';' => {
                chars.next();
                tokens.push(match c {
                    '*' => Token::Star,
                    ',' => Token::Comma,
                    '=' => Token::Eq,
                    _ => Token::Semicolon,
                });
            }
            '\'' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some((_, '\'')) => {
                            if matches!(chars.peek(), Some((_, '\''))) {
                                chars.next();
                                text.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some((_, c)) => text.push(c),
                        None => return Err(QueryError::UnterminatedString(offset)),
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c == '-' || c.is_ascii_digit() => {
                let mut text = String::new();
                text.push(c);
                chars.next();
                while let Some(&(_, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    text.push(d);
                    chars.next();
                }
                if text == "-" {
                    return Err(QueryError::UnexpectedChar { found: '-', offset });
                }
                tokens.push(Token::Number(text));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&(_, w)) = chars.peek() {
                    if !(w.is_alphanumeric() || w == '_') {
                        break;
                    }
                    word.push(w);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
            found => return Err(QueryError::UnexpectedChar { found, offset }),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Name,
    Value,
}

impl Column {
    pub const ALL: [Column; 2] = [Column::Name, Column::Value];

    fn parse(word: &str) -> Result<Self, QueryError> {
        match word.to_ascii_lowercase().as_str() {
            "name" => Ok(Column::Name),
            "value" => Ok(Column::Value),
            _ => Err(QueryError::UnknownColumn(word.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Name => "name",
            Column::Value => "value",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `name` restricts the result to one policy.
    Select {
        columns: Vec<Column>,
        name: Option<String>,
    },
    /// `value` is the literal's text; its type is decided against the
    /// policy's current value.
    Update { name: String, value: String },
}

struct Parser {
    tokens: std::vec::IntoIter<Token>,
    peeked: Option<Token>,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        let mut tokens = tokens.into_iter();
        let peeked = tokens.next();
        Self { tokens, peeked }
    }

    fn peek(&self) -> Option<&Token> {
        self.peeked.as_ref()
    }

    fn next(&mut self, expected: &str) -> Result<Token, QueryError> {
        let token = self
            .peeked
            .take()
            .ok_or_else(|| QueryError::UnexpectedEnd(expected.to_string()))?;
        self.peeked = self.tokens.next();
        Ok(token)
    }

    fn keyword(&mut self, keyword: &str) -> Result<(), QueryError> {
        match self.next(keyword)? {
            Token::Word(w) if w.eq_ignore_ascii_case(keyword) => Ok(()),
            other => Err(unexpected(keyword, &other)),
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn punct(&mut self, punct: Token) -> Result<(), QueryError> {
        let expected = punct.to_string();
        let token = self.next(&expected)?;
        if token == punct {
            Ok(())
        } else {
            Err(unexpected(&expected, &token))
        }
    }

    fn table(&mut self) -> Result<(), QueryError> {
        match self.next("table name")? {
            Token::Word(w) if w.eq_ignore_ascii_case(TABLE) => Ok(()),
            Token::Word(w) => Err(QueryError::UnknownTable(w)),
            other => Err(unexpected("table name", &other)),
        }
    }

    fn literal(&mut self) -> Result<String, QueryError> {
        match self.next("literal")? {
            Token::Str(s) | Token::Number(s) => Ok(s),
            other => Err(unexpected("literal", &other)),
        }
    }

    /// `WHERE name = <literal>`
    fn name_filter(&mut self) -> Result<String, QueryError> {
        self.keyword("WHERE")?;
        match self.next("column")? {
            Token::Word(w) if Column::parse(&w)? == Column::Name => {}
            Token::Word(w) => {
                return Err(QueryError::Unsupported(format!("filter on column {w}")));
            }
            other => return Err(unexpected("column", &other)),
        }
        self.punct(Token::Eq)?;
        self.literal()
    }

    fn columns(&mut self) -> Result<Vec<Column>, QueryError> {
        if self.peek() == Some(&Token::Star) {
            self.next("*")?;
            return Ok(Column::ALL.to_vec());
        }
        let mut columns = Vec::new();
        loop {
            match self.next("column")? {
                Token::Word(w) => columns.push(Column::parse(&w)?),
                other => return Err(unexpected("column", &other)),
            }
            if self.peek() != Some(&Token::Comma) {
                return Ok(columns);
            }
            self.next(",")?;
        }
    }

    fn finish(&mut self) -> Result<(), QueryError> {
        if self.peek() == Some(&Token::Semicolon) {
            self.next(";")?;
        }
        match self.peeked.take() {
            None => Ok(()),
            Some(token) => Err(unexpected("end of statement", &token)),
        }
    }
}

fn unexpected(expected: &str, found: &Token) -> QueryError {
    QueryError::Unexpected {
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

/// Parse one statement.
pub fn parse(input: &str) -> Result<Statement, QueryError> {
    let mut parser = Parser::new(tokenize(input)?);

    let verb = match parser.peek() {
        None => return Err(QueryError::Empty),
        Some(Token::Word(w)) => w.to_ascii_uppercase(),
        Some(other) => return Err(unexpected("SELECT or UPDATE", other)),
    };

    let statement = match verb.as_str() {
        "SELECT" => {
            parser.keyword("SELECT")?;
            let columns = parser.columns()?;
            parser.keyword("FROM")?;
            parser.table()?;
            let name = if parser.is_keyword("WHERE") {
                Some(parser.name_filter()?)
            } else {
                None
            };
            Statement::Select { columns, name }
        }
        "UPDATE" => {
            parser.keyword("UPDATE")?;
            parser.table()?;
            parser.keyword("SET")?;
            match parser.next("column")? {
                Token::Word(w) if Column::parse(&w)? == Column::Value => {}
                Token::Word(w) => {
                    return Err(QueryError::Unsupported(format!("update of column {w}")));
                }
                other => return Err(unexpected("column", &other)),
            }
            parser.punct(Token::Eq)?;
            let value = parser.literal()?;
            let name = parser.name_filter()?;
            Statement::Update { name, value }
        }
        _ => return Err(QueryError::Unsupported(verb)),
    };

    parser.finish()?;
    Ok(statement)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_all() {
        assert_eq!(
            parse("SELECT * FROM policy").unwrap(),
            Statement::Select {
                columns: vec![Column::Name, Column::Value],
                name: None
            }
        );
    }

    #[test]
    fn select_one_case_insensitive() {
        assert_eq!(
            parse("select value from POLICY where Name = 'bluetooth';").unwrap(),
            Statement::Select {
                columns: vec![Column::Value],
                name: Some("bluetooth".to_string())
            }
        );
    }

    #[test]
    fn update_with_number_and_string() {
        assert_eq!(
            parse("UPDATE policy SET value=10 WHERE name='bluetooth'").unwrap(),
            Statement::Update {
                name: "bluetooth".to_string(),
                value: "10".to_string()
            }
        );
        assert_eq!(
            parse("UPDATE policy SET value = 'it''s on' WHERE name = 'motd';").unwrap(),
            Statement::Update {
                name: "motd".to_string(),
                value: "it's on".to_string()
            }
        );
        assert_eq!(
            parse("update policy set value = -3 where name = 'x'").unwrap(),
            Statement::Update {
                name: "x".to_string(),
                value: "-3".to_string()
            }
        );
    }

    #[test]
    fn rejects_malformed_statements() {
        assert_eq!(parse("  ").unwrap_err(), QueryError::Empty);
        assert_eq!(
            parse("SELECT * FROM admins").unwrap_err(),
            QueryError::UnknownTable("admins".to_string())
        );
        assert_eq!(
            parse("SELECT colour FROM policy").unwrap_err(),
            QueryError::UnknownColumn("colour".to_string())
        );
        assert_eq!(
            parse("SELECT * FROM policy WHERE name = 'x").unwrap_err(),
            QueryError::UnterminatedString(34)
        );
        assert_eq!(
            parse("DELETE FROM policy").unwrap_err(),
            QueryError::Unsupported("DELETE".to_string())
        );
        assert!(matches!(
            parse("UPDATE policy SET value = 1").unwrap_err(),
            QueryError::UnexpectedEnd(_)
        ));
        assert!(matches!(
            parse("SELECT * FROM policy; SELECT").unwrap_err(),
            QueryError::Unexpected { .. }
        ));
        assert!(matches!(
            parse("SELECT * FROM policy WHERE name > 'x'").unwrap_err(),
            QueryError::UnexpectedChar { found: '>', .. }
        ));
    }
}
