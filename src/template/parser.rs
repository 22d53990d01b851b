//! # Template Parser
//!
//! Splits a template into literal text and `{{ ... }}` expressions. An
//! expression is a placeholder followed by zero or more `| function args...`
//! stages; arguments are bare words or double-quoted strings.

use crate::template::functions::{self, PipeFunction};
use crate::template::{Placeholder, TemplateError};

#[derive(Debug, Clone)]
pub(crate) enum Segment {
    Literal(String),
    Expression(Expression),
}

#[derive(Debug, Clone)]
pub(crate) struct Expression {
    pub placeholder: Placeholder,
    pub pipeline: Vec<PipeCall>,
}

#[derive(Debug, Clone)]
pub(crate) struct PipeCall {
    pub function: &'static PipeFunction,
    pub args: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Pipe,
}

pub(crate) fn parse(source: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = source;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }
        let body_start = start + 2;
        let end = rest[body_start..]
            .find("}}")
            .ok_or(TemplateError::Unterminated {
                position: offset + start,
            })?;
        let body = &rest[body_start..body_start + end];
        segments.push(Segment::Expression(parse_expression(body, offset + start)?));

        let consumed = body_start + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

fn parse_expression(body: &str, position: usize) -> Result<Expression, TemplateError> {
    let tokens = tokenize(body)?;
    if tokens.is_empty() {
        return Err(TemplateError::EmptyExpression { position });
    }

    let mut stages = tokens.split(|token| *token == Token::Pipe);

    let placeholder = match stages.next() {
        Some([Token::Word(word)]) if word.starts_with('.') => word[1..].parse::<Placeholder>()?,
        _ => return Err(TemplateError::ExpectedPlaceholder(body.trim().to_string())),
    };

    let mut pipeline = Vec::new();
    for stage in stages {
        let (name, args) = match stage {
            [Token::Word(name), args @ ..] => (name, args),
            _ => return Err(TemplateError::EmptyExpression { position }),
        };
        let function =
            functions::lookup(name).ok_or_else(|| TemplateError::UnknownFunction(name.clone()))?;
        if args.len() != function.arity {
            return Err(TemplateError::Arity {
                function: function.name,
                expected: function.arity,
                found: args.len(),
            });
        }
        let args = args
            .iter()
            .map(|token| match token {
                Token::Word(value) | Token::Quoted(value) => value.clone(),
                Token::Pipe => String::new(),
            })
            .collect();
        pipeline.push(PipeCall { function, args });
    }

    Ok(Expression {
        placeholder,
        pipeline,
    })
}

fn tokenize(body: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut chars = body.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '|' => {
                chars.next();
                tokens.push(Token::Pipe);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => break,
                        },
                        '"' => {
                            closed = true;
                            break;
                        }
                        c => value.push(c),
                    }
                }
                if !closed {
                    return Err(TemplateError::UnterminatedString(body.trim().to_string()));
                }
                tokens.push(Token::Quoted(value));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '|' || c == '"' {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }

    Ok(tokens)
}
