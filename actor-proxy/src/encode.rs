//! Command line encoding
//!
//! Arguments travel as one space-joined line: positional values first, then
//! `--name value` pairs. Numbers and booleans are written literally, strings
//! are shell-quoted unless the caller already quoted them, and any other value
//! is JSON-encoded and quoted.

use serde::Serialize;
use serde_json::Value;

use crate::error::{ProxyError, Result};
use crate::types::Payload;

/// Positional and keyword arguments of one command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandArgs {
    pub positional: Vec<Value>,
    pub options: Payload,
}

impl CommandArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Serialize) -> Self {
        self.positional.push(to_value(value));
        self
    }

    /// Set a keyword argument, rendered as `--name value`.
    pub fn option(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        self.options.insert(name.into(), to_value(value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.options.is_empty()
    }

    /// Wire tokens for these arguments, in order.
    pub fn encode(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.positional.iter().map(encode_value).collect();
        for (name, value) in &self.options {
            tokens.push(format!("--{name}"));
            tokens.push(encode_value(value));
        }
        tokens
    }

    pub fn positional_str(&self, index: usize) -> Option<&str> {
        self.positional.get(index).and_then(Value::as_str)
    }

    pub fn option_bool(&self, name: &str) -> Option<bool> {
        self.options.get(name).and_then(Value::as_bool)
    }
}

fn to_value(value: impl Serialize) -> Value {
    // Only maps with non-string keys fail here; those have no JSON form anyway.
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Encode one argument value into a command line token.
pub fn encode_value(value: &Value) -> String {
    match value {
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::String(text) if is_quoted(text) => text.clone(),
        Value::String(text) => shell_quote(text),
        other => single_quote(&other.to_string()),
    }
}

fn is_quoted(text: &str) -> bool {
    text.len() >= 2
        && ((text.starts_with('\'') && text.ends_with('\''))
            || (text.starts_with('"') && text.ends_with('"')))
}

/// Quote a string so a POSIX shell tokenizer reads it back as one token.
pub fn shell_quote(text: &str) -> String {
    if text.is_empty() {
        return "''".to_string();
    }
    let safe = text
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        return text.to_string();
    }
    single_quote(text)
}

fn single_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r#"'"'"'"#))
}

/// Split a command line into tokens with POSIX shell quoting rules.
pub fn split_command_line(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(unterminated(line)),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err(unterminated(line)),
                        },
                        Some(c) => current.push(c),
                        None => return Err(unterminated(line)),
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => {
                        return Err(ProxyError::InvalidCommandLine(format!(
                            "trailing backslash in `{line}`"
                        )));
                    }
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn unterminated(line: &str) -> ProxyError {
    ProxyError::InvalidCommandLine(format!("unterminated quote in `{line}`"))
}

/// Rebuild arguments from wire tokens.
///
/// Tokens that parse as JSON become JSON values, the rest stay strings.
/// `--name value` becomes an option; `--name` followed by another option or
/// by nothing becomes `true`.
pub fn decode_arguments<S: AsRef<str>>(tokens: &[S]) -> CommandArgs {
    let mut args = CommandArgs::new();
    let mut iter = tokens.iter().map(AsRef::as_ref).peekable();

    while let Some(token) = iter.next() {
        match option_name(token) {
            Some(name) => {
                let value = match iter.peek() {
                    Some(next) if option_name(next).is_none() => {
                        let value = decode_token(next);
                        iter.next();
                        value
                    }
                    _ => Value::Bool(true),
                };
                args.options.insert(name.to_string(), value);
            }
            None => args.positional.push(decode_token(token)),
        }
    }
    args
}

fn option_name(token: &str) -> Option<&str> {
    token
        .strip_prefix("--")
        .filter(|name| name.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_'))
}

fn decode_token(token: &str) -> Value {
    serde_json::from_str(token).unwrap_or_else(|_| Value::String(token.to_string()))
}
