//! Exec pipeline parsing (spec 4.7 "Exec pipelines").
//!
//! Splits a raw shell-ish command string into independently policy-
//! evaluated segments, rejecting constructs that would let a client smuggle
//! a command the policy never saw: command/process substitution and
//! subshells are always rejected; redirections are rejected unless the
//! conclave opts in via `allow_redirects`.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExecParseError {
    #[error("command substitution is not allowed")]
    CommandSubstitution,
    #[error("process substitution is not allowed")]
    ProcessSubstitution,
    #[error("subshells are not allowed")]
    Subshell,
    #[error("shell redirection is not allowed on this conclave")]
    RedirectNotAllowed,
    #[error("unterminated quote")]
    UnterminatedQuote,
}

/// One independently policy-evaluated chunk of a parsed command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub command: String,
    pub args: Vec<String>,
}

impl Segment {
    pub fn args_joined(&self) -> String {
        self.args.join(" ")
    }

    /// Reconstructs `command arg1 arg2 ...` -- used to rebuild the string
    /// sent to the conclave once redirects have been stripped out (spec
    /// 4.7: "defense in depth against a client that stripped redirections
    /// locally").
    pub fn to_command_line(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(self.command.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

const CHAIN_OPERATORS: [&str; 3] = ["&&", "||", ";"];

/// Parses `raw` into segments split on `|`, `&&`, `||`, `;`, rejecting
/// substitution/subshell constructs and, unless `allow_redirects`,
/// redirection operators. Quoted occurrences of any operator are literal.
pub fn parse_pipeline(raw: &str, allow_redirects: bool) -> Result<Vec<Segment>, ExecParseError> {
    let tokens = tokenize(raw)?;
    let mut segments = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for tok in tokens {
        match tok {
            Token::Operator(op) if op == "|" || CHAIN_OPERATORS.contains(&op.as_str()) => {
                push_segment(&mut segments, &mut current);
            }
            Token::Operator(op) => {
                if !allow_redirects && is_redirect(&op) {
                    return Err(ExecParseError::RedirectNotAllowed);
                }
                // Redirects allowed: keep the operator as a literal token
                // so the reconstructed command line still carries it.
                current.push(op);
            }
            Token::Word(w) => current.push(w),
        }
    }
    push_segment(&mut segments, &mut current);
    Ok(segments)
}

fn push_segment(segments: &mut Vec<Segment>, current: &mut Vec<String>) {
    if current.is_empty() {
        return;
    }
    let command = current.remove(0);
    segments.push(Segment {
        command,
        args: std::mem::take(current),
    });
}

fn is_redirect(op: &str) -> bool {
    matches!(op, ">" | ">>" | "<" | "2>" | "2>>" | "&>" | "&>>" | "<>")
}

enum Token {
    Word(String),
    Operator(String),
}

/// A minimal shell-ish tokenizer: splits on whitespace and operator
/// characters outside of quotes, honoring single/double quoting so an
/// operator inside quotes is treated as a literal character instead.
fn tokenize(raw: &str) -> Result<Vec<Token>, ExecParseError> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut chars = raw.chars().peekable();
    let mut in_word = false;

    macro_rules! flush_word {
        () => {
            if in_word {
                tokens.push(Token::Word(std::mem::take(&mut word)));
                in_word = false;
            }
        };
    }

    while let Some(&c) = chars.peek() {
        match c {
            '\'' => {
                chars.next();
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => word.push(ch),
                        None => return Err(ExecParseError::UnterminatedQuote),
                    }
                }
            }
            '"' => {
                chars.next();
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => {
                            if let Some(next) = chars.next() {
                                word.push(next);
                            }
                        }
                        Some(ch) => word.push(ch),
                        None => return Err(ExecParseError::UnterminatedQuote),
                    }
                }
            }
            '`' => return Err(ExecParseError::CommandSubstitution),
            '$' => {
                chars.next();
                if chars.peek() == Some(&'(') {
                    return Err(ExecParseError::CommandSubstitution);
                }
                in_word = true;
                word.push('$');
            }
            '(' => return Err(ExecParseError::Subshell),
            ')' => return Err(ExecParseError::Subshell),
            '<' if peek_is(&mut chars.clone(), '(') => {
                return Err(ExecParseError::ProcessSubstitution);
            }
            '>' if peek_is(&mut chars.clone(), '(') => {
                return Err(ExecParseError::ProcessSubstitution);
            }
            c if c.is_whitespace() => {
                flush_word!();
                chars.next();
            }
            '|' => {
                flush_word!();
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                    tokens.push(Token::Operator("||".to_string()));
                } else {
                    tokens.push(Token::Operator("|".to_string()));
                }
            }
            '&' => {
                flush_word!();
                chars.next();
                if chars.peek() == Some(&'&') {
                    chars.next();
                    tokens.push(Token::Operator("&&".to_string()));
                } else if chars.peek() == Some(&'>') {
                    chars.next();
                    let mut op = "&>".to_string();
                    if chars.peek() == Some(&'>') {
                        chars.next();
                        op.push('>');
                    }
                    tokens.push(Token::Operator(op));
                } else {
                    tokens.push(Token::Operator("&".to_string()));
                }
            }
            ';' => {
                flush_word!();
                chars.next();
                tokens.push(Token::Operator(";".to_string()));
            }
            '>' | '<' => {
                // A leading digit (e.g. `2>`) is a redirect fd prefix, not
                // a separate word -- fold it into the operator instead of
                // flushing it as a word.
                let mut op = if in_word && word.chars().all(|c| c.is_ascii_digit()) {
                    std::mem::take(&mut word)
                } else {
                    flush_word!();
                    String::new()
                };
                in_word = false;
                op.push(chars.next().unwrap());
                if chars.peek() == Some(&'>') && op.ends_with('>') {
                    chars.next();
                    op.push('>');
                }
                tokens.push(Token::Operator(op));
            }
            _ => {
                in_word = true;
                word.push(c);
                chars.next();
            }
        }
    }
    flush_word!();
    Ok(tokens)
}

fn peek_is(chars: &mut std::iter::Peekable<std::str::Chars>, target: char) -> bool {
    chars.next();
    chars.peek() == Some(&target)
}

#[cfg(test)]
#[path = "exec_tests.rs"]
mod tests;
