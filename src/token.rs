//! `{{ $.path }}` token resolution.
//!
//! A string consisting of exactly one token resolves to the matched
//! value with its JSON type intact. Tokens embedded in other text are
//! stringified and spliced in. Results that themselves contain tokens
//! are resolved again, at most [`MAX_DEPTH`] levels deep.
//!
//! `${NAME}` is a separate form that must make up the whole string;
//! it reads a process environment variable and falls back to the
//! literal text when the variable is unset.

use crate::context::VariableContext;
use serde_json::Value;

/// Maximum nesting of token expansion before giving up.
pub const MAX_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece<'a> {
    Text(&'a str),
    Token { expr: &'a str },
}

/// Resolve every token in `input`.
pub fn resolve(input: &str, ctx: &VariableContext) -> Value {
    resolve_at(input, ctx, 0)
}

/// Resolve `input` and render the result as text.
pub fn resolve_string(input: &str, ctx: &VariableContext) -> String {
    stringify(&resolve(input, ctx))
}

/// Resolve every string inside a JSON tree, keeping its shape.
pub fn resolve_value(value: &Value, ctx: &VariableContext) -> Value {
    expand(value.clone(), ctx, 0)
}

/// `true` when `input` contains at least one `{{ $... }}` token.
pub fn has_tokens(input: &str) -> bool {
    input.contains("{{")
        && scan(input)
            .iter()
            .any(|piece| matches!(piece, Piece::Token { .. }))
}

/// Text form used for interpolation. Numbers use their JSON
/// representation, so the output never depends on locale.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn resolve_at(input: &str, ctx: &VariableContext, depth: usize) -> Value {
    if let Some(name) = env_token(input) {
        return std::env::var(name)
            .map(Value::String)
            .unwrap_or_else(|_| Value::String(input.to_string()));
    }

    let pieces = scan(input);
    let token_count = pieces
        .iter()
        .filter(|piece| matches!(piece, Piece::Token { .. }))
        .count();
    if token_count == 0 {
        return Value::String(input.to_string());
    }

    if depth >= MAX_DEPTH {
        ctx.log(format!(
            "Token nesting exceeded {MAX_DEPTH} levels, stopped expanding '{input}'"
        ));
        return Value::String(input.to_string());
    }

    let only_whitespace_around = pieces.iter().all(|piece| match piece {
        Piece::Text(text) => text.trim().is_empty(),
        Piece::Token { .. } => true,
    });

    if token_count == 1 && only_whitespace_around {
        let expr = pieces
            .iter()
            .find_map(|piece| match piece {
                Piece::Token { expr, .. } => Some(*expr),
                Piece::Text(_) => None,
            })
            .unwrap_or_default();
        let value = evaluate(expr, ctx, depth);
        return expand(value, ctx, depth + 1);
    }

    let mut output = String::with_capacity(input.len());
    for piece in &pieces {
        match piece {
            Piece::Text(text) => output.push_str(text),
            Piece::Token { expr, .. } => {
                output.push_str(&stringify(&evaluate(expr, ctx, depth)));
            }
        }
    }

    if has_tokens(&output) {
        resolve_at(&output, ctx, depth + 1)
    } else {
        Value::String(output)
    }
}

fn expand(value: Value, ctx: &VariableContext, depth: usize) -> Value {
    match value {
        Value::String(s) if has_tokens(&s) || env_token(&s).is_some() => {
            resolve_at(&s, ctx, depth)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| expand(item, ctx, depth))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, expand(item, ctx, depth)))
                .collect(),
        ),
        other => other,
    }
}

/// Evaluate the path inside one token. Nested tokens in the path are
/// substituted first.
fn evaluate(expr: &str, ctx: &VariableContext, depth: usize) -> Value {
    let path = if has_tokens(expr) {
        stringify(&resolve_at(expr, ctx, depth + 1))
    } else {
        expr.trim().to_string()
    };

    match ctx.query(&path) {
        Ok(mut matches) => match matches.len() {
            0 => {
                ctx.log(format!("Path not found: {path}"));
                Value::String(String::new())
            }
            1 => matches.remove(0),
            _ => Value::Array(matches),
        },
        Err(message) => {
            ctx.log(message);
            Value::String(String::new())
        }
    }
}

fn env_token(input: &str) -> Option<&str> {
    let name = input.strip_prefix("${")?.strip_suffix('}')?;
    if name.is_empty() || name.contains(['{', '}', '$']) {
        return None;
    }
    Some(name)
}

/// Split `input` into literal text and `{{ ... }}` tokens. Braces are
/// matched by depth, so `{{$.a[{{$.i}}]}}` is one token. Only tokens
/// whose expression starts with `$` count; anything else stays text.
fn scan(input: &str) -> Vec<Piece<'_>> {
    let bytes = input.as_bytes();
    let mut pieces = Vec::new();
    let mut text_start = 0;
    let mut i = 0;

    while i + 1 < bytes.len() {
        if !(bytes[i] == b'{' && bytes[i + 1] == b'{') {
            i += 1;
            continue;
        }

        let Some(end) = matching_close(bytes, i) else {
            break;
        };
        let expr = &input[i + 2..end - 2];
        if expr.trim_start().starts_with('$') {
            if text_start < i {
                pieces.push(Piece::Text(&input[text_start..i]));
            }
            pieces.push(Piece::Token { expr });
            text_start = end;
            i = end;
        } else {
            i += 2;
        }
    }

    if text_start < input.len() {
        pieces.push(Piece::Text(&input[text_start..]));
    }
    pieces
}

/// Index just past the `}}` closing the `{{` at `open`.
fn matching_close(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut j = open + 2;
    while j + 1 < bytes.len() {
        if bytes[j] == b'{' && bytes[j + 1] == b'{' {
            depth += 1;
            j += 2;
        } else if bytes[j] == b'}' && bytes[j + 1] == b'}' {
            depth -= 1;
            j += 2;
            if depth == 0 {
                return Some(j);
            }
        } else {
            j += 1;
        }
    }
    None
}
