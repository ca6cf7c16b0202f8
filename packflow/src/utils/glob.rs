//! Glob pattern matching over `/`-separated relative paths.
//!
//! Patterns are translated into anchored regular expressions:
//!
//! | glob     | meaning                                  |
//! |----------|------------------------------------------|
//! | `**/`    | zero or more directories                 |
//! | `**`     | anything, separators included            |
//! | `*`      | anything within one path segment         |
//! | `?`      | one character, never a separator         |
//! | `[a-z]`  | character class (`[!a-z]` negates)       |
//! | `{a,b}`  | alternation                              |
//!
//! A trailing `/` matches everything below that directory. A leading `!`
//! negates the whole pattern.

use regex::Regex;

use crate::{Error, Result};

const GLOB_CHARS: &[char] = &['*', '?', '[', ']', '{', '}', '!'];

/// Whether `s` contains any glob metacharacter.
pub fn is_glob_pattern(s: &str) -> bool {
    s.contains(GLOB_CHARS)
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobMatcher {
    pattern: String,
    regex: Regex,
    negated: bool,
}

impl GlobMatcher {
    pub fn new(pattern: &str) -> Result<Self> {
        let (negated, body) = match pattern.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };

        let mut source = String::with_capacity(body.len() * 2 + 8);
        source.push('^');
        translate(body, &mut source)
            .map_err(|msg| Error::validation(format!("invalid glob '{pattern}': {msg}")))?;
        if body.ends_with('/') {
            source.push_str(".*");
        }
        source.push('$');

        let regex = Regex::new(&source)
            .map_err(|e| Error::validation(format!("invalid glob '{pattern}': {e}")))?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            negated,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Match a relative path. Backslashes are treated as separators.
    pub fn is_match(&self, path: &str) -> bool {
        let normalized;
        let path = if path.contains('\\') {
            normalized = path.replace('\\', "/");
            normalized.as_str()
        } else {
            path
        };
        self.regex.is_match(path) != self.negated
    }
}

fn translate(glob: &str, out: &mut String) -> std::result::Result<(), &'static str> {
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    let mut brace_depth = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    if chars.get(i + 2) == Some(&'/') {
                        out.push_str("(?:.*/)?");
                        i += 3;
                    } else {
                        out.push_str(".*");
                        i += 2;
                    }
                    continue;
                }
                out.push_str("[^/]*");
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == ']')
                    .ok_or("unclosed '['")?;
                let class = &chars[i + 1..i + 1 + close];
                out.push('[');
                let mut rest = class;
                if let Some((&first, tail)) = class.split_first()
                    && (first == '!' || first == '^')
                {
                    out.push('^');
                    rest = tail;
                }
                for &ch in rest {
                    if matches!(ch, '\\' | '[' | ']' | '^' | '&' | '~') {
                        out.push('\\');
                    }
                    out.push(ch);
                }
                out.push(']');
                i += close + 2;
                continue;
            }
            '{' => {
                brace_depth += 1;
                out.push_str("(?:");
            }
            '}' if brace_depth > 0 => {
                brace_depth -= 1;
                out.push(')');
            }
            ',' if brace_depth > 0 => out.push('|'),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                out.push_str(&regex::escape(&chars[i].to_string()));
            }
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    if brace_depth > 0 {
        return Err("unclosed '{'");
    }
    Ok(())
}
