use anyhow::{Result, ensure};

/// Wildcard patterns use `*`, which matches one or more characters,
/// including path separators. Filenames themselves must never contain the
/// metacharacter; the scanner rejects them before they reach the table.
pub fn is_pattern(name: &str) -> bool {
    name.contains('*')
}

pub fn matches(pattern: &str, name: &str) -> bool {
    captures(pattern, name).is_some()
}

/// Matches `name` against `pattern`, returning the substrings consumed by
/// each `*` in order. Wildcards never match the empty string.
pub fn captures<'a>(pattern: &str, name: &'a str) -> Option<Vec<&'a str>> {
    let mut caps = Vec::new();
    if match_from(pattern, name, &mut caps) {
        Some(caps)
    } else {
        None
    }
}

fn match_from<'a>(pattern: &str, name: &'a str, caps: &mut Vec<&'a str>) -> bool {
    match pattern.find('*') {
        None => pattern == name,
        Some(idx) => {
            let literal = &pattern[..idx];
            let rest = &pattern[idx + 1..];
            let Some(remainder) = name.strip_prefix(literal) else {
                return false;
            };
            for end in 1..=remainder.len() {
                if !remainder.is_char_boundary(end) {
                    continue;
                }
                caps.push(&remainder[..end]);
                if match_from(rest, &remainder[end..], caps) {
                    return true;
                }
                caps.pop();
            }
            false
        }
    }
}

/// Rebuilds a target pattern by substituting each `*` with the next
/// captured parameter. Wildcard counts must agree.
pub fn substitute(target: &str, params: &[&str]) -> Result<String> {
    let slots = target.matches('*').count();
    ensure!(
        slots == params.len(),
        "target pattern '{target}' has {slots} wildcards but {} parameters were captured",
        params.len()
    );
    let mut out = String::with_capacity(target.len());
    let mut params = params.iter();
    for piece in target.split('*') {
        out.push_str(piece);
        if let Some(param) = params.next() {
            out.push_str(param);
        }
    }
    Ok(out)
}
