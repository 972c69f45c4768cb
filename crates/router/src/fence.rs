/// Strip markdown code fences from a completion.
///
/// A leading fence line (three backticks plus an optional language tag) and
/// a trailing fence are removed along with surrounding whitespace, so a
/// `cpp`-tagged block comes back as just its body. Nested wrappers are peeled
/// until nothing changes, so the function is idempotent.
pub fn strip_code_fences(text: &str) -> String {
    let mut current = text.trim();
    loop {
        let next = strip_once(current);
        if next == current {
            return current.to_string();
        }
        current = next;
    }
}

fn strip_once(s: &str) -> &str {
    let mut out = s;
    if let Some(rest) = out.strip_prefix("```") {
        // Drop the whole opening line, including any language tag.
        out = match rest.find('\n') {
            Some(nl) => &rest[nl + 1..],
            None => rest,
        };
    }
    if let Some(inner) = out.trim_end().strip_suffix("```") {
        out = inner;
    }
    out.trim()
}
