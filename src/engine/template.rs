//! `{{name}}` placeholder substitution.

use std::collections::HashMap;

/// Replace every `{{name}}` in `content` with the batch variable of that name, falling back to
/// the environment variable. Unknown placeholders are kept verbatim. Substituted values are not
/// scanned again.
///
/// A placeholder is the text between a `}}` and the nearest `{{` before it, so extra opening
/// braces (`{{{token}}}`, `{{x {{token}}`) stay literal around the substituted name.
pub fn resolve(
    content: &str,
    variables: &HashMap<String, String>,
    env: &HashMap<String, String>,
) -> String {
    if content.is_empty() || (variables.is_empty() && env.is_empty()) || !content.contains("{{") {
        return content.to_string();
    }

    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(close) = rest.find("}}") {
        let head = &rest[..close];
        let placeholder = &rest[..close + 2];
        match head.rfind("{{") {
            Some(open) => {
                out.push_str(&head[..open]);
                let name = &head[open + 2..];
                match variables.get(name).or_else(|| env.get(name)) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&placeholder[open..]),
                }
            }
            None => out.push_str(placeholder),
        }
        rest = &rest[close + 2..];
    }
    out.push_str(rest);
    out
}
