//! String template rendering utilities.
//!
//! Templates use `{{key}}` placeholders. Keys may contain letters, digits,
//! `_`, `-`, `.` and `:`; whitespace inside the braces is ignored.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{Error, Result};

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.:\-]+)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// Render `template`, resolving each placeholder through `lookup`.
///
/// The first key `lookup` cannot resolve fails the whole render with
/// `config.missing_key`.
pub fn render<F>(template: &str, mut lookup: F) -> Result<String>
where
    F: FnMut(&str) -> Result<Option<String>>,
{
    let mut result = String::with_capacity(template.len());
    let mut last = 0;

    for caps in placeholder().captures_iter(template) {
        let whole = caps.get(0).expect("capture 0 always present");
        let key = &caps[1];
        let value = lookup(key)?.ok_or_else(|| Error::config_missing_key(key, None))?;
        result.push_str(&template[last..whole.start()]);
        result.push_str(&value);
        last = whole.end();
    }

    result.push_str(&template[last..]);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn render_substitutes_all_placeholders() {
        let rendered = render("cd {{deploy_path}} && ls {{ release_path }}", |key| {
            Ok(match key {
                "deploy_path" => Some("/srv/app".to_string()),
                "release_path" => Some("/srv/app/releases/3".to_string()),
                _ => None,
            })
        })
        .unwrap();
        assert_eq!(rendered, "cd /srv/app && ls /srv/app/releases/3");
    }

    #[test]
    fn render_fails_on_unknown_key() {
        let err = render("echo {{missing}}", |_| Ok(None)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigMissingKey);
        assert_eq!(err.details["key"], "missing");
    }
}
