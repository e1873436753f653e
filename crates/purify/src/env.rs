use std::env;
use std::sync::OnceLock;

static PURIFY_REAPPLY_VIEWS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> Option<bool> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Whether functionalized programs re-apply view operations by default.
///
/// Read once from `PURIFY_REAPPLY_VIEWS`; unset or unparsable values keep views enabled.
pub(crate) fn reapply_views_default() -> bool {
    *PURIFY_REAPPLY_VIEWS.get_or_init(|| match env::var("PURIFY_REAPPLY_VIEWS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value).unwrap_or_else(|| {
            log::warn!("ignoring unrecognized PURIFY_REAPPLY_VIEWS value {value:?}");
            true
        }),
        _ => true,
    })
}
