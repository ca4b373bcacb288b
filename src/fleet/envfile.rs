use std::collections::BTreeMap;

/// Parse `KEY=VALUE` lines into a map.
///
/// Blank lines and `#` comments are skipped. The value is everything after
/// the first `=`, so `A=1=2` yields `A → "1=2"`. Lines without `=` or with
/// an empty key are ignored. Later duplicates win.
pub fn parse_env_text(text: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), value.trim().to_string());
    }
    vars
}
