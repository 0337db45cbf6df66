use std::collections::BTreeSet;

/// Recursively deep-merge `overlay` into `base`.
///
/// - Tables merge recursively per-field.
/// - Scalars and arrays from the overlay **replace** the base value.
pub fn deep_merge(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                if let Some(base_val) = base_table.get_mut(key) {
                    deep_merge(base_val, overlay_val);
                } else {
                    base_table.insert(key.clone(), overlay_val.clone());
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
        },
    }
}

/// Dotted paths of every leaf value in `val` (e.g. `"logging.level"`).
#[must_use]
pub fn leaf_paths(val: &toml::Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_leaves(val, "", &mut out);
    out
}

fn collect_leaves(val: &toml::Value, prefix: &str, out: &mut BTreeSet<String>) {
    if let toml::Value::Table(table) = val {
        for (key, child) in table {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            collect_leaves(child, &path, out);
        }
    } else if !prefix.is_empty() {
        out.insert(prefix.to_owned());
    }
}
