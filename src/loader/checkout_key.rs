use model_plugin::ModelPackage;

use crate::error::{Result, RuntimeError};

/// Stands in for missing optional parts of a checkout key.
pub const PLACEHOLDER: &str = "_";

const RESERVED_NAMES: [&str; 4] = ["CON", "PRN", "AUX", "NUL"];
const RESERVED_NUMBERED: [&str; 2] = ["COM", "LPT"];

/// Names no filesystem should be asked to create, compared on the part
/// before the first dot and ignoring case.
fn is_reserved_name(segment: &str) -> bool {
    let stem = segment.split('.').next().unwrap_or(segment).trim_end().to_ascii_uppercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        return true;
    }
    RESERVED_NUMBERED.iter().any(|prefix| {
        stem.strip_prefix(prefix)
            .is_some_and(|n| n.len() == 1 && n.chars().all(|c| ('1'..='9').contains(&c)))
    })
}

/// Check one component of a checkout key is safe to use as a single path segment.
pub fn validate_segment(segment: &str) -> Result<()> {
    let reason = if segment.is_empty() {
        Some("is empty")
    } else if segment == "." || segment == ".." {
        Some("is a relative path reference")
    } else if segment.contains(['/', '\\']) {
        Some("contains a path separator")
    } else if segment.contains('\0') {
        Some("contains a NUL character")
    } else if segment.contains(':') {
        Some("contains a drive or stream separator")
    } else if is_reserved_name(segment) {
        Some("is a reserved device name")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(RuntimeError::Internal(format!("checkout key component `{segment}` {reason}"))),
        None => Ok(()),
    }
}

/// Percent-escape `%` and `-` so `-` only ever separates key components. A
/// component spelled like the placeholder is escaped too.
fn escape_component(part: &str) -> String {
    if part == PLACEHOLDER {
        return "%5F".to_string();
    }
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '-' => escaped.push_str("%2D"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Directory name for a package checkout: `group-package-version`, with
/// `_` standing in for a missing group. Distinct packages never share a key.
pub fn checkout_key(package: &ModelPackage) -> Result<String> {
    let group = package.package_group.as_deref();
    let parts = [group.unwrap_or(PLACEHOLDER), package.package.as_str(), package.version.as_str()];
    for part in parts {
        validate_segment(part)?;
    }
    let group = group.map_or_else(|| PLACEHOLDER.to_string(), escape_component);
    let key = format!("{group}-{}-{}", escape_component(&package.package), escape_component(&package.version));
    validate_segment(&key)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use model_plugin::ModelDescriptor;

    fn package(version: &str) -> ModelPackage {
        ModelDescriptor::new("repo", "models", version, "m.M").package()
    }

    #[test]
    fn missing_group_gets_a_placeholder() {
        assert_eq!(checkout_key(&package("1.0.2")).unwrap(), "_-models-1.0.2");
        let grouped = ModelDescriptor::new("repo", "models", "v2", "m.M").with_group("acme").package();
        assert_eq!(checkout_key(&grouped).unwrap(), "acme-models-v2");
    }

    #[test]
    fn escaping_and_reserved_versions_are_internal_errors() {
        for version in ["../../etc", "/etc/passwd", "..", "a\\b", "C:evil", "NUL", "con.txt", "Com1", "LPT9.log", ""] {
            let err = checkout_key(&package(version)).unwrap_err();
            assert!(matches!(err, RuntimeError::Internal(_)), "{version}: {err}");
        }
    }

    #[test]
    fn hyphens_and_placeholders_do_not_collide() {
        let key = |group: Option<&str>, name: &str, version: &str| {
            let descriptor = ModelDescriptor::new("repo", name, version, "m.M");
            let descriptor = match group {
                Some(group) => descriptor.with_group(group),
                None => descriptor,
            };
            checkout_key(&descriptor.package()).unwrap()
        };

        assert_ne!(key(Some("a"), "b-c", "1"), key(Some("a-b"), "c", "1"));
        assert_ne!(key(Some("a"), "b", "c-1"), key(Some("a"), "b-c", "1"));
        assert_ne!(key(Some("_"), "models", "1"), key(None, "models", "1"));
        assert_ne!(key(None, "x%2Dy", "1"), key(None, "x-y", "1"));
        assert_eq!(key(Some("a-b"), "c", "1.0-rc"), "a%2Db-c-1.0%2Drc");
    }

    #[test]
    fn near_reserved_names_are_fine() {
        for version in ["COM10", "LPT0", "console", "nullable", "1.0.0-rc.1"] {
            assert!(checkout_key(&package(version)).is_ok(), "{version}");
        }
    }
}
