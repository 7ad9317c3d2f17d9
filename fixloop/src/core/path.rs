//! Deterministic file naming for session logs, caches and lock files.

use chrono::{DateTime, Utc};

/// Replace every byte outside `[A-Za-z0-9._-]` with `-` and trim leading dashes.
///
/// Used to turn absolute project paths and branch names into single path
/// components. An input that sanitizes to nothing becomes `"root"`.
pub fn sanitize_component(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = mapped.trim_start_matches('-');
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        "root".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `<YYYYMMDD-HHMMSS-mmm>_<branch>`; sorts chronologically within a project.
pub fn session_stem(started_at: DateTime<Utc>, branch: &str) -> String {
    format!(
        "{}_{}",
        started_at.format("%Y%m%d-%H%M%S-%3f"),
        sanitize_component(branch)
    )
}

pub fn lock_file_name(project_path: &str) -> String {
    format!("{}.json", sanitize_component(project_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_absolute_paths() {
        assert_eq!(
            sanitize_component("/home/dev/my project"),
            "home-dev-my-project"
        );
        assert_eq!(sanitize_component("feature/x.y_z"), "feature-x.y_z");
        assert_eq!(sanitize_component("/"), "root");
        assert_eq!(sanitize_component(".."), "root");
    }

    #[test]
    fn session_stem_has_millisecond_timestamp() {
        let ts = DateTime::from_timestamp_millis(1_700_000_000_123).expect("ts");
        assert_eq!(session_stem(ts, "main"), "20231114-221320-123_main");
    }

    #[test]
    fn lock_name_is_keyed_by_project() {
        assert_eq!(lock_file_name("/srv/app"), "srv-app.json");
    }
}
