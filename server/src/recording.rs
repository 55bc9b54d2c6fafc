//! Recording file name assignment.
//!
//! The name is generated from a pattern with these placeholders:
//!
//!  * `~/` - user's home directory (at the start of the pattern)
//!  * `%d` - the current date (YYYY-MM-DD)
//!  * `%t` - the current time (HH.MM.SS)
//!  * `%i` - session ID
//!  * `%a` - session alias (or ID if not assigned)
//!
//! If the pattern points to a directory, the default pattern
//! `"%d %t session %i.dprec"` inside that directory is used.

use chrono::{DateTime, TimeZone};
use std::fmt::Display;
use std::path::{Path, PathBuf};

pub const DEFAULT_RECORDING_PATTERN: &str = "%d %t session %i.dprec";

pub fn recording_path<Tz>(
    pattern: &str,
    session_id: &str,
    alias: Option<&str>,
    now: &DateTime<Tz>,
) -> PathBuf
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    expand_recording_path(pattern, session_id, alias, now, dirs::home_dir().as_deref())
}

pub fn expand_recording_path<Tz>(
    pattern: &str,
    session_id: &str,
    alias: Option<&str>,
    now: &DateTime<Tz>,
    home: Option<&Path>,
) -> PathBuf
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut filename = match (pattern.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().into_owned(),
        _ => pattern.to_owned(),
    };

    if Path::new(&filename).is_dir() {
        filename = Path::new(&filename)
            .join(DEFAULT_RECORDING_PATTERN)
            .to_string_lossy()
            .into_owned();
    }

    let alias = alias.filter(|a| !a.is_empty()).unwrap_or(session_id);
    let filename = filename
        .replace("%d", &now.format("%Y-%m-%d").to_string())
        .replace("%t", &now.format("%H.%M.%S").to_string())
        .replace("%i", session_id)
        .replace("%a", alias);

    absolute(PathBuf::from(filename))
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(err) => {
            log::warn!("Cannot resolve current directory: {}", err);
            path
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 12, 5, 7).unwrap()
    }

    #[test]
    fn it_expands_placeholders() {
        let path = expand_recording_path(
            "/var/rec/%a-%i %d %t.dprec",
            "12",
            Some("party"),
            &noon(),
            None,
        );
        assert_eq!(
            path,
            PathBuf::from("/var/rec/party-12 2024-03-09 12.05.07.dprec")
        );
    }

    #[test]
    fn alias_falls_back_to_id() {
        let path = expand_recording_path("/rec/%a.dprec", "12", None, &noon(), None);
        assert_eq!(path, PathBuf::from("/rec/12.dprec"));
    }

    #[test]
    fn it_expands_home_directory() {
        let path = expand_recording_path(
            "~/rec/%i.dprec",
            "4",
            None,
            &noon(),
            Some(Path::new("/home/artist")),
        );
        assert_eq!(path, PathBuf::from("/home/artist/rec/4.dprec"));
    }

    #[test]
    fn directory_uses_default_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().to_string_lossy().into_owned();
        let path = expand_recording_path(&pattern, "9", None, &noon(), None);
        assert_eq!(path, dir.path().join("2024-03-09 12.05.07 session 9.dprec"));
    }

    #[test]
    fn relative_patterns_become_absolute() {
        let path = expand_recording_path("rec-%i.dprec", "1", None, &noon(), None);
        assert!(path.is_absolute());
        assert!(path.ends_with("rec-1.dprec"));
    }
}
