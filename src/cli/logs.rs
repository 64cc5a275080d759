use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

use crate::core::terminal::print_info;
use crate::logging::STREAMS;

/// Newest rotated file of `stream`; names sort by their date stamp.
fn latest_file(dir: &Path, stream: &str) -> Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("cannot read {}", dir.display())),
    };
    let prefix = format!("{stream}.log.");
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix))
        })
        .collect();
    files.sort();
    Ok(files.pop())
}

fn last_lines(content: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = content.lines().collect();
    lines[lines.len().saturating_sub(n)..].to_vec()
}

pub(super) fn tail(dir: &Path, stream: &str, lines: usize) -> Result<()> {
    if !STREAMS.contains(&stream) {
        bail!("unknown log stream {stream}");
    }
    let Some(path) = latest_file(dir, stream)? else {
        print_info(&format!("No {stream} logs yet"));
        return Ok(());
    };
    let content =
        std::fs::read_to_string(&path).with_context(|| format!("cannot read {}", path.display()))?;
    for line in last_lines(&content, lines) {
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_newest_file_of_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "activity.log.2026-10-17",
            "activity.log.2026-10-18",
            "activity.lock",
            "connectivity.log.2026-10-19",
        ] {
            std::fs::write(dir.path().join(name), name).unwrap();
        }
        let latest = latest_file(dir.path(), "activity").unwrap().unwrap();
        assert!(latest.ends_with("activity.log.2026-10-18"));
        assert!(latest_file(&dir.path().join("missing"), "activity").unwrap().is_none());
    }

    #[test]
    fn finds_the_file_the_appender_writes() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let mut appender = crate::logging::stream_appender(dir.path(), "activity", 3).unwrap();
        writeln!(appender, "octo/app: baseline recorded").unwrap();
        appender.flush().unwrap();

        let latest = latest_file(dir.path(), "activity").unwrap().unwrap();
        let name = latest.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("activity.log."), "{name}");
        assert!(latest_file(dir.path(), "connectivity").unwrap().is_none());
    }

    #[test]
    fn keeps_only_the_last_lines() {
        assert_eq!(last_lines("a\nb\nc\n", 2), vec!["b", "c"]);
        assert_eq!(last_lines("a\n", 5), vec!["a"]);
    }

    #[test]
    fn unknown_streams_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(tail(dir.path(), "other", 5).is_err());
    }
}
