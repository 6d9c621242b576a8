/// Match a JSON log line by its exact `fields.message`, or a plain line by substring.
pub fn line_matches(line: &str, target: &str) -> bool {
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(line)
        && let Some(msg) = parsed
            .get("fields")
            .and_then(|f| f.get("message"))
            .and_then(|m| m.as_str())
    {
        return msg == target;
    }
    line.contains(target)
}

pub fn buf_contains(buf: &str, target: &str) -> bool {
    buf.lines().any(|line| line_matches(line.trim(), target))
}

/// Captured stdout and stderr of one relay process.
pub struct Logs {
    pub stdout: String,
    pub stderr: String,
}

impl Logs {
    /// JSON-aware message check across both streams.
    pub fn contains_message(&self, target: &str) -> bool {
        buf_contains(&self.stdout, target) || buf_contains(&self.stderr, target)
    }

    /// Number of JSON lines at `level` (e.g. `"ERROR"`).
    pub fn count_level(&self, level: &str) -> usize {
        self.stderr
            .lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).ok())
            .filter(|v| v.get("level").and_then(|l| l.as_str()) == Some(level))
            .count()
    }
}
