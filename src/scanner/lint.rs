//! Lint checker invocation contract and output parsing.
//!
//! The lint checker is an external subprocess whose stdout is one finding
//! per line:
//!
//! ```text
//! [ERROR] path/to/file.py:12: message text (WL-101)
//! [CAUTION] path/to/file.py: message without line (WL-204)
//! [ADVISORY] free-form message
//! ```
//!
//! A configured severity set gates which findings are promoted to
//! candidates; the permitted widenings are `{error}`,
//! `{error, caution}`, and `{error, caution, advisory}`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Lint finding severity levels, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LintSeverity {
    Error,
    Caution,
    Advisory,
}

impl LintSeverity {
    /// The tag this severity carries in checker output.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            LintSeverity::Error => "[ERROR]",
            LintSeverity::Caution => "[CAUTION]",
            LintSeverity::Advisory => "[ADVISORY]",
        }
    }

    /// Candidate priority for findings of this severity.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            LintSeverity::Error => 1,
            LintSeverity::Caution => 4,
            LintSeverity::Advisory => 5,
        }
    }
}

impl FromStr for LintSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LintSeverity::Error),
            // Some checkers emit WARNING for the middle tier.
            "caution" | "warning" => Ok(LintSeverity::Caution),
            "advisory" => Ok(LintSeverity::Advisory),
            other => Err(format!(
                "unknown lint severity '{other}' (expected error, caution, or advisory)"
            )),
        }
    }
}

/// Parse a comma-separated severity filter (`"error,caution"`).
pub fn parse_severity_filter(raw: &str) -> Result<Vec<LintSeverity>, String> {
    let mut filter: Vec<LintSeverity> = Vec::new();
    for part in raw.split(',') {
        if part.trim().is_empty() {
            continue;
        }
        let sev = part.parse()?;
        if !filter.contains(&sev) {
            filter.push(sev);
        }
    }
    if filter.is_empty() {
        return Err("lint severity filter is empty".to_string());
    }
    Ok(filter)
}

/// One structured lint finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintFinding {
    pub severity: LintSeverity,
    pub path: Option<String>,
    pub line: Option<u32>,
    pub rule_id: Option<String>,
    pub message: String,
    /// Original checker line, kept for prompt context and stable ids.
    pub raw: String,
}

/// Parsed result of one lint-checker invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LintScan {
    /// Whether a lint checker is configured for this workspace.
    pub available: bool,
    pub exit_code: Option<i32>,
    pub findings: Vec<LintFinding>,
    /// Invocation-level error (timeout, spawn failure).
    pub error: Option<String>,
}

impl LintScan {
    /// A scan result for a workspace without a configured lint checker.
    #[must_use]
    pub fn unavailable() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn finding_count(&self) -> usize {
        self.findings.len()
    }
}

/// Parse checker stdout into findings, keeping only the filtered severities.
#[must_use]
pub fn parse_lint_output(stdout: &str, filter: &[LintSeverity]) -> Vec<LintFinding> {
    let line_re =
        Regex::new(r"^\[(ERROR|CAUTION|WARNING|ADVISORY)\]\s+(.+)$").expect("static regex");
    let rule_re = Regex::new(r"\(([A-Z][A-Z0-9]*(?:-[A-Z0-9]+)+)\)\s*$").expect("static regex");
    let path_line_re = Regex::new(r"^(\S+?):(\d+):\s*(.*)$").expect("static regex");
    let path_only_re = Regex::new(r"^(\S*[/.]\S*?):\s+(.*)$").expect("static regex");

    let mut findings = Vec::new();
    for line in stdout.lines() {
        let trimmed = line.trim();
        let Some(caps) = line_re.captures(trimmed) else {
            continue;
        };
        let severity: LintSeverity = match caps[1].to_lowercase().parse() {
            Ok(sev) => sev,
            Err(_) => continue,
        };
        if !filter.contains(&severity) {
            continue;
        }

        let mut rest = caps[2].trim().to_string();
        let rule_id = rule_re.captures(&rest).map(|rc| rc[1].to_string());
        if let Some(start) = rule_re.find(&rest).map(|m| m.start()) {
            rest.truncate(start);
            rest = rest.trim_end().to_string();
        }

        let (path, line_no, message) = if let Some(pl) = path_line_re.captures(&rest) {
            (
                Some(pl[1].to_string()),
                pl[2].parse::<u32>().ok(),
                pl[3].to_string(),
            )
        } else if let Some(p) = path_only_re.captures(&rest) {
            (Some(p[1].to_string()), None, p[2].to_string())
        } else {
            (None, None, rest.clone())
        };

        findings.push(LintFinding {
            severity,
            path,
            line: line_no,
            rule_id,
            message,
            raw: trimmed.to_string(),
        });
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_from_str() {
        assert_eq!("error".parse::<LintSeverity>().unwrap(), LintSeverity::Error);
        assert_eq!(
            "CAUTION".parse::<LintSeverity>().unwrap(),
            LintSeverity::Caution
        );
        assert_eq!(
            "warning".parse::<LintSeverity>().unwrap(),
            LintSeverity::Caution
        );
        assert!("bogus".parse::<LintSeverity>().is_err());
    }

    #[test]
    fn test_parse_severity_filter() {
        assert_eq!(
            parse_severity_filter("error").unwrap(),
            vec![LintSeverity::Error]
        );
        assert_eq!(
            parse_severity_filter("error,caution,advisory").unwrap(),
            vec![
                LintSeverity::Error,
                LintSeverity::Caution,
                LintSeverity::Advisory
            ]
        );
        assert!(parse_severity_filter("").is_err());
        assert!(parse_severity_filter("error,bogus").is_err());
    }

    #[test]
    fn test_parse_finding_with_path_line_and_rule() {
        let out = "[ERROR] agents/video/run.py:42: undefined workflow reference (WL-101)";
        let findings = parse_lint_output(out, &[LintSeverity::Error]);
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.severity, LintSeverity::Error);
        assert_eq!(f.path.as_deref(), Some("agents/video/run.py"));
        assert_eq!(f.line, Some(42));
        assert_eq!(f.rule_id.as_deref(), Some("WL-101"));
        assert_eq!(f.message, "undefined workflow reference");
    }

    #[test]
    fn test_parse_finding_path_without_line() {
        let out = "[CAUTION] docs/workflow.md: stale link target (WL-204)";
        let findings = parse_lint_output(out, &[LintSeverity::Error, LintSeverity::Caution]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].path.as_deref(), Some("docs/workflow.md"));
        assert!(findings[0].line.is_none());
        assert_eq!(findings[0].rule_id.as_deref(), Some("WL-204"));
    }

    #[test]
    fn test_parse_finding_message_only() {
        let out = "[ERROR] agent 'narrator' is missing a manifest";
        let findings = parse_lint_output(out, &[LintSeverity::Error]);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].path.is_none());
        assert!(findings[0].rule_id.is_none());
    }

    #[test]
    fn test_severity_filter_excludes_lower_levels() {
        let out = "\
[ERROR] a.py:1: broken (WL-1)
[CAUTION] b.py:2: iffy (WL-2)
[ADVISORY] c.py:3: style (WL-3)";
        let errors_only = parse_lint_output(out, &[LintSeverity::Error]);
        assert_eq!(errors_only.len(), 1);

        let widened = parse_lint_output(out, &[LintSeverity::Error, LintSeverity::Caution]);
        assert_eq!(widened.len(), 2);
    }

    #[test]
    fn test_warning_tag_maps_to_caution() {
        let out = "[WARNING] b.py:2: iffy";
        let findings = parse_lint_output(out, &[LintSeverity::Caution]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, LintSeverity::Caution);
    }

    #[test]
    fn test_non_finding_lines_ignored() {
        let out = "scanning 120 files...\n[ERROR] a.py:1: broken (WL-1)\ndone.";
        let findings = parse_lint_output(out, &[LintSeverity::Error]);
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_priorities() {
        assert_eq!(LintSeverity::Error.priority(), 1);
        assert_eq!(LintSeverity::Caution.priority(), 4);
        assert_eq!(LintSeverity::Advisory.priority(), 5);
    }
}
