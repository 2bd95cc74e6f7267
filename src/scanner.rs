use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::ScannerConfig;
use crate::create_timestamp;
use crate::error::{Error, Result};

pub const DEFAULT_RULES_FILE: &str = "default_rules.yar";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A single rule match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub rule_name: String,
    pub tags: Vec<String>,
    pub description: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Clean,
    MalwareDetected,
    CriticalThreat,
    Error,
}

/// Persisted scan report document, one per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    #[serde(rename = "jobID")]
    pub job_id: String,
    pub timestamp: String,
    pub detections: Vec<Detection>,
    pub total_rules: usize,
    pub match_count: usize,
    pub status: ScanStatus,
    pub scan_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

/// Adapter around the external YARA binary.
///
/// Scanning is a pure function of the target bytes and the rule directory
/// contents, modulo the timestamp and scanTime fields of the report.
pub struct RuleEngine {
    yara_bin: PathBuf,
    rules_dir: PathBuf,
    timeout: Duration,
}

impl RuleEngine {
    pub fn new(config: &ScannerConfig, rules_dir: PathBuf) -> Self {
        Self {
            yara_bin: config.yara_bin.clone(),
            rules_dir,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Ensures the rule directory exists and seeds the built-in rule set
    /// when no rule files are present. Safe to race: concurrent callers
    /// write identical contents.
    pub async fn init_rules(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.rules_dir).await?;

        if self.rule_files().await?.is_empty() {
            let default_path = self.rules_dir.join(DEFAULT_RULES_FILE);
            tokio::fs::write(&default_path, DEFAULT_RULES).await?;
            log::info!("Created default YARA rules at {}", default_path.display());
        }
        Ok(())
    }

    /// Rule files in lexicographic order; detections concatenate in this order.
    pub async fn rule_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.rules_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_rule = path
                .extension()
                .map(|ext| ext == "yar" || ext == "yara")
                .unwrap_or(false);
            if is_rule {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Runs every rule file against `target` and assembles the report.
    ///
    /// A single failing rule file is logged and skipped, matching the
    /// engine's historical behavior; the report only degrades to `Error`
    /// when no rule file could be applied at all.
    pub async fn scan(&self, job_id: &str, target: &Path) -> ScanReport {
        let started = Instant::now();
        let mut report = ScanReport {
            job_id: job_id.to_string(),
            timestamp: create_timestamp(),
            detections: Vec::new(),
            total_rules: 0,
            match_count: 0,
            status: ScanStatus::Clean,
            scan_time: 0.0,
            error_msg: None,
        };

        let rule_files = match self.rule_files().await {
            Ok(files) => files,
            Err(e) => {
                report.status = ScanStatus::Error;
                report.error_msg = Some(format!("failed to enumerate rules: {e}"));
                report.scan_time = started.elapsed().as_secs_f64();
                return report;
            }
        };
        if rule_files.is_empty() {
            report.status = ScanStatus::Error;
            report.error_msg = Some("no YARA rules available".to_string());
            report.scan_time = started.elapsed().as_secs_f64();
            return report;
        }

        report.total_rules = rule_files.len();
        log::info!(
            "job {job_id}: scanning {} with {} rule files",
            target.display(),
            rule_files.len()
        );

        let mut failures = Vec::new();
        for rule_file in &rule_files {
            match self.run_rule_file(rule_file, target).await {
                Ok(mut detections) => report.detections.append(&mut detections),
                Err(e) => {
                    log::warn!("job {job_id}: rule file {} failed: {e}", rule_file.display());
                    failures.push(e.to_string());
                }
            }
        }

        report.match_count = report.detections.len();
        report.scan_time = started.elapsed().as_secs_f64();

        if failures.len() == rule_files.len() {
            // every invocation failed, e.g. the binary is missing
            report.status = ScanStatus::Error;
            report.error_msg = failures.into_iter().next();
        } else if report.match_count > 0 {
            report.status = ScanStatus::MalwareDetected;
            if report
                .detections
                .iter()
                .any(|d| d.severity == Severity::Critical)
            {
                report.status = ScanStatus::CriticalThreat;
            }
        }

        report
    }

    /// Exit 0 means "no match", exit 1 means "matched, parse stdout";
    /// anything else is an engine failure.
    async fn run_rule_file(&self, rule_file: &Path, target: &Path) -> Result<Vec<Detection>> {
        let output = timeout(
            self.timeout,
            Command::new(&self.yara_bin)
                .arg("-g")
                .arg("-m")
                .arg(rule_file)
                .arg(target)
                .output(),
        )
        .await
        .map_err(|_| Error::ExternalTool {
            tool: "yara",
            detail: format!("scan of {} timed out", target.display()),
        })?
        .map_err(|e| Error::ExternalTool {
            tool: "yara",
            detail: e.to_string(),
        })?;

        match output.status.code() {
            Some(0) => Ok(Vec::new()),
            Some(1) => Ok(parse_matches(&String::from_utf8_lossy(&output.stdout))),
            code => Err(Error::ExternalTool {
                tool: "yara",
                detail: format!(
                    "exit {code:?}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }),
        }
    }

    pub async fn save_report(&self, report: &ScanReport, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(report).map_err(|e| Error::ExternalTool {
            tool: "scan-report",
            detail: e.to_string(),
        })?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    pub async fn load_report(&self, job_id: &str, path: &Path) -> Result<ScanReport> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(job_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(|e| Error::ExternalTool {
            tool: "scan-report",
            detail: format!("corrupt report for job {job_id}: {e}"),
        })
    }
}

fn parse_matches(output: &str) -> Vec<Detection> {
    output.lines().filter_map(parse_match_line).collect()
}

/// One match per line: `rule_name [tag,tag] [key="value",...] /path/to/target`.
/// Bracket groups containing `=` are metadata, the rest are tags; either may
/// be absent depending on the flags the engine was invoked with.
fn parse_match_line(line: &str) -> Option<Detection> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (rule_name, mut rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim_start()),
        None => (line, ""),
    };

    let mut tags = Vec::new();
    let mut description = String::from("YARA rule match");
    let mut severity = Severity::Medium;

    while rest.starts_with('[') {
        let end = rest.find(']')?;
        let group = &rest[1..end];
        rest = rest[end + 1..].trim_start();

        if group.contains('=') {
            for (key, value) in split_meta_pairs(group) {
                match key.as_str() {
                    "description" => description = value,
                    "severity" => {
                        if let Ok(parsed) = value.parse() {
                            severity = parsed;
                        }
                    }
                    _ => {}
                }
            }
        } else {
            tags.extend(
                group
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from),
            );
        }
    }

    Some(Detection {
        rule_name: rule_name.to_string(),
        tags,
        description,
        severity,
    })
}

/// Splits `key="value",key="value"` respecting commas inside quoted values.
fn split_meta_pairs(group: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in group.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                push_meta_pair(&mut pairs, &current);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    push_meta_pair(&mut pairs, &current);
    pairs
}

fn push_meta_pair(pairs: &mut Vec<(String, String)>, raw: &str) {
    if let Some((key, value)) = raw.split_once('=') {
        pairs.push((
            key.trim().to_string(),
            value.trim().trim_matches('"').to_string(),
        ));
    }
}

const DEFAULT_RULES: &str = r#"rule Suspicious_EXE_Header {
    meta:
        description = "Detects Windows executable files"
        severity = "info"
    strings:
        $mz = "MZ"
    condition:
        $mz at 0
}

rule Potential_Ransomware_Keywords {
    meta:
        description = "Contains ransomware-related keywords"
        severity = "high"
    strings:
        $ransom1 = "encrypted" nocase
        $ransom2 = "bitcoin" nocase
        $ransom3 = "payment" nocase
        $ransom4 = "decrypt" nocase
    condition:
        3 of them
}

rule Suspicious_Shell_Commands {
    meta:
        description = "Shell command execution patterns"
        severity = "medium"
    strings:
        $cmd1 = "cmd.exe" nocase
        $cmd2 = "powershell" nocase
        $exec1 = "exec" nocase
        $exec2 = "system" nocase
    condition:
        any of ($cmd*) and any of ($exec*)
}

rule Crypto_Mining_Indicators {
    meta:
        description = "Cryptocurrency mining patterns"
        severity = "high"
    strings:
        $crypto1 = "monero" nocase
        $crypto2 = "mining" nocase
        $crypto3 = "stratum" nocase
    condition:
        2 of them
}

rule Keylogger_Indicators {
    meta:
        description = "Keylogger behavior patterns"
        severity = "critical"
    strings:
        $key1 = "GetAsyncKeyState" nocase
        $key2 = "keypress" nocase
        $log = "log" nocase
    condition:
        any of ($key*) and $log
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScannerConfig;

    fn engine(rules_dir: &Path) -> RuleEngine {
        RuleEngine::new(&ScannerConfig::default(), rules_dir.to_path_buf())
    }

    #[test]
    fn test_parse_bare_rule_name() {
        let detection = parse_match_line("Suspicious_EXE_Header /tmp/sample.bin").unwrap();
        assert_eq!(detection.rule_name, "Suspicious_EXE_Header");
        assert!(detection.tags.is_empty());
        assert_eq!(detection.severity, Severity::Medium);
        assert_eq!(detection.description, "YARA rule match");
    }

    #[test]
    fn test_parse_tags_and_meta() {
        let line = r#"Potential_Ransomware_Keywords [ransomware,crypto] [description="Contains ransomware-related keywords",severity="high"] /tmp/sample.bin"#;
        let detection = parse_match_line(line).unwrap();
        assert_eq!(detection.rule_name, "Potential_Ransomware_Keywords");
        assert_eq!(detection.tags, vec!["ransomware", "crypto"]);
        assert_eq!(detection.severity, Severity::High);
        assert_eq!(
            detection.description,
            "Contains ransomware-related keywords"
        );
    }

    #[test]
    fn test_parse_meta_without_tags() {
        let line = r#"Keylogger_Indicators [description="Keylogger behavior patterns",severity="critical"] /tmp/x"#;
        let detection = parse_match_line(line).unwrap();
        assert!(detection.tags.is_empty());
        assert_eq!(detection.severity, Severity::Critical);
    }

    #[test]
    fn test_parse_empty_tag_group() {
        let line = r#"Some_Rule [] [severity="low"] /tmp/x"#;
        let detection = parse_match_line(line).unwrap();
        assert!(detection.tags.is_empty());
        assert_eq!(detection.severity, Severity::Low);
    }

    #[test]
    fn test_meta_value_with_comma_stays_whole() {
        let line = r#"R [description="one, two, three",severity="low"] /tmp/x"#;
        let detection = parse_match_line(line).unwrap();
        assert_eq!(detection.description, "one, two, three");
        assert_eq!(detection.severity, Severity::Low);
    }

    #[test]
    fn test_unknown_severity_falls_back_to_medium() {
        let line = r#"R [severity="catastrophic"] /tmp/x"#;
        let detection = parse_match_line(line).unwrap();
        assert_eq!(detection.severity, Severity::Medium);
    }

    #[test]
    fn test_parse_matches_skips_blank_lines() {
        let output = "Rule_A /tmp/x\n\nRule_B /tmp/x\n";
        let detections = parse_matches(output);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].rule_name, "Rule_A");
        assert_eq!(detections[1].rule_name, "Rule_B");
    }

    #[test]
    fn test_severity_parse_is_case_insensitive() {
        assert_eq!("HIGH".parse::<Severity>(), Ok(Severity::High));
        assert_eq!("Info".parse::<Severity>(), Ok(Severity::Info));
        assert!("".parse::<Severity>().is_err());
    }

    #[tokio::test]
    async fn test_init_rules_seeds_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        engine.init_rules().await.unwrap();
        let default_path = dir.path().join(DEFAULT_RULES_FILE);
        assert!(default_path.exists());
        let contents = std::fs::read_to_string(&default_path).unwrap();
        assert!(contents.contains("Suspicious_EXE_Header"));
        assert!(contents.contains("Potential_Ransomware_Keywords"));

        // a custom rule set must not be overwritten on re-init
        std::fs::remove_file(&default_path).unwrap();
        std::fs::write(dir.path().join("custom.yar"), "rule X { condition: true }").unwrap();
        engine.init_rules().await.unwrap();
        assert!(!default_path.exists());
    }

    #[tokio::test]
    async fn test_rule_files_sorted_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.yar"), "").unwrap();
        std::fs::write(dir.path().join("a.yara"), "").unwrap();
        std::fs::write(dir.path().join("z.txt"), "").unwrap();

        let files = engine(dir.path()).rule_files().await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.yara", "b.yar"]);
    }

    #[tokio::test]
    async fn test_scan_with_no_rules_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sample.bin");
        std::fs::write(&target, b"hello").unwrap();

        let report = engine(dir.path()).scan("j1", &target).await;
        assert_eq!(report.status, ScanStatus::Error);
        assert_eq!(report.match_count, 0);
        assert!(report.error_msg.is_some());
    }

    #[tokio::test]
    async fn test_report_json_field_names() {
        let report = ScanReport {
            job_id: "j1".to_string(),
            timestamp: "2026-01-01T00:00:00.000Z".to_string(),
            detections: vec![Detection {
                rule_name: "Suspicious_EXE_Header".to_string(),
                tags: vec![],
                description: "Detects Windows executable files".to_string(),
                severity: Severity::Info,
            }],
            total_rules: 1,
            match_count: 1,
            status: ScanStatus::MalwareDetected,
            scan_time: 0.01,
            error_msg: None,
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["jobID"], "j1");
        assert_eq!(value["matchCount"], 1);
        assert_eq!(value["totalRules"], 1);
        assert_eq!(value["status"], "malware_detected");
        assert_eq!(value["detections"][0]["ruleName"], "Suspicious_EXE_Header");
        assert_eq!(value["detections"][0]["severity"], "info");
        assert!(value.get("errorMsg").is_none());
    }
}
