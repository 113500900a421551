//! Audit persistence
//!
//! JSON-lines files rotated daily (`audit-YYYY-MM-DD.log`), buffered writes
//! flushed on a count threshold, retention sweep on rotation, and a reader
//! with filtering and summary statistics. There is no update API: entries
//! are append-only.

use crate::entry::{AuditEntry, AuditOutcome};
use aegis_core::DecisionOutcome;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditStoreConfig {
    /// Directory holding the daily log files
    pub dir: PathBuf,

    /// Flush after this many buffered entries
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,

    /// Remove files older than this many days
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for AuditStoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./audit"),
            flush_every: default_flush_every(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_flush_every() -> usize {
    10
}

fn default_retention_days() -> u32 {
    90
}

fn file_name_for(date: NaiveDate) -> String {
    format!("audit-{}.log", date.format("%Y-%m-%d"))
}

/// Buffered append-only writer with daily rotation and hash chaining
pub struct AuditWriter {
    config: AuditStoreConfig,
    file: Option<BufWriter<File>>,
    current_date: NaiveDate,
    pending: usize,
    chain: Option<String>,
}

impl AuditWriter {
    /// Open a writer, creating the audit directory if needed
    pub fn new(config: AuditStoreConfig) -> std::io::Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let mut writer = Self {
            config,
            file: None,
            current_date: Utc::now().date_naive(),
            pending: 0,
            chain: None,
        };
        writer.open_for(writer.current_date)?;
        Ok(writer)
    }

    /// Chain, serialize, and append one entry
    pub fn write_entry(&mut self, entry: &AuditEntry) -> std::io::Result<()> {
        let today = entry.timestamp.date_naive();
        if today != self.current_date {
            self.rotate(today)?;
        }

        let mut entry = entry.clone();
        entry.previous_hash = self.chain.clone();
        let hash = entry.compute_hash();
        entry.hash = Some(hash.clone());
        self.chain = Some(hash);

        let line = serde_json::to_string(&entry)?;
        if let Some(file) = &mut self.file {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            self.pending += 1;
            if self.pending >= self.config.flush_every {
                file.flush()?;
                self.pending = 0;
            }
        }
        Ok(())
    }

    /// Force buffered entries to disk
    pub fn flush(&mut self) -> std::io::Result<()> {
        if let Some(file) = &mut self.file {
            file.flush()?;
            self.pending = 0;
        }
        Ok(())
    }

    fn open_for(&mut self, date: NaiveDate) -> std::io::Result<()> {
        let path = self.config.dir.join(file_name_for(date));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.file = Some(BufWriter::new(file));
        self.current_date = date;
        // A fresh file starts a fresh chain.
        self.chain = None;
        Ok(())
    }

    fn rotate(&mut self, date: NaiveDate) -> std::io::Result<()> {
        self.flush()?;
        info!(date = %date, "rotating audit log");
        self.open_for(date)?;
        if let Err(e) = self.sweep_retention() {
            warn!("audit retention sweep failed: {}", e);
        }
        Ok(())
    }

    fn sweep_retention(&self) -> std::io::Result<()> {
        let cutoff = Utc::now().date_naive()
            - chrono::Duration::days(i64::from(self.config.retention_days));
        for entry in fs::read_dir(&self.config.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(date) = parse_file_date(name) else {
                continue;
            };
            if date < cutoff {
                info!(file = %name, "removing expired audit file");
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

fn parse_file_date(name: &str) -> Option<NaiveDate> {
    let date_part = name.strip_prefix("audit-")?.strip_suffix(".log")?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Query filter for audit entries
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Inclusive lower bound
    pub start: Option<DateTime<Utc>>,

    /// Inclusive upper bound
    pub end: Option<DateTime<Utc>>,

    /// Restrict to these agents
    pub agents: Vec<String>,

    /// Restrict to these policy ids
    pub policies: Vec<String>,

    /// Restrict to these decision outcomes
    pub decisions: Vec<DecisionOutcome>,

    /// Substring searched in the reason and resource
    pub keyword: Option<String>,

    /// Maximum entries returned
    pub limit: Option<usize>,

    /// Entries skipped before collecting
    pub offset: Option<usize>,
}

impl AuditQuery {
    /// An unfiltered query
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the time range
    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    /// Filter by agent
    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agents.push(agent.into());
        self
    }

    /// Filter by policy id
    pub fn policy(mut self, policy: impl Into<String>) -> Self {
        self.policies.push(policy.into());
        self
    }

    /// Filter by decision outcome
    pub fn decision(mut self, outcome: DecisionOutcome) -> Self {
        self.decisions.push(outcome);
        self
    }

    /// Filter by keyword
    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }

    /// Cap the result count
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Summary statistics over a query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStats {
    /// Entries considered
    pub total: u64,

    /// Count per enforcement outcome
    pub by_outcome: BTreeMap<String, u64>,

    /// Count per decision outcome
    pub by_decision: BTreeMap<String, u64>,

    /// Count per policy id
    pub by_policy: BTreeMap<String, u64>,

    /// Count per agent
    pub by_agent: BTreeMap<String, u64>,

    /// Entries per hour of day
    pub hourly: [u64; 24],

    /// Risk-score quartile distribution (unknown, 0–.25, .25–.5, .5–.75, .75–1)
    pub risk_distribution: [u64; 5],
}

/// Reader over the persisted daily files
pub struct AuditReader {
    config: AuditStoreConfig,
}

impl AuditReader {
    /// Create a reader over the store directory
    pub fn new(config: AuditStoreConfig) -> Self {
        Self { config }
    }

    fn files(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.config.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(parse_file_date)
                    .is_some()
            })
            .collect();
        // Dated names sort chronologically.
        files.sort();
        Ok(files)
    }

    /// Entries matching the query, oldest first
    pub fn query(&self, query: &AuditQuery) -> std::io::Result<Vec<AuditEntry>> {
        let mut results = Vec::new();
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(1000);
        let mut skipped = 0;

        for path in self.files()? {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let entry: AuditEntry = match serde_json::from_str(&line) {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("skipping unparseable audit line: {}", e);
                        continue;
                    }
                };
                if !matches(&entry, query) {
                    continue;
                }
                if skipped < offset {
                    skipped += 1;
                    continue;
                }
                results.push(entry);
                if results.len() >= limit {
                    return Ok(results);
                }
            }
        }
        Ok(results)
    }

    /// The most recent `n` entries, newest first
    pub fn latest(&self, n: usize) -> std::io::Result<Vec<AuditEntry>> {
        let mut all = self.query(&AuditQuery::new().limit(usize::MAX))?;
        let start = all.len().saturating_sub(n);
        let mut recent = all.split_off(start);
        recent.reverse();
        Ok(recent)
    }

    /// Summary statistics over the entries a query matches
    pub fn stats(&self, query: &AuditQuery) -> std::io::Result<AuditStats> {
        let mut stats = AuditStats::default();
        for entry in self.query(&AuditQuery {
            limit: Some(usize::MAX),
            ..query.clone()
        })? {
            stats.total += 1;
            *stats
                .by_outcome
                .entry(format!("{:?}", entry.outcome))
                .or_default() += 1;
            *stats
                .by_decision
                .entry(entry.decision.outcome.to_string())
                .or_default() += 1;
            if let Some(policy) = &entry.decision.metadata.policy_id {
                *stats.by_policy.entry(policy.clone()).or_default() += 1;
            }
            *stats
                .by_agent
                .entry(entry.context.agent_id.clone())
                .or_default() += 1;
            stats.hourly[entry.timestamp.hour() as usize] += 1;
            let bucket = match entry.context.risk_score {
                None => 0,
                Some(r) if r < 0.25 => 1,
                Some(r) if r < 0.5 => 2,
                Some(r) if r < 0.75 => 3,
                Some(_) => 4,
            };
            stats.risk_distribution[bucket] += 1;
        }
        Ok(stats)
    }
}

fn matches(entry: &AuditEntry, query: &AuditQuery) -> bool {
    if let Some(start) = query.start {
        if entry.timestamp < start {
            return false;
        }
    }
    if let Some(end) = query.end {
        if entry.timestamp > end {
            return false;
        }
    }
    if !query.agents.is_empty() && !query.agents.contains(&entry.context.agent_id) {
        return false;
    }
    if !query.policies.is_empty() {
        let matched = entry
            .decision
            .metadata
            .policy_id
            .as_ref()
            .is_some_and(|id| query.policies.contains(id));
        if !matched {
            return false;
        }
    }
    if !query.decisions.is_empty() && !query.decisions.contains(&entry.decision.outcome) {
        return false;
    }
    if let Some(keyword) = &query.keyword {
        let hit = entry.decision.reason.contains(keyword.as_str())
            || entry.context.resource.contains(keyword.as_str());
        if !hit {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::verify_chain;
    use aegis_core::{DecisionContext, DecisionMetadata, PolicyDecision};
    use tempfile::TempDir;

    fn config(dir: &Path) -> AuditStoreConfig {
        AuditStoreConfig {
            dir: dir.to_path_buf(),
            flush_every: 1,
            retention_days: 7,
        }
    }

    fn entry_for(agent: &str, outcome: DecisionOutcome) -> AuditEntry {
        let ctx = DecisionContext::new(agent, "tools/call", "fs__read_file");
        let mut decision =
            PolicyDecision::permit("within window", DecisionMetadata::structured("pol-1"));
        decision.outcome = outcome;
        AuditEntry::new(ctx, decision, AuditOutcome::Success, 5)
    }

    #[test]
    fn test_write_then_query() {
        let dir = TempDir::new().unwrap();
        let mut writer = AuditWriter::new(config(dir.path())).unwrap();

        writer.write_entry(&entry_for("a1", DecisionOutcome::Permit)).unwrap();
        writer.write_entry(&entry_for("a2", DecisionOutcome::Deny)).unwrap();
        writer.flush().unwrap();

        let reader = AuditReader::new(config(dir.path()));
        let all = reader.query(&AuditQuery::new()).unwrap();
        assert_eq!(all.len(), 2);
        assert!(verify_chain(&all));

        let denies = reader
            .query(&AuditQuery::new().decision(DecisionOutcome::Deny))
            .unwrap();
        assert_eq!(denies.len(), 1);
        assert_eq!(denies[0].context.agent_id, "a2");
    }

    #[test]
    fn test_daily_file_name() {
        let dir = TempDir::new().unwrap();
        let mut writer = AuditWriter::new(config(dir.path())).unwrap();
        writer.write_entry(&entry_for("a1", DecisionOutcome::Permit)).unwrap();
        writer.flush().unwrap();

        let expected = dir
            .path()
            .join(format!("audit-{}.log", Utc::now().date_naive().format("%Y-%m-%d")));
        assert!(expected.exists());
    }

    #[test]
    fn test_agent_and_keyword_filters() {
        let dir = TempDir::new().unwrap();
        let mut writer = AuditWriter::new(config(dir.path())).unwrap();
        for i in 0..6 {
            let agent = if i % 2 == 0 { "even" } else { "odd" };
            writer.write_entry(&entry_for(agent, DecisionOutcome::Permit)).unwrap();
        }
        writer.flush().unwrap();

        let reader = AuditReader::new(config(dir.path()));
        assert_eq!(reader.query(&AuditQuery::new().agent("even")).unwrap().len(), 3);
        assert_eq!(
            reader
                .query(&AuditQuery::new().keyword("fs__read"))
                .unwrap()
                .len(),
            6
        );
        assert!(reader
            .query(&AuditQuery::new().keyword("no-such-thing"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_latest_returns_newest_first() {
        let dir = TempDir::new().unwrap();
        let mut writer = AuditWriter::new(config(dir.path())).unwrap();
        for agent in ["first", "second", "third"] {
            writer.write_entry(&entry_for(agent, DecisionOutcome::Permit)).unwrap();
        }
        writer.flush().unwrap();

        let reader = AuditReader::new(config(dir.path()));
        let latest = reader.latest(2).unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].context.agent_id, "third");
        assert_eq!(latest[1].context.agent_id, "second");
    }

    #[test]
    fn test_stats_breakdowns() {
        let dir = TempDir::new().unwrap();
        let mut writer = AuditWriter::new(config(dir.path())).unwrap();
        writer.write_entry(&entry_for("a1", DecisionOutcome::Permit)).unwrap();
        writer.write_entry(&entry_for("a1", DecisionOutcome::Deny)).unwrap();
        writer.write_entry(&entry_for("a2", DecisionOutcome::Permit)).unwrap();
        writer.flush().unwrap();

        let reader = AuditReader::new(config(dir.path()));
        let stats = reader.stats(&AuditQuery::new()).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_agent["a1"], 2);
        assert_eq!(stats.by_decision["PERMIT"], 2);
        assert_eq!(stats.by_policy["pol-1"], 3);
        assert_eq!(stats.hourly.iter().sum::<u64>(), 3);
    }
}
