use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::types::{Selector, TaskClass};

/// Rate reported for a selector that has never been observed.
pub const NEUTRAL_RATE: f64 = 0.5;
/// Candidates below this rate are passed over when ranking.
pub const MIN_RATE: f64 = 0.3;

pub const COUNTS_FILE: &str = "selector_counts.jsonl";
pub const RATES_FILE: &str = "selector_success.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("learning store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("learning store record is malformed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("could not replace learning store file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcomes {
    pub attempts: u64,
    pub successes: u64,
}

impl Outcomes {
    pub fn rate(&self) -> f64 {
        if self.attempts == 0 {
            NEUTRAL_RATE
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    fn observe(&mut self, success: bool) {
        self.attempts += 1;
        if success {
            self.successes += 1;
        }
    }
}

/// One line of the counts file. `class` is absent for the global table.
#[derive(Debug, Serialize, Deserialize)]
struct CountRecord {
    fp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    class: Option<TaskClass>,
    attempts: u64,
    successes: u64,
}

#[derive(Debug, Default)]
struct Tables {
    global: HashMap<String, Outcomes>,
    by_class: HashMap<(TaskClass, String), Outcomes>,
    since_checkpoint: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LearningStats {
    pub selectors_tracked: usize,
    pub total_attempts: u64,
    pub total_successes: u64,
    pub overall_rate: f64,
    pub tracked_by_class: BTreeMap<TaskClass, usize>,
    pub pending_outcomes: u32,
    pub best: Vec<(String, f64)>,
}

/// Success-rate table keyed by selector fingerprint, optionally scoped by
/// task class, checkpointed to `dir`.
pub struct LearningStore {
    dir: Option<PathBuf>,
    checkpoint_every: u32,
    tables: Mutex<Tables>,
    flush: Mutex<()>,
}

impl LearningStore {
    /// Loads the store from `dir`. A missing or unreadable counts file yields
    /// an empty store.
    pub fn open(dir: impl Into<PathBuf>, checkpoint_every: u32) -> Self {
        let dir = dir.into();
        let tables = match load_counts(&dir.join(COUNTS_FILE)) {
            Ok(Some(tables)) => {
                info!(
                    dir = %dir.display(),
                    selectors = tables.global.len(),
                    "learning store loaded"
                );
                tables
            }
            Ok(None) => {
                debug!(dir = %dir.display(), "no learning data yet");
                Tables::default()
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "learning data unreadable, starting empty");
                Tables::default()
            }
        };
        Self {
            dir: Some(dir),
            checkpoint_every: checkpoint_every.max(1),
            tables: Mutex::new(tables),
            flush: Mutex::new(()),
        }
    }

    /// In-memory store that never touches disk.
    pub fn ephemeral() -> Self {
        Self {
            dir: None,
            checkpoint_every: u32::MAX,
            tables: Mutex::new(Tables::default()),
            flush: Mutex::new(()),
        }
    }

    pub fn success_rate(&self, selector: &Selector) -> f64 {
        self.rate_of(&selector.fingerprint())
    }

    pub fn rate_of(&self, fingerprint: &str) -> f64 {
        self.tables
            .lock()
            .global
            .get(fingerprint)
            .map_or(NEUTRAL_RATE, Outcomes::rate)
    }

    /// Class-scoped rate, falling back to the global rate when the selector
    /// has not been seen for this class.
    pub fn success_rate_for(&self, selector: &Selector, class: TaskClass) -> f64 {
        let fp = selector.fingerprint();
        let tables = self.tables.lock();
        tables
            .by_class
            .get(&(class, fp.clone()))
            .or_else(|| tables.global.get(&fp))
            .map_or(NEUTRAL_RATE, Outcomes::rate)
    }

    pub fn outcomes(&self, selector: &Selector) -> Option<Outcomes> {
        self.tables.lock().global.get(&selector.fingerprint()).copied()
    }

    /// Records one outcome. Returns `true` when enough outcomes have
    /// accumulated that a checkpoint is due.
    pub fn record(&self, selector: &Selector, class: Option<TaskClass>, success: bool) -> bool {
        let fp = selector.fingerprint();
        let mut tables = self.tables.lock();
        if let Some(class) = class {
            tables
                .by_class
                .entry((class, fp.clone()))
                .or_default()
                .observe(success);
        }
        tables.global.entry(fp).or_default().observe(success);
        tables.since_checkpoint += 1;
        if tables.since_checkpoint >= self.checkpoint_every {
            tables.since_checkpoint = 0;
            true
        } else {
            false
        }
    }

    /// Up to `k` fingerprints containing `kind` (case-insensitive), best rate
    /// first.
    pub fn best_for(&self, kind: &str, k: usize) -> Vec<(String, f64)> {
        let needle = kind.to_lowercase();
        self.ranked(|fp| fp.to_lowercase().contains(&needle), k)
    }

    /// Up to `k` fingerprints of any kind, best rate first.
    pub fn best_overall(&self, k: usize) -> Vec<(String, f64)> {
        self.ranked(|_| true, k)
    }

    fn ranked(&self, keep: impl Fn(&str) -> bool, k: usize) -> Vec<(String, f64)> {
        let mut hits: Vec<(String, f64)> = self
            .tables
            .lock()
            .global
            .iter()
            .filter(|(fp, _)| keep(fp))
            .map(|(fp, outcomes)| (fp.clone(), outcomes.rate()))
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(k);
        hits
    }

    pub fn stats(&self) -> LearningStats {
        let (tracked, attempts, successes, by_class, pending) = {
            let tables = self.tables.lock();
            let mut by_class = BTreeMap::new();
            for (class, _) in tables.by_class.keys() {
                *by_class.entry(*class).or_insert(0usize) += 1;
            }
            let (attempts, successes) = tables
                .global
                .values()
                .fold((0, 0), |(a, s), o| (a + o.attempts, s + o.successes));
            (
                tables.global.len(),
                attempts,
                successes,
                by_class,
                tables.since_checkpoint,
            )
        };
        LearningStats {
            selectors_tracked: tracked,
            total_attempts: attempts,
            total_successes: successes,
            overall_rate: if attempts == 0 {
                0.0
            } else {
                successes as f64 / attempts as f64
            },
            tracked_by_class: by_class,
            pending_outcomes: pending,
            best: self.best_overall(5),
        }
    }

    /// Writes both files atomically. Safe to call concurrently; flushes are
    /// serialized and each writes a consistent snapshot.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let _flush = self.flush.lock();

        let (records, rates) = {
            let tables = self.tables.lock();
            let mut records: Vec<CountRecord> = tables
                .global
                .iter()
                .map(|(fp, o)| CountRecord {
                    fp: fp.clone(),
                    class: None,
                    attempts: o.attempts,
                    successes: o.successes,
                })
                .chain(tables.by_class.iter().map(|((class, fp), o)| CountRecord {
                    fp: fp.clone(),
                    class: Some(*class),
                    attempts: o.attempts,
                    successes: o.successes,
                }))
                .collect();
            records.sort_by(|a, b| a.class.cmp(&b.class).then_with(|| a.fp.cmp(&b.fp)));
            let rates: BTreeMap<String, f64> = tables
                .global
                .iter()
                .map(|(fp, o)| (fp.clone(), o.rate()))
                .collect();
            (records, rates)
        };

        std::fs::create_dir_all(dir)?;

        let mut counts = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(counts.as_file_mut());
            for record in &records {
                serde_json::to_writer(&mut writer, record)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        counts.as_file().sync_all()?;
        counts.persist(dir.join(COUNTS_FILE))?;

        let mut table = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(table.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, &rates)?;
            writer.flush()?;
        }
        table.as_file().sync_all()?;
        table.persist(dir.join(RATES_FILE))?;

        debug!(dir = %dir.display(), records = records.len(), "learning store checkpointed");
        Ok(())
    }

    /// Checkpoint that logs instead of failing.
    pub fn checkpoint_logged(&self) {
        if let Err(e) = self.checkpoint() {
            warn!(error = %e, "learning store checkpoint failed");
        }
    }
}

fn load_counts(path: &Path) -> Result<Option<Tables>, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut tables = Tables::default();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: CountRecord = serde_json::from_str(&line)?;
        let outcomes = Outcomes {
            attempts: record.attempts,
            successes: record.successes.min(record.attempts),
        };
        match record.class {
            Some(class) => {
                tables.by_class.insert((class, record.fp), outcomes);
            }
            None => {
                tables.global.insert(record.fp, outcomes);
            }
        }
    }
    Ok(Some(tables))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn neutral_then_moves() {
        let store = LearningStore::ephemeral();
        let good = Selector::attribute("name", "username");
        let bad = Selector::css("#nope");

        assert_eq!(store.success_rate(&good), 0.5);
        store.record(&good, None, true);
        assert!(store.success_rate(&good) > 0.5);

        store.record(&bad, None, false);
        assert_eq!(store.success_rate(&bad), 0.0);
    }

    #[test]
    fn class_scope_falls_back_to_global() {
        let store = LearningStore::ephemeral();
        let sel = Selector::tag_contains("Login");
        store.record(&sel, Some(TaskClass::Login), false);
        store.record(&sel, Some(TaskClass::Search), true);

        assert_eq!(store.success_rate_for(&sel, TaskClass::Login), 0.0);
        assert_eq!(store.success_rate_for(&sel, TaskClass::Search), 1.0);
        assert_eq!(store.success_rate_for(&sel, TaskClass::Generic), 0.5);
        assert_eq!(store.success_rate(&sel), 0.5);
    }

    #[test]
    fn checkpoint_due_every_n() {
        let dir = tempfile::tempdir().unwrap();
        let store = LearningStore::open(dir.path(), 3);
        let sel = Selector::css("#go");
        assert!(!store.record(&sel, None, true));
        assert!(!store.record(&sel, None, true));
        assert!(store.record(&sel, None, true));
        assert!(!store.record(&sel, None, true));
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let sels = [
            Selector::attribute("name", "password"),
            Selector::tag_contains("Submit"),
            Selector::css("button[type='submit']"),
        ];
        let before: Vec<f64> = {
            let store = LearningStore::open(dir.path(), 10);
            for (i, sel) in sels.iter().enumerate() {
                for n in 0..(i + 2) {
                    store.record(sel, Some(TaskClass::FormFill), n % 3 != 1);
                }
            }
            store.checkpoint().unwrap();
            sels.iter().map(|s| store.success_rate(s)).collect()
        };

        let reopened = LearningStore::open(dir.path(), 10);
        let after: Vec<f64> = sels.iter().map(|s| reopened.success_rate(s)).collect();
        assert_eq!(before, after);
        assert_eq!(
            reopened.success_rate_for(&sels[0], TaskClass::FormFill),
            before[0]
        );

        let rates: BTreeMap<String, f64> =
            serde_json::from_reader(File::open(dir.path().join(RATES_FILE)).unwrap()).unwrap();
        assert_eq!(rates.len(), 3);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(COUNTS_FILE), "{not json\n").unwrap();
        let store = LearningStore::open(dir.path(), 10);
        assert_eq!(store.stats().selectors_tracked, 0);
        assert_eq!(store.success_rate(&Selector::css("#a")), 0.5);
    }

    #[test]
    fn best_for_matches_kind_case_insensitively() {
        let store = LearningStore::ephemeral();
        store.record(&Selector::attribute("name", "Password"), None, true);
        store.record(&Selector::css("input[type='password']"), None, false);
        store.record(&Selector::css("#search"), None, true);

        let best = store.best_for("PASSWORD", 5);
        assert_eq!(best.len(), 2);
        assert_eq!(best[0].0, "attributeValueSelector:name:Password");
        assert_eq!(best[0].1, 1.0);
        assert!(store.best_for("any", 5).is_empty());
        assert_eq!(store.best_overall(1).len(), 1);
        assert_eq!(store.best_overall(5).len(), 3);
    }

    #[test]
    fn failed_checkpoint_is_reported_and_survivable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "occupied").unwrap();
        let store = LearningStore::open(&blocker, 1);
        assert!(store.record(&Selector::css("#go"), None, true));

        assert!(matches!(store.checkpoint(), Err(StoreError::Io(_))));
        store.checkpoint_logged();
        assert_eq!(store.stats().total_attempts, 1);
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let store = Arc::new(LearningStore::ephemeral());
        let sel = Selector::css("#shared");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let sel = sel.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        store.record(&sel, Some(TaskClass::ClickOnly), true);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.outcomes(&sel).unwrap().attempts, 2000);
    }
}
