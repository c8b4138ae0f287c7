//! Process-lifetime record of classified faults and executions.

use crate::config::LedgerConfig;
use crate::model::{DetectedFault, ExecutionResult, FaultCategory, RelatedFault, RunId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// Summary of one execution kept for statistics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub run_id: Option<RunId>,
    pub command: String,
    pub success: bool,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub fault_count: usize,
}

impl ExecutionSummary {
    #[must_use]
    pub fn from_result(run_id: Option<RunId>, result: &ExecutionResult, fault_count: usize) -> Self {
        Self {
            run_id,
            command: result.command.clone(),
            success: result.success,
            exit_code: result.exit_code,
            timed_out: result.timed_out,
            duration_ms: result.duration_ms,
            fault_count,
        }
    }
}

/// Aggregate view of everything the ledger has seen.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultTrends {
    pub total_faults: u64,
    pub by_category: BTreeMap<FaultCategory, u64>,
    /// Fault types by descending count, ties by name.
    pub most_common: Vec<(String, u64)>,
    /// Files by descending fault count, ties by path.
    pub most_problematic_files: Vec<(PathBuf, u64)>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStatistics {
    pub retained_faults: usize,
    pub evicted_faults: u64,
    pub total_faults: u64,
    pub executions: u64,
    pub failed_executions: u64,
    pub timed_out_executions: u64,
    pub success_rate: f64,
    pub average_duration_ms: u64,
}

/// Number of entries kept in [`FaultTrends`] rankings.
const TREND_RANKING_LEN: usize = 5;
/// Executions summaries retained for statistics.
const EXECUTION_HISTORY: usize = 1000;

#[derive(Debug, Default)]
struct LedgerState {
    entries: VecDeque<DetectedFault>,
    by_type: BTreeMap<String, u64>,
    by_category: BTreeMap<FaultCategory, u64>,
    by_file: BTreeMap<PathBuf, u64>,
    total_faults: u64,
    evicted: u64,
    executions: VecDeque<ExecutionSummary>,
    execution_total: u64,
    execution_failures: u64,
    execution_timeouts: u64,
    execution_duration_ms: u64,
}

/// Bounded fault history owned by one classifier.
///
/// Counters survive eviction; only [`Ledger::clear`] resets them.
#[derive(Debug)]
pub struct Ledger {
    config: LedgerConfig,
    state: Mutex<LedgerState>,
}

impl Ledger {
    #[must_use]
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LedgerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // A poisoned ledger only means a writer panicked mid-append; the
        // counters are still usable.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Earlier faults sharing the type or file of `fault`, newest first,
    /// drawn from the last `related_window` entries.
    #[must_use]
    pub fn related_to(&self, fault: &DetectedFault) -> Vec<RelatedFault> {
        let state = self.lock();
        state
            .entries
            .iter()
            .rev()
            .take(self.config.related_window)
            .filter(|entry| {
                entry.fault_type == fault.fault_type
                    || (entry.file_path.is_some() && entry.file_path == fault.file_path)
            })
            .take(self.config.max_related)
            .map(|entry| RelatedFault {
                id: entry.id,
                fault_type: entry.fault_type.clone(),
                file_path: entry.file_path.clone(),
                line_number: entry.line_number,
            })
            .collect()
    }

    pub fn append(&self, faults: &[DetectedFault]) {
        let mut state = self.lock();
        for fault in faults {
            *state.by_type.entry(fault.fault_type.clone()).or_default() += 1;
            *state.by_category.entry(fault.category).or_default() += 1;
            if let Some(path) = &fault.file_path {
                *state.by_file.entry(path.clone()).or_default() += 1;
            }
            state.total_faults += 1;
            state.entries.push_back(fault.clone());
            while state.entries.len() > self.config.capacity {
                state.entries.pop_front();
                state.evicted += 1;
            }
        }
    }

    pub fn record_execution(&self, summary: ExecutionSummary) {
        let mut state = self.lock();
        state.execution_total += 1;
        if !summary.success {
            state.execution_failures += 1;
        }
        if summary.timed_out {
            state.execution_timeouts += 1;
        }
        state.execution_duration_ms = state
            .execution_duration_ms
            .saturating_add(summary.duration_ms);
        state.executions.push_back(summary);
        if state.executions.len() > EXECUTION_HISTORY {
            state.executions.pop_front();
        }
    }

    /// Retained faults, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<DetectedFault> {
        self.lock().entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn executions(&self) -> Vec<ExecutionSummary> {
        self.lock().executions.iter().cloned().collect()
    }

    #[must_use]
    pub fn type_count(&self, fault_type: &str) -> u64 {
        self.lock().by_type.get(fault_type).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn trends(&self) -> FaultTrends {
        let state = self.lock();
        FaultTrends {
            total_faults: state.total_faults,
            by_category: state.by_category.clone(),
            most_common: ranked(&state.by_type),
            most_problematic_files: ranked(&state.by_file),
        }
    }

    #[must_use]
    pub fn statistics(&self) -> LedgerStatistics {
        let state = self.lock();
        let succeeded = state.execution_total - state.execution_failures;
        LedgerStatistics {
            retained_faults: state.entries.len(),
            evicted_faults: state.evicted,
            total_faults: state.total_faults,
            executions: state.execution_total,
            failed_executions: state.execution_failures,
            timed_out_executions: state.execution_timeouts,
            success_rate: ratio(succeeded, state.execution_total),
            average_duration_ms: state
                .execution_duration_ms
                .checked_div(state.execution_total)
                .unwrap_or_default(),
        }
    }

    pub fn clear(&self) {
        *self.lock() = LedgerState::default();
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn ranked<K: Clone + Ord>(counts: &BTreeMap<K, u64>) -> Vec<(K, u64)> {
    let mut ranking: Vec<(K, u64)> = counts
        .iter()
        .map(|(key, count)| (key.clone(), *count))
        .collect();
    ranking.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranking.truncate(TREND_RANKING_LEN);
    ranking
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FaultContext, FaultId, Severity};

    fn fault(fault_type: &str, file: Option<&str>) -> DetectedFault {
        DetectedFault {
            id: FaultId::new(),
            fault_type: fault_type.to_string(),
            message: String::new(),
            file_path: file.map(PathBuf::from),
            line_number: None,
            severity: Severity::Medium,
            category: FaultCategory::Syntax,
            confidence: 0.9,
            output_line: 1,
            captures: BTreeMap::new(),
            context: FaultContext::default(),
            suggested_fixes: Vec::new(),
            related: Vec::new(),
            detected_at_ms: 0,
        }
    }

    fn ledger(capacity: usize) -> Ledger {
        Ledger::new(LedgerConfig {
            capacity,
            ..LedgerConfig::default()
        })
    }

    #[test]
    fn eviction_keeps_counters() {
        let ledger = ledger(2);
        ledger.append(&[fault("a", None), fault("a", None), fault("b", None)]);
        assert_eq!(ledger.entries().len(), 2);
        let stats = ledger.statistics();
        assert_eq!(stats.evicted_faults, 1);
        assert_eq!(stats.total_faults, 3);
        assert_eq!(ledger.type_count("a"), 2);
    }

    #[test]
    fn related_matches_type_or_file_newest_first() {
        let ledger = ledger(100);
        let first = fault("syntax_error", Some("a.py"));
        let second = fault("import_error", Some("a.py"));
        let unrelated = fault("timeout", None);
        ledger.append(&[first.clone(), second.clone(), unrelated]);
        let related = ledger.related_to(&fault("syntax_error", Some("a.py")));
        let ids: Vec<_> = related.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[test]
    fn trends_rank_by_count() {
        let ledger = ledger(100);
        ledger.append(&[
            fault("b", Some("x.py")),
            fault("a", Some("x.py")),
            fault("a", Some("y.py")),
        ]);
        let trends = ledger.trends();
        assert_eq!(trends.total_faults, 3);
        assert_eq!(
            trends.most_common,
            vec![("a".to_string(), 2), ("b".to_string(), 1)]
        );
        assert_eq!(
            trends.most_problematic_files.first(),
            Some(&(PathBuf::from("x.py"), 2))
        );
    }

    #[test]
    fn clear_resets_everything() {
        let ledger = ledger(100);
        ledger.append(&[fault("a", None)]);
        ledger.clear();
        assert_eq!(ledger.statistics(), LedgerStatistics::default());
    }
}
