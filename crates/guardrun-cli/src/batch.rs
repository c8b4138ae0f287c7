//! `guardrun batch`: many commands through one orchestrator, concurrently.
//!
//! Runs are blocking, so each one goes to the blocking pool; a semaphore
//! bounds how many are in flight. All runs share the orchestrator's ledger.

use crate::output::{failure_label, print_json, report_exit_code};
use crate::{prepare, RunArgs};
use guardrun::{FailureKind, GuardError, GuardResult, SafetyReport};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Commands in a batch file: one per line, blank lines and `#` comments
/// skipped.
pub(crate) fn parse_batch(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub(crate) fn cmd_batch(
    config: Option<&Path>,
    run: &RunArgs,
    jobs: usize,
    file: &Path,
) -> GuardResult<i32> {
    let text = fs::read_to_string(file)
        .map_err(|err| GuardError::io(format!("failed to read {}", file.display()), err))?;
    let commands = parse_batch(&text);
    if commands.is_empty() {
        return Err(GuardError::invalid_context(
            "batch file contains no commands",
            serde_json::json!({ "path": file }),
        ));
    }
    let (orchestrator, context) = prepare(config, run)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| GuardError::io("failed to start async runtime", err))?;
    let progress = progress_bar(commands.len(), run.json);
    let reports = runtime.block_on(run_all(
        Arc::new(orchestrator),
        Arc::new(context),
        commands,
        BatchSettings {
            jobs: jobs.max(1),
            max_attempts: run.max_attempts,
            auto_recover: !run.no_recover,
        },
        progress.clone(),
    ))?;
    progress.finish_and_clear();

    if run.json {
        print_json(&reports)?;
    } else {
        print_summary(&reports);
    }
    Ok(batch_exit_code(&reports))
}

#[derive(Clone, Copy)]
struct BatchSettings {
    jobs: usize,
    max_attempts: usize,
    auto_recover: bool,
}

async fn run_all(
    orchestrator: Arc<guardrun::SafetyOrchestrator>,
    context: Arc<guardrun::ExecutionContext>,
    commands: Vec<String>,
    settings: BatchSettings,
    progress: ProgressBar,
) -> GuardResult<Vec<SafetyReport>> {
    let permits = Arc::new(Semaphore::new(settings.jobs));
    let mut handles = Vec::with_capacity(commands.len());
    for command in commands {
        let orchestrator = Arc::clone(&orchestrator);
        let context = Arc::clone(&context);
        let permits = Arc::clone(&permits);
        let progress = progress.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|err| GuardError::internal(format!("batch semaphore closed: {err}")))?;
            let report = tokio::task::spawn_blocking(move || {
                orchestrator.run(
                    &command,
                    &context,
                    settings.max_attempts,
                    settings.auto_recover,
                )
            })
            .await
            .map_err(|err| GuardError::internal(format!("batch run panicked: {err}")))?;
            progress.inc(1);
            progress.set_message(report.subject.clone());
            Ok::<_, GuardError>(report)
        }));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        let report = handle
            .await
            .map_err(|err| GuardError::internal(format!("batch task failed: {err}")))??;
        reports.push(report);
    }
    tracing::info!(runs = reports.len(), "batch finished");
    Ok(reports)
}

fn progress_bar(len: usize, json: bool) -> ProgressBar {
    let bar = ProgressBar::new(u64::try_from(len).unwrap_or(u64::MAX));
    if json {
        bar.set_draw_target(ProgressDrawTarget::hidden());
    }
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

fn print_summary(reports: &[SafetyReport]) {
    for report in reports {
        match report.failure {
            None => eprintln!("  \x1b[32m✓\x1b[0m {} ({}ms)", report.subject, report.duration_ms),
            Some(kind) => eprintln!(
                "  \x1b[31m✗\x1b[0m {}: {} ({}ms)",
                report.subject,
                failure_label(kind),
                report.duration_ms
            ),
        }
    }
    let passed = reports.iter().filter(|report| report.success).count();
    eprintln!("batch: {passed}/{} succeeded", reports.len());
}

/// Zero when every run succeeded; a refusal anywhere wins over other failures.
fn batch_exit_code(reports: &[SafetyReport]) -> i32 {
    if reports
        .iter()
        .any(|report| report.failure == Some(FailureKind::SecurityViolation))
    {
        return 2;
    }
    reports
        .iter()
        .map(report_exit_code)
        .find(|code| *code != 0)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let text = "# setup\necho one\n\n   \n  echo two  \n#echo three\n";
        assert_eq!(parse_batch(text), vec!["echo one", "echo two"]);
    }

    #[test]
    fn empty_batch_has_no_commands() {
        assert!(parse_batch("# nothing\n\n").is_empty());
    }
}
