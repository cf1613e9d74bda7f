//! Shared output helpers for CLI commands.

use console::style;

use crate::pipeline::{RunSummary, StageStatus, StageSummary};

/// Failed items listed per stage before the rest are counted.
const MAX_LISTED_FAILURES: usize = 20;

/// Truncate a string to max length, adding "..." if truncated.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

pub fn print_stage_summary(summary: &StageSummary) {
    let marker = match summary.status {
        StageStatus::Completed => style("✓").green(),
        StageStatus::Skipped => style("→").dim(),
        StageStatus::Failed(_) => style("✗").red(),
    };
    println!("{} {}", marker, summary);

    for (item, reason) in summary.failures.iter().take(MAX_LISTED_FAILURES) {
        println!("  {} {}: {}", style("✗").red(), truncate(item, 80), reason);
    }
    if summary.failures.len() > MAX_LISTED_FAILURES {
        println!(
            "  {} {} more failures",
            style("…").dim(),
            summary.failures.len() - MAX_LISTED_FAILURES
        );
    }
}

pub fn print_run_summary(run: &RunSummary) {
    println!();
    println!("{}", style("Pipeline summary").bold());
    println!("{}", "-".repeat(40));
    for stage in &run.stages {
        print_stage_summary(stage);
    }
    println!(
        "{:<20} {:.1}s",
        "Total time:",
        run.total_elapsed().as_secs_f64()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("kratko", 10), "kratko");
        assert_eq!(truncate("dugačak naslov oglasa", 10), "dugačak...");
    }
}
