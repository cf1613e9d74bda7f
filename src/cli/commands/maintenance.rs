//! Proxy testing and checkpoint cleanup.

use std::path::PathBuf;
use std::sync::Arc;

use console::style;

use crate::checkpoint::CheckpointStore;
use crate::config::Settings;
use crate::fetch::Classifier;
use crate::http_client::{browser_headers, resolve_user_agent, HttpClient, Transport};
use crate::pipeline::load_proxies;
use crate::proxy::{check_proxies, CheckOutcome};
use crate::storage::{date_stamp, today};

/// Check every configured proxy and optionally keep the working ones.
pub async fn cmd_proxies(
    settings: &Settings,
    url: Option<String>,
    concurrency: usize,
    save: Option<PathBuf>,
) -> anyhow::Result<()> {
    let proxies = load_proxies(settings).await?;
    if proxies.is_empty() {
        println!(
            "{} No proxies configured (set proxy.file or WEBSHARE_API_TOKEN)",
            style("!").yellow()
        );
        return Ok(());
    }

    let client = HttpClient::builder()
        .user_agent(&resolve_user_agent(settings.user_agent.as_deref()))
        .timeout(settings.request_timeout())
        .default_headers(browser_headers())
        .build()?;
    let transport: Arc<dyn Transport> = Arc::new(client);
    let classifier = Classifier::new(settings.classifier.clone());
    let test_url = url.unwrap_or_else(|| settings.check_url.clone());

    println!(
        "{} Testing {} proxies against {}",
        style("→").cyan(),
        proxies.len(),
        test_url
    );
    let results = check_proxies(
        transport,
        &classifier,
        &proxies,
        &test_url,
        concurrency,
        settings.request_timeout(),
    )
    .await;

    for result in &results {
        let (marker, detail) = match &result.outcome {
            CheckOutcome::Working => (style("✓").green(), "working".to_string()),
            CheckOutcome::Forbidden => (style("✗").red(), "forbidden".to_string()),
            CheckOutcome::Blocked(kind) => (style("✗").red(), format!("{} challenge", kind)),
            CheckOutcome::Failed(reason) => (style("✗").red(), reason.clone()),
        };
        println!(
            "  {} {:<40} {:>6}ms  {}",
            marker,
            result.proxy.masked(),
            result.elapsed.as_millis(),
            detail
        );
    }

    let working: Vec<&str> = results
        .iter()
        .filter(|r| r.is_working())
        .map(|r| r.proxy.url())
        .collect();
    println!(
        "{} {}/{} proxies working",
        style("✓").green(),
        working.len(),
        results.len()
    );

    if let Some(path) = save {
        let mut contents = working.join("\n");
        contents.push('\n');
        std::fs::write(&path, contents)?;
        println!(
            "  {} Saved working proxies to {}",
            style("→").dim(),
            path.display()
        );
    }
    Ok(())
}

/// Delete checkpoints and step markers not dated today (or all of them).
pub fn cmd_purge(settings: &Settings, all: bool) -> anyhow::Result<()> {
    let layout = settings.layout();
    let date = today();

    let checkpoint_dir = layout.checkpoint_dir();
    let mut removed = if all {
        let count = std::fs::read_dir(&checkpoint_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        match std::fs::remove_dir_all(&checkpoint_dir) {
            Ok(()) => count,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        }
    } else {
        CheckpointStore::open(&checkpoint_dir, date)?.purge_stale(date)?
    };

    let keep = format!("pipeline_checkpoint_{}.txt", date_stamp(date));
    if let Ok(entries) = std::fs::read_dir(&layout.data_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_marker = name.starts_with("pipeline_checkpoint_") && name.ends_with(".txt");
            if is_marker && (all || name != keep) {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
    }

    println!(
        "{} Removed {} checkpoint files from {}",
        style("✓").green(),
        removed,
        layout.data_dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purge_keeps_today() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::with_data_dir(dir.path().to_path_buf());
        let layout = settings.layout();
        layout.ensure_directories().unwrap();

        let today_marker = layout.pipeline_checkpoint(today());
        std::fs::write(&today_marker, "2").unwrap();
        std::fs::write(layout.data_dir.join("pipeline_checkpoint_2020-01-01.txt"), "1").unwrap();

        cmd_purge(&settings, false).unwrap();
        assert!(today_marker.exists());
        assert!(!layout.data_dir.join("pipeline_checkpoint_2020-01-01.txt").exists());

        cmd_purge(&settings, true).unwrap();
        assert!(!today_marker.exists());
        assert!(!layout.checkpoint_dir().exists());
    }
}
