//! Progress bars driven by stage events.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::leaf::LeafEvent;
use crate::phones::PhoneEvent;

const EVENT_BUFFER: usize = 100;

fn bar(total: usize, message: String) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}")
            .unwrap()
            .progress_chars("█▓░"),
    );
    progress.set_message(message);
    progress
}

/// Spawn a renderer for leaf events. Drop the sender, then await the handle.
pub fn leaf_progress() -> (mpsc::Sender<LeafEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<LeafEvent>(EVENT_BUFFER);
    let handle = tokio::spawn(async move {
        let mut current: Option<ProgressBar> = None;
        while let Some(event) = rx.recv().await {
            match event {
                LeafEvent::Started { leaf_file, total } => {
                    if let Some(done) = current.take() {
                        done.finish_and_clear();
                    }
                    current = Some(bar(total, leaf_file));
                }
                LeafEvent::LeafSkipped { .. } => {
                    if let Some(ref progress) = current {
                        progress.inc(1);
                    }
                }
                LeafEvent::LeafHarvested {
                    leaf_url,
                    entries,
                    last_page,
                } => {
                    if let Some(ref progress) = current {
                        progress.set_message(format!(
                            "{} ({} entries, {} pages)",
                            leaf_url, entries, last_page
                        ));
                    }
                }
                LeafEvent::LeafCompleted {
                    leaf_url,
                    saved,
                    failed,
                    ..
                } => {
                    if let Some(ref progress) = current {
                        if failed > 0 {
                            progress.println(format!(
                                "{} {}: {} saved, {} failed",
                                style("✗").red(),
                                leaf_url,
                                saved,
                                failed
                            ));
                        }
                        progress.inc(1);
                    }
                }
                LeafEvent::SessionRefreshed { generation } => {
                    let line = format!("{} Session refreshed (#{})", style("↻").cyan(), generation);
                    match current {
                        Some(ref progress) => progress.println(line),
                        None => println!("{}", line),
                    }
                }
            }
        }
        if let Some(progress) = current {
            progress.finish_and_clear();
        }
    });
    (tx, handle)
}

/// Spawn a renderer for phone lookup events.
pub fn phone_progress() -> (mpsc::Sender<PhoneEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<PhoneEvent>(EVENT_BUFFER);
    let handle = tokio::spawn(async move {
        let mut current: Option<ProgressBar> = None;
        while let Some(event) = rx.recv().await {
            match event {
                PhoneEvent::Started { total, skipped } => {
                    current = Some(bar(total, format!("{} already stored", skipped)));
                }
                PhoneEvent::ItemStored { .. } => {
                    if let Some(ref progress) = current {
                        progress.inc(1);
                    }
                }
                PhoneEvent::BatchRetried {
                    first_id,
                    generation,
                } => {
                    if let Some(ref progress) = current {
                        progress.println(format!(
                            "{} Session expired, retrying batch from {} (#{})",
                            style("↻").cyan(),
                            first_id,
                            generation
                        ));
                    }
                }
            }
        }
        if let Some(progress) = current {
            progress.finish_and_clear();
        }
    });
    (tx, handle)
}
