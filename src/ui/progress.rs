use crate::persister::RefreshReport;
use crate::ui::progress_message::{ProgressMessage, ProgressPhase};
use crate::ui::{output_mode, palette};
use crate::ui::Icons;
use indicatif::{HumanDuration, MultiProgress, ProgressBar};
use owo_colors::OwoColorize;
use std::thread;
use std::time::Duration;

fn visible(bar: ProgressBar) -> ProgressBar {
    if output_mode().quiet {
        ProgressBar::hidden()
    } else {
        bar
    }
}

pub struct ProgressManager {
    mp: MultiProgress,
    saving: ProgressBar,
    _handle: thread::JoinHandle<()>,
}

impl ProgressManager {
    pub fn new(total_collections: usize) -> (Self, crossbeam::channel::Sender<ProgressMessage>) {
        let (tx, rx) = crossbeam::channel::unbounded::<ProgressMessage>();

        let mp = MultiProgress::new();
        let scanning = visible(mp.add(ProgressBar::new_spinner().with_message("Scanning references")));
        let saving = visible(mp.add(ProgressBar::new(total_collections as u64).with_message("Saving collections")));
        let deferred = visible(mp.add(ProgressBar::new_spinner().with_message("Patching deferred attributes")));

        let scanning_clone = scanning.clone();
        let saving_clone = saving.clone();
        let deferred_clone = deferred.clone();

        let handle = thread::spawn(move || {
            for msg in rx {
                match msg {
                    ProgressMessage::Started {
                        phase: ProgressPhase::Scanning,
                        total: _,
                    } => {
                        scanning_clone.enable_steady_tick(Duration::from_millis(100));
                    }
                    ProgressMessage::Started {
                        phase: ProgressPhase::Saving,
                        total,
                    } => {
                        saving_clone.set_length(total as u64);
                    }
                    ProgressMessage::Started {
                        phase: ProgressPhase::Deferred,
                        total: _,
                    } => {
                        deferred_clone.enable_steady_tick(Duration::from_millis(100));
                    }
                    ProgressMessage::Layer { index, collections } => {
                        saving_clone.set_message(format!("Layer {}: {}", index, collections.join(", ")));
                    }
                    ProgressMessage::Progress {
                        phase: ProgressPhase::Saving,
                        current,
                        collection,
                    } => {
                        saving_clone.set_position(current as u64);
                        if let Some(ref c) = collection {
                            saving_clone.set_message(format!("Saved: {}", c));
                        }
                    }
                    ProgressMessage::Progress {
                        phase: ProgressPhase::Deferred,
                        current: _,
                        collection: Some(c),
                    } => {
                        deferred_clone.set_message(format!("Patching: {}", c));
                    }
                    ProgressMessage::Finished {
                        phase: ProgressPhase::Scanning,
                    } => {
                        scanning_clone.finish_with_message("Scanned");
                    }
                    ProgressMessage::Finished {
                        phase: ProgressPhase::Saving,
                    } => {
                        saving_clone.finish_with_message("Saved");
                    }
                    ProgressMessage::Finished {
                        phase: ProgressPhase::Deferred,
                    } => {
                        deferred_clone.finish_with_message("Patched");
                    }
                    ProgressMessage::Error(message) => {
                        saving_clone.abandon_with_message(message);
                    }
                    _ => {}
                }
            }
            deferred_clone.finish_and_clear();
        });

        (
            Self {
                mp,
                saving,
                _handle: handle,
            },
            tx,
        )
    }

    pub fn clear(&self) {
        self.mp.clear().ok();
    }

    pub fn finish_with_summary(&self, duration: Duration, report: &RefreshReport) {
        self.saving.finish();
        self.clear();
        println!();
        println!(
            "{} {}",
            Icons::CHECK.style(palette().ok),
            format!("Complete in {}", HumanDuration(duration)).style(palette().ok)
        );
        println!(
            "  {} {} collections  {} {} rows written  {} {} unconnected",
            Icons::PACKAGE.style(palette().accent),
            report.collections.len(),
            Icons::DATABASE.style(palette().accent),
            report.totals.changes(),
            Icons::LINK.style(palette().accent),
            report.unconnected.len() + report.unknown_targets.len()
        );
    }
}

pub struct Spinner {
    pb: ProgressBar,
}

impl Spinner {
    pub fn new(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_message(message.to_string());
        if !output_mode().quiet {
            pb.enable_steady_tick(Duration::from_millis(100));
        }
        Self { pb }
    }

    pub fn set_message(&self, msg: &str) {
        self.pb.set_message(msg.to_string());
    }

    pub fn finish_with_message(&self, msg: &str) {
        self.pb.finish_with_message(msg.to_string());
    }
}
