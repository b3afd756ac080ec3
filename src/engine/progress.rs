use std::sync::mpsc::Sender;

use log::info;

use crate::engine::state::{ProgressEvent, UpgradeOutcome, UpgradeStage};

/// Human-readable lines for a single run, optionally mirrored to an observer.
///
/// Each run creates its own log; nothing here is shared between runs.
#[derive(Debug, Default)]
pub struct ProgressLog {
    lines: Vec<String>,
    observer: Option<Sender<ProgressEvent>>,
}

impl ProgressLog {
    pub fn new(observer: Option<Sender<ProgressEvent>>) -> Self {
        Self {
            lines: Vec::new(),
            observer,
        }
    }

    pub fn enter(&mut self, stage: UpgradeStage) {
        self.send(ProgressEvent::Stage(stage));
        if let Some(line) = stage.start_line() {
            self.push(line);
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!("upgrade: {line}");
        self.send(ProgressEvent::Line(line.clone()));
        self.lines.push(line);
    }

    pub fn download(&self, downloaded: u64, total: Option<u64>) {
        self.send(ProgressEvent::Download { downloaded, total });
    }

    pub fn finish(&self, outcome: &UpgradeOutcome) {
        self.send(ProgressEvent::Finished(outcome.clone()));
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    fn send(&self, event: ProgressEvent) {
        // A dropped receiver only means nobody is watching.
        if let Some(tx) = &self.observer {
            tx.send(event).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn lines_reach_observer_in_order() {
        let (tx, rx) = mpsc::channel();
        let mut log = ProgressLog::new(Some(tx));
        log.enter(UpgradeStage::Preflight);
        log.push("all good");

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                ProgressEvent::Stage(UpgradeStage::Preflight),
                ProgressEvent::Line("Checking current install area for expected files...".into()),
                ProgressEvent::Line("all good".into()),
            ]
        );
        assert_eq!(log.lines().len(), 2);
    }

    #[test]
    fn dropped_observer_does_not_stop_logging() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let mut log = ProgressLog::new(Some(tx));
        log.push("still recorded");
        assert_eq!(log.into_lines(), vec!["still recorded".to_owned()]);
    }
}
