//! Progress reporting passed explicitly into every phase.

use std::fmt::{Display, Formatter};

/// Pipeline phase a progress event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Clustering,
    IsotopeMapping,
    AdductEnumeration,
    Scoring,
    GibbsSampling,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Clustering => write!(f, "clustering"),
            Phase::IsotopeMapping => write!(f, "isotope mapping"),
            Phase::AdductEnumeration => write!(f, "adduct enumeration"),
            Phase::Scoring => write!(f, "annotation scoring"),
            Phase::GibbsSampling => write!(f, "gibbs sampling"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    Started { phase: Phase, total: usize },
    Advanced { phase: Phase, done: usize, total: usize },
    Finished { phase: Phase },
}

/// Receiver of progress events. Must be shareable with worker threads.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);

    fn started(&self, phase: Phase, total: usize) {
        self.report(ProgressEvent::Started { phase, total });
    }

    fn advanced(&self, phase: Phase, done: usize, total: usize) {
        self.report(ProgressEvent::Advanced { phase, done, total });
    }

    fn finished(&self, phase: Phase) {
        self.report(ProgressEvent::Finished { phase });
    }
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Forwards phase boundaries to the `log` facade at info level and
/// intermediate steps at debug level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { phase, total } => log::info!("{phase}: started ({total} items)"),
            ProgressEvent::Advanced { phase, done, total } => log::debug!("{phase}: {done}/{total}"),
            ProgressEvent::Finished { phase } => log::info!("{phase}: finished"),
        }
    }
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Mutex;

    #[test]
    fn test_closure_sink_forwards_to_channel() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let sink = move |event: ProgressEvent| {
            let _ = tx.lock().map(|tx| tx.send(event));
        };

        sink.started(Phase::Scoring, 3);
        sink.advanced(Phase::Scoring, 3, 3);
        sink.finished(Phase::Scoring);

        let events: Vec<ProgressEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ProgressEvent::Started { phase: Phase::Scoring, total: 3 });
        assert_eq!(events[2], ProgressEvent::Finished { phase: Phase::Scoring });
    }
}
