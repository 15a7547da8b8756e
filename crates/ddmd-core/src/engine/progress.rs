/// Events emitted while a run advances.
///
/// With several domains only the master reports step events, so a callback
/// sees each step once.
#[derive(Debug, Clone)]
pub enum Progress {
    PhaseStart { name: &'static str },
    PhaseFinish,

    StepsStart { total_steps: u64 },
    StepComplete { step: u64, exchanged: bool },
    StepsFinish,

    Message(String),
}

pub type ProgressCallback<'a> = Box<dyn Fn(Progress) + Send + Sync + 'a>;

#[derive(Default)]
pub struct ProgressReporter<'a> {
    callback: Option<ProgressCallback<'a>>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: ProgressCallback<'a>) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    #[inline]
    pub fn report(&self, event: Progress) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn reporter_forwards_events_to_callback() {
        let seen = Mutex::new(Vec::new());
        let reporter = ProgressReporter::with_callback(Box::new(|event| {
            if let Progress::StepComplete { step, .. } = event {
                seen.lock().unwrap().push(step);
            }
        }));
        reporter.report(Progress::StepsStart { total_steps: 2 });
        reporter.report(Progress::StepComplete { step: 1, exchanged: false });
        reporter.report(Progress::StepComplete { step: 2, exchanged: true });
        drop(reporter);
        assert_eq!(seen.into_inner().unwrap(), vec![1, 2]);
    }

    #[test]
    fn silent_reporter_ignores_events() {
        let reporter = ProgressReporter::new();
        reporter.report(Progress::Message("ignored".into()));
    }
}
