// Callback recorder shared by the adapter and orchestrator tests.

use super::{SessionEvent, VendorAdapter};
use crate::error::ErrorKind;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub(crate) struct Recorder {
    errors: Mutex<Vec<(ErrorKind, String)>>,
    events: Mutex<Vec<SessionEvent>>,
}

impl Recorder {
    pub(crate) fn attach(adapter: &dyn VendorAdapter) -> Arc<Self> {
        let recorder = Arc::new(Self::default());
        let r = recorder.clone();
        adapter.set_error_callback(Arc::new(move |kind, message| {
            r.errors.lock().unwrap().push((kind, message.to_string()));
        }));
        let r = recorder.clone();
        adapter.set_completion_callback(Arc::new(move |event| {
            r.events.lock().unwrap().push(event.clone());
        }));
        recorder
    }

    pub(crate) fn error_kinds(&self) -> Vec<ErrorKind> {
        self.errors.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }

    pub(crate) fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count_events(&self, pred: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}
