//! Tracing capture for unit tests.

use parking_lot::Mutex;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
    subscriber::DefaultGuard,
};
use tracing_subscriber::{
    layer::{Context, SubscriberExt},
    Layer,
};

pub type Fields = HashMap<String, String>;

/// Records every event emitted while installed as the thread's default
/// subscriber.
#[derive(Clone, Default)]
pub struct CapturedEvents {
    events: Arc<Mutex<Vec<(Level, Fields)>>>,
}

impl CapturedEvents {
    pub fn set_default(&self) -> DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn errors(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(level, _)| *level == Level::ERROR)
            .count()
    }

    pub fn last_error(&self) -> Option<Fields> {
        self.events
            .lock()
            .iter()
            .rev()
            .find(|(level, _)| *level == Level::ERROR)
            .map(|(_, fields)| fields.clone())
    }

    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|(_, fields)| fields.get("message").cloned())
            .collect()
    }
}

impl<S: Subscriber> Layer<S> for CapturedEvents {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.events
            .lock()
            .push((*event.metadata().level(), visitor.0));
    }
}

#[derive(Default)]
struct FieldVisitor(Fields);

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}
