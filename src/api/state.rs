use chrono::{DateTime, Utc};

use crate::scheduler::Scheduler;
use crate::session::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub sessions: SessionStore,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(scheduler: Scheduler) -> Self {
        let sessions = scheduler.orchestrator().store().clone();
        Self {
            scheduler,
            sessions,
            started_at: Utc::now(),
        }
    }
}
