use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistrationReport {
    pub registered: usize,
    pub denied: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchReport {
    /// Requests that matched at least one rule and moved to TO_SEND.
    pub matched: usize,
    /// Requests no rule matched; deleted.
    pub discarded: usize,
    /// Matcher evaluations that failed and counted as a non-match.
    pub matcher_errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    pub job_id: Option<Uuid>,
    pub recipients: usize,
    /// (request, recipient) pairs delivered.
    pub delivered: usize,
    /// (request, recipient) pairs that failed and now carry a recipient error.
    pub errored: usize,
    /// Failed pairs of fire-and-forget recipients, dropped without retry.
    pub dropped: usize,
    /// Requests fully delivered and deleted.
    pub completed: usize,
}

impl DispatchReport {
    pub fn merge(&mut self, other: &DispatchReport) {
        self.recipients += other.recipients;
        self.delivered += other.delivered;
        self.errored += other.errored;
        self.dropped += other.dropped;
        self.completed += other.completed;
    }
}
