use crate::error::WardenError;

/// Result of one per-inbound call inside a fan-out.
#[derive(Debug)]
pub struct ItemOutcome {
    pub inbound_id: i64,
    pub tg_id: i64,
    pub email: String,
    pub result: Result<(), WardenError>,
}

/// Per-item results of a fan-out over inbounds; a failed item never stops the rest.
#[derive(Debug, Default)]
pub struct BulkReport {
    pub outcomes: Vec<ItemOutcome>,
}

impl BulkReport {
    pub fn push(&mut self, outcome: ItemOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    /// Collapses the report into an error when any item failed.
    pub fn into_result(self) -> Result<Self, WardenError> {
        if self.is_clean() {
            return Ok(self);
        }
        let details = self
            .failures()
            .filter_map(|o| o.result.as_ref().err().map(|e| format!("inbound {} ({}): {}", o.inbound_id, o.email, e)))
            .collect::<Vec<_>>()
            .join("; ");
        Err(WardenError::PartialUpdate {
            failed: self.failed(),
            total: self.outcomes.len(),
            details,
        })
    }
}
