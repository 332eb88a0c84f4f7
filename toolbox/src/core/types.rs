//! Outcome types shared by every reconciler.

use super::descriptor::ServiceKind;

/// Result of reconciling one descriptor during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationOutcome {
    /// Observed state already matched; nothing was mutated.
    Unchanged,
    /// At least one action was taken to converge.
    Converged,
    /// Reconciliation of this service stopped; other services were unaffected.
    Failed(String),
}

impl ReconciliationOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ReconciliationOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReport {
    pub name: String,
    pub kind: ServiceKind,
    pub outcome: ReconciliationOutcome,
}

/// Outcomes of a full pass, in evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub services: Vec<ServiceReport>,
}

impl PassReport {
    pub fn record(&mut self, name: &str, kind: ServiceKind, outcome: ReconciliationOutcome) {
        self.services.push(ServiceReport {
            name: name.to_string(),
            kind,
            outcome,
        });
    }

    pub fn outcome_of(&self, name: &str) -> Option<&ReconciliationOutcome> {
        self.services
            .iter()
            .find(|report| report.name == name)
            .map(|report| &report.outcome)
    }

    pub fn converged(&self) -> usize {
        self.count(|o| matches!(o, ReconciliationOutcome::Converged))
    }

    pub fn unchanged(&self) -> usize {
        self.count(|o| matches!(o, ReconciliationOutcome::Unchanged))
    }

    pub fn failed(&self) -> usize {
        self.count(ReconciliationOutcome::is_failed)
    }

    fn count(&self, pred: impl Fn(&ReconciliationOutcome) -> bool) -> usize {
        self.services.iter().filter(|r| pred(&r.outcome)).count()
    }
}
