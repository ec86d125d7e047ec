use crate::domain::audit::{AuditEntry, AuditEvent, AuditSubject};
use crate::domain::ports::{DynAuditLog, DynClock};
use tracing::error;

/// Writes audit entries stamped with the service clock.
///
/// State has already changed by the time an entry is recorded, so a failed
/// append is logged and swallowed rather than reported as a failure of the
/// transition itself.
#[derive(Clone)]
pub struct Auditor {
    log: DynAuditLog,
    clock: DynClock,
}

impl Auditor {
    pub fn new(log: DynAuditLog, clock: DynClock) -> Self {
        Self { log, clock }
    }

    pub async fn record(&self, subject: AuditSubject, event: AuditEvent) {
        let entry = AuditEntry::new(self.clock.now(), subject, event);
        if let Err(e) = self.log.append(entry.clone()).await {
            error!(error = %e, subject = ?entry.subject, event = ?entry.event, "Failed to append audit entry");
        }
    }
}
