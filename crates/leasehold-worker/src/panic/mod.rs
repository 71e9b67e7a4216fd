//! Panic reporting: spool, remote mark, operator alert, replay.

pub mod alert;
pub mod notifier;
pub mod reporter;
pub mod spool;

pub use alert::format_alert;
pub use notifier::{LogNotifier, Notifier, NotifyError, WebhookNotifier};
pub use reporter::{
    DeliveryOutcome, PanicReport, PanicReporter, ReplaySummary, ReporterConfig,
};
pub use spool::{PanicSpool, SpoolRecord};
