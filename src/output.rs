pub mod printer;

use crate::agenda::AgendaDocument;
use async_trait::async_trait;

pub use printer::ThermalPrinterSink;

/// Why a sink failed to deliver an agenda.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryFailure {
    /// Configuring the printer's serial line failed. Nothing was written.
    #[error("failed to configure serial line: {0}")]
    ConfigureLine(#[from] printer::LineSetupError),

    /// Writing the payload to the device failed.
    #[error("failed to write to printer: {0}")]
    Write(#[from] std::io::Error),
}

/// Outcome of handing an agenda to a sink.
#[derive(Debug)]
pub enum Delivery {
    Delivered,
    /// The agenda was only echoed to the log.
    Simulated,
    Failed(DeliveryFailure),
}

/// Something an agenda can be delivered to.
///
/// Sinks never return errors: failures are logged and reported through [`Delivery`] so that one
/// broken sink cannot keep the others from running.
#[async_trait]
pub trait OutputSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, document: &AgendaDocument) -> Delivery;
}

/// Writes the agenda to the log, one line per record.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

#[async_trait]
impl OutputSink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn deliver(&self, document: &AgendaDocument) -> Delivery {
        log::info!("{}", document.header());
        for line in document.body() {
            log::info!("{line}");
        }

        Delivery::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agenda::AgendaEntry;

    #[actix_rt::test]
    async fn console_sink_always_delivers() {
        let document = AgendaDocument {
            date_label: "Monday, March 4, 2024".into(),
            entries: vec![AgendaEntry {
                time_label: "02:00".into(),
                title: "Standup".into(),
            }],
        };

        assert!(matches!(
            ConsoleSink.deliver(&document).await,
            Delivery::Delivered
        ));
        assert_eq!(ConsoleSink.name(), "console");
    }

    #[test]
    fn failures_keep_their_cause() {
        let failure = DeliveryFailure::from(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "permission denied",
        ));

        assert_eq!(
            failure.to_string(),
            "failed to write to printer: permission denied"
        );
        let source = std::error::Error::source(&failure).unwrap();
        assert_eq!(source.to_string(), "permission denied");
    }
}
