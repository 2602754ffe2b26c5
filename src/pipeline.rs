use crate::agenda::{self, AgendaDocument};
use crate::auth::{AuthorizationFlow, Authorizer, GoogleOAuthClient};
use crate::calendar::{AgendaFetcher, GoogleCalendarEventSource};
use crate::output::{ConsoleSink, Delivery, OutputSink, ThermalPrinterSink};
use crate::scheduler::ScheduledJob;
use crate::{AppConfig, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;

/// Authorize, fetch the day's events, render them and hand the agenda to every sink.
pub struct Pipeline {
    authorization: AuthorizationFlow,
    fetcher: AgendaFetcher,
    timezone: Tz,
    sinks: Vec<Box<dyn OutputSink>>,
}

impl Pipeline {
    pub fn new(
        authorization: AuthorizationFlow,
        fetcher: AgendaFetcher,
        timezone: Tz,
        sinks: Vec<Box<dyn OutputSink>>,
    ) -> Pipeline {
        Pipeline {
            authorization,
            fetcher,
            timezone,
            sinks,
        }
    }

    /// Wires the Google backed pipeline with the console and thermal printer sinks.
    pub fn from_config(config: &AppConfig) -> Result<Pipeline> {
        let timeout = Duration::from_secs(config.calendar.request_timeout_secs);
        let authorizer: Arc<dyn Authorizer> = Arc::new(GoogleOAuthClient::new(timeout)?);

        let authorization = AuthorizationFlow::new(config.auth.clone(), authorizer.clone());
        let fetcher =
            AgendaFetcher::new(GoogleCalendarEventSource::new(&config.calendar, authorizer));
        let sinks: Vec<Box<dyn OutputSink>> = vec![
            Box::new(ConsoleSink),
            Box::new(ThermalPrinterSink::from_config(&config.printer)),
        ];

        Ok(Pipeline::new(
            authorization,
            fetcher,
            config.calendar.timezone,
            sinks,
        ))
    }

    /// Runs the pipeline for the current local day.
    pub async fn run_once(&self) -> Result<AgendaDocument> {
        self.run_at(Local::now()).await
    }

    /// Runs the pipeline for the day containing `reference`, in `reference`'s timezone.
    ///
    /// Authorization and fetch errors abort the run before any sink is invoked. Sink failures
    /// are logged and never abort the run.
    pub async fn run_at<Z: TimeZone>(&self, reference: DateTime<Z>) -> Result<AgendaDocument> {
        let credential = self.authorization.authorize().await?;
        let events = self.fetcher.fetch(&credential, &reference).await?;

        let document = agenda::render(&events, reference.date_naive(), self.timezone);

        for sink in &self.sinks {
            match sink.deliver(&document).await {
                Delivery::Failed(failure) => {
                    log::warn!("{} sink did not deliver the agenda: {failure}", sink.name())
                }
                delivery => log::debug!("{} sink: {delivery:?}", sink.name()),
            }
        }

        Ok(document)
    }
}

#[async_trait]
impl ScheduledJob for Pipeline {
    async fn run(&self) -> Result<()> {
        self.run_once().await.map(|_| ())
    }
}
