pub mod google;

use crate::auth::{Authorizer, Credential};
use crate::{CalendarConfig, Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use google::{CredentialTokenSource, GoogleCalendarClient};
use std::ops::Range;
use std::sync::Arc;

/// When an event starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStart {
    /// A timed event starting at an instant.
    DateTime(DateTime<Utc>),
    /// An all-day event on a calendar date.
    AllDay(NaiveDate),
}

/// Represents a single calendar event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub start: EventStart,
    pub summary: Option<String>,
}

impl CalendarEvent {
    /// A timed event.
    pub fn timed(start: DateTime<Utc>, summary: Option<&str>) -> CalendarEvent {
        CalendarEvent {
            start: EventStart::DateTime(start),
            summary: summary.map(Into::into),
        }
    }

    /// An all-day event.
    pub fn all_day(date: NaiveDate, summary: Option<&str>) -> CalendarEvent {
        CalendarEvent {
            start: EventStart::AllDay(date),
            summary: summary.map(Into::into),
        }
    }

    /// Converts an API event. Events without any start are dropped.
    fn from_google(ev: google::models::Event) -> Option<CalendarEvent> {
        let start = ev.start?;
        let start = match (start.date_time, start.date) {
            (Some(date_time), _) => EventStart::DateTime(date_time.with_timezone(&Utc)),
            (None, Some(date)) => EventStart::AllDay(date),
            (None, None) => return None,
        };

        Some(CalendarEvent {
            start,
            summary: ev.summary,
        })
    }
}

/// Trait that needs to be implemented by a source of calendar events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetches the events starting within `range`, ordered by start time, with recurring events
    /// expanded into single instances.
    async fn fetch_events(
        &self,
        credential: &Credential,
        range: Range<DateTime<Utc>>,
    ) -> Result<Vec<CalendarEvent>>;
}

/// An `EventSource` that returns events from a static list.
pub struct StaticEventSource {
    events: Vec<CalendarEvent>,
}

impl StaticEventSource {
    /// Creates a new `StaticEventSource` from an iterator.
    pub fn new<I>(iter: I) -> StaticEventSource
    where
        I: IntoIterator,
        I::Item: Into<CalendarEvent>,
    {
        StaticEventSource {
            events: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl EventSource for StaticEventSource {
    async fn fetch_events(
        &self,
        _credential: &Credential,
        _range: Range<DateTime<Utc>>,
    ) -> Result<Vec<CalendarEvent>> {
        Ok(self.events.clone())
    }
}

/// Reads events from a Google calendar.
pub struct GoogleCalendarEventSource {
    base_url: String,
    calendar_id: String,
    timeout: std::time::Duration,
    authorizer: Arc<dyn Authorizer>,
}

impl GoogleCalendarEventSource {
    pub fn new(config: &CalendarConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        GoogleCalendarEventSource::with_base_url(google::GOOGLE_CALENDAR_API, config, authorizer)
    }

    pub fn with_base_url(
        base_url: &str,
        config: &CalendarConfig,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        GoogleCalendarEventSource {
            base_url: base_url.to_owned(),
            calendar_id: config.calendar_id.clone(),
            timeout: std::time::Duration::from_secs(config.request_timeout_secs),
            authorizer,
        }
    }
}

#[async_trait]
impl EventSource for GoogleCalendarEventSource {
    async fn fetch_events(
        &self,
        credential: &Credential,
        range: Range<DateTime<Utc>>,
    ) -> Result<Vec<CalendarEvent>> {
        // A fresh client per fetch, so access tokens never outlive a single run.
        let token_source = CredentialTokenSource::new(self.authorizer.clone(), credential.clone());
        let client = GoogleCalendarClient::new(
            &self.base_url,
            &self.calendar_id,
            self.timeout,
            Arc::new(token_source),
        )?;

        let mut events = Vec::new();
        let mut page_token = None;

        loop {
            let (items, next_page_token) = client
                .get_events(Some(range.clone()), page_token)
                .await?;

            events.extend(items.into_iter().filter_map(CalendarEvent::from_google));

            match next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(events)
    }
}

#[async_trait]
impl<T> EventSource for Box<T>
where
    T: EventSource + ?Sized,
{
    async fn fetch_events(
        &self,
        credential: &Credential,
        range: Range<DateTime<Utc>>,
    ) -> Result<Vec<CalendarEvent>> {
        (**self).fetch_events(credential, range).await
    }
}

#[async_trait]
impl<T> EventSource for Arc<T>
where
    T: EventSource + ?Sized,
{
    async fn fetch_events(
        &self,
        credential: &Credential,
        range: Range<DateTime<Utc>>,
    ) -> Result<Vec<CalendarEvent>> {
        (**self).fetch_events(credential, range).await
    }
}

/// The half-open window `[start of day, start of day + 24h)` containing `reference`, where the
/// day is taken in `reference`'s timezone.
///
/// If local midnight falls into a DST gap the day starts at the first local minute that exists.
pub fn day_window<Tz: TimeZone>(reference: &DateTime<Tz>) -> Result<Range<DateTime<Utc>>> {
    let date = reference.date_naive();
    let midnight = date.and_hms_opt(0, 0, 0).ok_or(Error::InvalidDay(date))?;
    let timezone = reference.timezone();

    let start = (0..24 * 60)
        .map(|minutes| midnight + Duration::minutes(minutes))
        .take_while(|local| local.date() == date)
        .find_map(|local| local.and_local_timezone(timezone.clone()).earliest())
        .ok_or(Error::InvalidDay(date))?
        .with_timezone(&Utc);

    Ok(start..start + Duration::hours(24))
}

/// Retrieves the events of the day.
#[derive(Clone)]
pub struct AgendaFetcher {
    event_source: Arc<dyn EventSource>,
}

impl AgendaFetcher {
    pub fn new<T>(event_source: T) -> AgendaFetcher
    where
        T: EventSource + 'static,
    {
        AgendaFetcher {
            event_source: Arc::new(event_source),
        }
    }

    /// Fetches the events starting on the day of `reference`. Remote errors are returned as is.
    pub async fn fetch<Tz: TimeZone>(
        &self,
        credential: &Credential,
        reference: &DateTime<Tz>,
    ) -> Result<Vec<CalendarEvent>> {
        let window = day_window(reference)?;

        log::debug!("fetching events between {} and {}", window.start, window.end);

        let events = self.event_source.fetch_events(credential, window).await?;

        log::info!("fetched {} events for {}", events.len(), reference.date_naive());

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::FakeAuthorizer;
    use crate::auth::ClientIdentity;
    use chrono_tz::America::Denver;
    use std::sync::Mutex;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credential() -> Credential {
        Credential::authorized_user(
            ClientIdentity {
                client_id: "id".into(),
                client_secret: "secret".into(),
            },
            "stored".into(),
        )
    }

    fn config() -> CalendarConfig {
        CalendarConfig {
            calendar_id: "primary".into(),
            timezone: Denver,
            request_timeout_secs: 5,
        }
    }

    /// Records the windows it was queried with.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<Range<DateTime<Utc>>>>);

    #[async_trait]
    impl EventSource for Recorder {
        async fn fetch_events(
            &self,
            _credential: &Credential,
            range: Range<DateTime<Utc>>,
        ) -> Result<Vec<CalendarEvent>> {
            self.0.lock().unwrap().push(range);
            Ok(vec![])
        }
    }

    #[test]
    fn window_in_local_day() {
        let reference = Denver.with_ymd_and_hms(2024, 3, 4, 23, 30, 0).unwrap();
        let window = day_window(&reference).unwrap();

        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 3, 4, 7, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2024, 3, 5, 7, 0, 0).unwrap());
        assert!(window.contains(&reference.with_timezone(&Utc)));
        assert!(!window.contains(&window.end));
    }

    #[test]
    fn window_is_24_hours_on_dst_change() {
        let reference = Denver.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let window = day_window(&reference).unwrap();

        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 3, 10, 7, 0, 0).unwrap());
        assert_eq!(window.end - window.start, Duration::hours(24));
    }

    #[test]
    fn window_starts_after_midnight_gap() {
        use chrono_tz::America::Santiago;

        // Clocks jump from 00:00 to 01:00 local time.
        let reference = Santiago.with_ymd_and_hms(2024, 9, 8, 9, 0, 0).unwrap();
        let window = day_window(&reference).unwrap();

        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 9, 8, 4, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2024, 9, 9, 4, 0, 0).unwrap());
        assert_eq!(
            window.start.with_timezone(&Santiago).naive_local(),
            NaiveDate::from_ymd_opt(2024, 9, 8)
                .unwrap()
                .and_hms_opt(1, 0, 0)
                .unwrap()
        );
        assert!(window.contains(&reference.with_timezone(&Utc)));
    }

    #[actix_rt::test]
    async fn fetch_queries_day_window() {
        let recorder = Arc::new(Recorder::default());
        let fetcher = AgendaFetcher::new(recorder.clone());

        let reference = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        let events = fetcher.fetch(&credential(), &reference).await.unwrap();

        assert!(events.is_empty());
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
                    ..Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn google_source_follows_pages() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/calendars/primary/events"))
            .and(query_param("pageToken", "page-2"))
            .and(header("authorization", "Bearer fresh-stored"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"summary": "Lunch", "start": {"dateTime": "2024-03-04T12:00:00-07:00"}},
                    {"summary": "Broken"}
                ]
            })))
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/calendars/primary/events"))
            .and(query_param("singleEvents", "true"))
            .and(query_param("orderBy", "startTime"))
            .and(query_param("timeMin", "2024-03-04T07:00:00Z"))
            .and(query_param("timeMax", "2024-03-05T07:00:00Z"))
            .and(header("authorization", "Bearer fresh-stored"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "nextPageToken": "page-2",
                "items": [
                    {"start": {"date": "2024-03-04"}},
                    {"summary": "Standup", "start": {"dateTime": "2024-03-04T09:00:00Z"}}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let authorizer = Arc::new(FakeAuthorizer::default());
        let source =
            GoogleCalendarEventSource::with_base_url(&server.uri(), &config(), authorizer.clone());

        let reference = Denver.with_ymd_and_hms(2024, 3, 4, 6, 0, 0).unwrap();
        let events = AgendaFetcher::new(source)
            .fetch(&credential(), &reference)
            .await
            .unwrap();

        assert_eq!(
            events,
            vec![
                CalendarEvent::all_day(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(), None),
                CalendarEvent::timed(
                    Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap(),
                    Some("Standup")
                ),
                CalendarEvent::timed(
                    Utc.with_ymd_and_hms(2024, 3, 4, 19, 0, 0).unwrap(),
                    Some("Lunch")
                ),
            ]
        );
        // Both pages share one access token.
        assert_eq!(FakeAuthorizer::count(&authorizer.refreshes), 1);
    }

    #[tokio::test]
    async fn google_source_propagates_remote_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let source = GoogleCalendarEventSource::with_base_url(
            &server.uri(),
            &config(),
            Arc::new(FakeAuthorizer::default()),
        );

        let reference = Denver.with_ymd_and_hms(2024, 3, 4, 6, 0, 0).unwrap();
        let err = AgendaFetcher::new(source)
            .fetch(&credential(), &reference)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Calendar(_)));
    }
}
