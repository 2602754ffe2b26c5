use crate::calendar::{CalendarEvent, EventStart};
use chrono::NaiveDate;
use chrono_tz::Tz;
use std::fmt;

/// Body line of an agenda without any events.
pub const NO_EVENTS: &str = "No events scheduled for today.";

/// Title used for events without a summary.
pub const UNTITLED: &str = "(No title)";

/// Time label used for all-day events.
pub const ALL_DAY: &str = "All day";

/// One line of the agenda.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgendaEntry {
    pub time_label: String,
    pub title: String,
}

impl fmt::Display for AgendaEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} - {}", self.time_label, self.title)
    }
}

/// The rendered agenda of a single day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgendaDocument {
    pub date_label: String,
    pub entries: Vec<AgendaEntry>,
}

impl AgendaDocument {
    pub fn header(&self) -> String {
        format!("Today's agenda ({}):", self.date_label)
    }

    /// The body lines. Never empty: an agenda without entries says so explicitly.
    pub fn body(&self) -> Vec<String> {
        if self.entries.is_empty() {
            return vec![NO_EVENTS.to_owned()];
        }

        self.entries.iter().map(ToString::to_string).collect()
    }
}

impl fmt::Display for AgendaDocument {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", self.header())?;
        for line in self.body() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

fn time_label(start: &EventStart, timezone: Tz) -> String {
    match start {
        EventStart::DateTime(start) => start.with_timezone(&timezone).format("%H:%M").to_string(),
        // An all-day event has no instant to convert; it covers the whole local date.
        EventStart::AllDay(_) => ALL_DAY.to_owned(),
    }
}

fn title(summary: Option<&str>) -> String {
    match summary.map(str::trim) {
        Some(summary) if !summary.is_empty() => summary.to_owned(),
        _ => UNTITLED.to_owned(),
    }
}

/// Renders `events` into an agenda for `reference_date`, localizing times into `timezone`.
pub fn render(events: &[CalendarEvent], reference_date: NaiveDate, timezone: Tz) -> AgendaDocument {
    let entries = events
        .iter()
        .map(|event| AgendaEntry {
            time_label: time_label(&event.start, timezone),
            title: title(event.summary.as_deref()),
        })
        .collect();

    AgendaDocument {
        date_label: reference_date.format("%A, %B %-d, %Y").to_string(),
        entries,
    }
}
