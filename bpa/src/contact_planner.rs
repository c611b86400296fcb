use super::*;
use link::Contact;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Bad contact plan line {line}: {reason}")]
    BadLine { line: usize, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One scheduled contact window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub id: u32,
    pub dest: Eid,
    pub link_name: String,
    pub start: OffsetDateTime,
    pub duration: std::time::Duration,
}

/// An entry whose window has opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub entry: PlanEntry,
}

/// How stale an entry may be and still activate.
const ACTIVATION_WINDOW: time::Duration = time::Duration::seconds(5);

/// How often the worker looks at the head of the plan.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// A sorted list of contact-plan entries and the worker that opens links
/// at their start times.
///
/// The worker wakes every 100 ms and inspects the earliest entry: a start
/// time within `[now, now + 5 s]` of the past activates it (the entry is
/// removed, the link's contact marked active); an entry more than five
/// seconds stale is silently dropped.
pub struct ContactPlanner {
    entries: Mutex<Vec<PlanEntry>>,
    next_id: Mutex<u32>,
    manager: Arc<ContactManager>,
}

impl ContactPlanner {
    pub fn new(manager: Arc<ContactManager>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
            manager,
        })
    }

    /// Adds an entry, keeping the plan sorted by start time. Returns the
    /// assigned id.
    pub fn add(
        &self,
        dest: Eid,
        link_name: &str,
        start: OffsetDateTime,
        duration: std::time::Duration,
    ) -> u32 {
        let id = {
            let mut next = self.next_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        let mut entries = self.entries.lock().unwrap();
        entries.push(PlanEntry {
            id,
            dest,
            link_name: link_name.to_string(),
            start,
            duration,
        });
        entries.sort_by_key(|e| e.start);
        id
    }

    /// Deletes every entry with an id in `[lo, hi]`, returning the count.
    pub fn del_range(&self, lo: u32, hi: u32) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.id < lo || e.id > hi);
        before - entries.len()
    }

    pub fn reset(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn entries(&self) -> Vec<PlanEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Inspects the head of the plan at time `now`. At most one entry is
    /// consumed per call: either activated (returned) or, if stale,
    /// silently dropped.
    pub fn poll_front(&self, now: OffsetDateTime) -> Option<Activation> {
        let mut entries = self.entries.lock().unwrap();
        while let Some(front) = entries.first() {
            let age = now - front.start;
            if age < time::Duration::ZERO {
                // Not due yet
                return None;
            }
            let entry = entries.remove(0);
            if age <= ACTIVATION_WINDOW {
                return Some(Activation { entry });
            }
            info!(
                "dropping contact plan entry {} for {}: {age} past its start",
                entry.id, entry.link_name
            );
        }
        None
    }

    fn activate(&self, activation: Activation) {
        let entry = activation.entry;
        debug!(
            "contact plan entry {} opens link {}",
            entry.id, entry.link_name
        );
        self.manager.handle_contact_up(
            &entry.link_name,
            Contact {
                start: entry.start,
                duration: entry.duration,
            },
        );
    }

    /// The worker loop: poll the plan head every 100 ms until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    while let Some(activation) = self.poll_front(OffsetDateTime::now_utc()) {
                        self.activate(activation);
                    }
                }
            }
        }
    }

    /// Parses a contact plan from CSV text:
    /// `eid,link-name,YYYY:DDD:HH:MM:SS,duration-seconds`, where `#`
    /// starts a comment line and blank lines are ignored.
    pub fn import_csv(&self, text: &str) -> Result<usize, PlanError> {
        let mut added = 0;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [eid, link_name, start, duration] = fields.as_slice() else {
                return Err(PlanError::BadLine {
                    line: lineno + 1,
                    reason: "expected 4 comma-separated fields".to_string(),
                });
            };
            let dest: Eid = eid.parse().map_err(|e| PlanError::BadLine {
                line: lineno + 1,
                reason: format!("bad EID: {e}"),
            })?;
            let start = parse_timestamp(start).ok_or_else(|| PlanError::BadLine {
                line: lineno + 1,
                reason: "bad timestamp, expected YYYY:DDD:HH:MM:SS".to_string(),
            })?;
            let duration: u64 = duration.parse().map_err(|_| PlanError::BadLine {
                line: lineno + 1,
                reason: "bad duration".to_string(),
            })?;
            self.add(
                dest,
                link_name,
                start,
                std::time::Duration::from_secs(duration),
            );
            added += 1;
        }
        Ok(added)
    }

    /// Serialises the plan back to the CSV import format.
    pub fn export_csv(&self) -> String {
        let mut out = String::new();
        for entry in self.entries() {
            out.push_str(&format!(
                "{},{},{},{}\n",
                entry.dest,
                entry.link_name,
                format_timestamp(entry.start),
                entry.duration.as_secs(),
            ));
        }
        out
    }
}

/// `YYYY:DDD:HH:MM:SS` with DDD the ordinal day of year.
fn parse_timestamp(s: &str) -> Option<OffsetDateTime> {
    let parts: Vec<&str> = s.split(':').collect();
    let [year, ordinal, hour, minute, second] = parts.as_slice() else {
        return None;
    };
    let date =
        time::Date::from_ordinal_date(year.parse().ok()?, ordinal.parse().ok()?).ok()?;
    let time =
        time::Time::from_hms(hour.parse().ok()?, minute.parse().ok()?, second.parse().ok()?)
            .ok()?;
    Some(date.with_time(time).assume_utc())
}

fn format_timestamp(t: OffsetDateTime) -> String {
    format!(
        "{:04}:{:03}:{:02}:{:02}:{:02}",
        t.year(),
        t.ordinal(),
        t.hour(),
        t.minute(),
        t.second()
    )
}
