// Admin side of the kiosk: rosters, senior privileges, resets and manual
// check-ins. Everything here needs the session cookie from login().

use crate::error::AdminError;
use crate::protocol::{map_response, CheckInMode, CheckInResult};
use crate::timer::RefreshTimer;
use crate::transport::{Backend, HttpResponse};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const LOGIN_PATH: &str = "/checkin/adminLogin/";
const PERMS_PATH: &str = "/checkin/perms/";
const SP_ROSTER_PATH: &str = "/checkin/spStudents/";
const SENIORS_PATH: &str = "/checkin/allSeniors/";
const ENABLE_SP_PATH: &str = "/checkin/enableSp/";
const DISABLE_SP_PATH: &str = "/checkin/disableSp/";
const FORCE_RESET_PATH: &str = "/checkin/forceReset/";
const MANUAL_PATH: &str = "/checkin/runManual/";
const STUDENT_VIDEO_PATH: &str = "/checkin/studentVid/";

// What has to be typed before a force reset goes out.
pub const RESET_CONFIRMATION: &str = "YES";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudentStatus {
    CheckedIn,
    CheckedOut,
    Tentative,
    TentativeIn,
    TentativeOut,
    #[serde(alias = "nothing")]
    Absent,
}

impl StudentStatus {
    pub const ALL: [StudentStatus; 6] = [
        StudentStatus::CheckedIn,
        StudentStatus::CheckedOut,
        StudentStatus::Tentative,
        StudentStatus::TentativeIn,
        StudentStatus::TentativeOut,
        StudentStatus::Absent,
    ];

    pub fn wire_name(&self) -> &'static str {
        match self {
            StudentStatus::CheckedIn => "checked_in",
            StudentStatus::CheckedOut => "checked_out",
            StudentStatus::Tentative => "tentative",
            StudentStatus::TentativeIn => "tentative_in",
            StudentStatus::TentativeOut => "tentative_out",
            StudentStatus::Absent => "absent",
        }
    }
}

impl FromStr for StudentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        if wanted == "nothing" {
            return Ok(StudentStatus::Absent);
        }
        StudentStatus::ALL
            .iter()
            .find(|status| status.wire_name() == wanted)
            .copied()
            .ok_or_else(|| format!("Unknown status '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeBlock {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
}

impl FromStr for FreeBlock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "A" => Ok(FreeBlock::A),
            "B" => Ok(FreeBlock::B),
            "C" => Ok(FreeBlock::C),
            "D" => Ok(FreeBlock::D),
            "E" => Ok(FreeBlock::E),
            "F" => Ok(FreeBlock::F),
            "G" => Ok(FreeBlock::G),
            _ => Err(format!("'{}' is not a block (A-G)", s)),
        }
    }
}

impl fmt::Display for FreeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub email: String,
    pub status: StudentStatus,
    // Only senior privilege rows have this, e.g. "01:15 PM - 02:05 PM"
    #[serde(default)]
    pub date_str: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RosterQuery {
    Block(FreeBlock),
    SeniorPrivilege {
        from_date: Option<String>,
        to_date: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterFilter {
    pub status: Option<StudentStatus>,
    pub search: Option<String>,
}

impl RosterFilter {
    pub fn matches(&self, entry: &RosterEntry) -> bool {
        if let Some(status) = self.status {
            if entry.status != status {
                return false;
            }
        }
        match &self.search {
            Some(search) if !search.is_empty() => {
                let search = search.to_lowercase();
                entry.name.to_lowercase().contains(&search)
                    || entry.email.to_lowercase().contains(&search)
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Perms {
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub teacher_monitored: bool,
}

#[derive(Deserialize)]
struct SeniorRow {
    name: String,
    email: String,
    has_sp: bool,
}

// Which seniors currently have privileges. Only changes through
// AdminClient::toggle_sp, so it always mirrors what the server was told.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeniorPrivilegeRoster {
    names: BTreeMap<String, String>,
    has_sp: BTreeMap<String, bool>,
}

impl SeniorPrivilegeRoster {
    pub fn has_privilege(&self, email: &str) -> Option<bool> {
        self.has_sp.get(&email.to_lowercase()).copied()
    }

    pub fn name(&self, email: &str) -> Option<&str> {
        self.names.get(&email.to_lowercase()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.has_sp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.has_sp.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.has_sp.values().filter(|enabled| **enabled).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.has_sp.iter().map(|(email, enabled)| (email.as_str(), *enabled))
    }

    fn from_rows(rows: Vec<SeniorRow>) -> Self {
        let mut roster = SeniorPrivilegeRoster::default();
        for row in rows {
            let email = row.email.to_lowercase();
            roster.names.insert(email.clone(), row.name);
            roster.has_sp.insert(email, row.has_sp);
        }
        roster
    }

    fn apply(&mut self, enabled: bool, is_for: Option<&str>) {
        match is_for {
            Some(email) => {
                self.has_sp.insert(email.to_lowercase(), enabled);
            }
            None => self.has_sp.values_mut().for_each(|v| *v = enabled),
        }
    }
}

pub struct AdminClient<'a, B: Backend> {
    backend: &'a B,
}

impl<'a, B: Backend> AdminClient<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        AdminClient { backend }
    }

    pub fn login(&self, password: &str) -> Result<(), AdminError> {
        #[derive(Deserialize)]
        struct LoginBody {
            success: bool,
        }

        let response = self
            .backend
            .post_json(LOGIN_PATH, &json!({ "password": password }))?;
        let body: LoginBody = ok(response)?.json()?;
        if body.success {
            tracing::info!("Admin login succeeded");
            Ok(())
        } else {
            Err(AdminError::LoginRejected)
        }
    }

    pub fn perms(&self) -> Result<Perms, AdminError> {
        let response = self.backend.get(PERMS_PATH, &[])?;
        Ok(ok(response)?.json()?)
    }

    pub fn roster(&self, query: &RosterQuery) -> Result<Vec<RosterEntry>, AdminError> {
        let response = match query {
            RosterQuery::Block(block) => self
                .backend
                .get(&format!("/checkin/students/{}/", block), &[])?,
            RosterQuery::SeniorPrivilege { from_date, to_date } => {
                let mut params = Vec::new();
                if let Some(from) = from_date {
                    params.push(("from_date", from.as_str()));
                }
                if let Some(to) = to_date {
                    params.push(("to_date", to.as_str()));
                }
                self.backend.get(SP_ROSTER_PATH, &params)?
            }
        };
        Ok(ok(response)?.json()?)
    }

    pub fn seniors(&self) -> Result<SeniorPrivilegeRoster, AdminError> {
        let response = self.backend.get(SENIORS_PATH, &[])?;
        let rows: Vec<SeniorRow> = ok(response)?.json()?;
        Ok(SeniorPrivilegeRoster::from_rows(rows))
    }

    // No is_for means every senior at once.
    pub fn toggle_sp(
        &self,
        roster: &mut SeniorPrivilegeRoster,
        enabled: bool,
        is_for: Option<&str>,
    ) -> Result<(), AdminError> {
        self.require_admin()?;
        let path = if enabled { ENABLE_SP_PATH } else { DISABLE_SP_PATH };
        let response = match is_for {
            Some(email) => self.backend.post(path, &[("is_for", email)])?,
            None => self.backend.post(path, &[])?,
        };
        ok(response)?;
        roster.apply(enabled, is_for);
        tracing::info!(
            "Senior privileges {} for {}",
            if enabled { "enabled" } else { "disabled" },
            is_for.unwrap_or("everyone")
        );
        Ok(())
    }

    // The clip behind a tentative check-in, as the student uploaded it.
    pub fn student_video(&self, block: FreeBlock, email: &str) -> Result<Vec<u8>, AdminError> {
        let block_name = block.to_string();
        let response = self.backend.get(
            STUDENT_VIDEO_PATH,
            &[("free_block", block_name.as_str()), ("email", email)],
        )?;
        if response.status == 400 {
            return Err(AdminError::NoVideo {
                block: block_name,
                email: email.to_owned(),
            });
        }
        Ok(ok(response)?.body)
    }

    // Throws away every in-progress check-in for the current window.
    pub fn force_reset(&self, confirmation: &str) -> Result<(), AdminError> {
        if confirmation != RESET_CONFIRMATION {
            return Err(AdminError::Cancelled);
        }
        self.require_admin()?;
        ok(self.backend.get(FORCE_RESET_PATH, &[])?)?;
        tracing::warn!("Check-in state was force reset");
        Ok(())
    }

    // For students without a phone, at a kiosk a teacher is watching.
    pub fn manual_check_in(
        &self,
        email_or_id: &str,
        mode: CheckInMode,
    ) -> Result<CheckInResult, AdminError> {
        if !self.perms()?.teacher_monitored {
            return Err(AdminError::NotTeacherMonitored);
        }
        let response = self.backend.post_json(
            MANUAL_PATH,
            &json!({ "email_or_id": email_or_id, "mode": mode.wire_name() }),
        )?;
        Ok(map_response(&response))
    }

    fn require_admin(&self) -> Result<(), AdminError> {
        if self.perms()?.is_admin {
            Ok(())
        } else {
            Err(AdminError::NotAdmin)
        }
    }
}

fn ok(response: HttpResponse) -> Result<HttpResponse, AdminError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(AdminError::Status {
            status: response.status,
            message: response.text(),
        })
    }
}

// Keeps a roster fresh on a fixed cadence. Failed polls keep the last good
// roster around and try again next interval.
pub struct RosterMonitor<'a, B: Backend> {
    client: AdminClient<'a, B>,
    query: RosterQuery,
    interval: Duration,
    timer: RefreshTimer,
    entries: Option<Vec<RosterEntry>>,
    last_error: Option<String>,
}

impl<'a, B: Backend> RosterMonitor<'a, B> {
    pub fn new(backend: &'a B, query: RosterQuery, interval: Duration) -> Self {
        RosterMonitor {
            client: AdminClient::new(backend),
            query,
            interval,
            timer: RefreshTimer::new(),
            entries: None,
            last_error: None,
        }
    }

    pub fn timer(&self) -> &RefreshTimer {
        &self.timer
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    // Returns true if it polled.
    pub fn tick(&mut self, now: DateTime<Utc>) -> bool {
        let first_poll = self.entries.is_none() && self.timer.pending_count() == 0;
        if !first_poll && self.timer.fire(now).is_none() {
            return false;
        }

        match self.client.roster(&self.query) {
            Ok(entries) => {
                tracing::debug!("Roster refreshed, {} students", entries.len());
                self.entries = Some(entries);
                self.last_error = None;
            }
            Err(e) => {
                tracing::warn!("Roster poll failed: {}", e);
                self.last_error = Some(e.to_string());
                if self.entries.is_none() {
                    self.entries = Some(Vec::new());
                }
            }
        }
        self.timer.schedule(now, self.interval);
        true
    }

    pub fn view(&self, filter: &RosterFilter) -> Vec<&RosterEntry> {
        self.entries
            .iter()
            .flatten()
            .filter(|entry| filter.matches(entry))
            .collect()
    }

    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.iter().flatten() {
            *counts.entry(entry.status.wire_name()).or_insert(0) += 1;
        }
        counts
    }

    pub fn stop(&mut self) {
        self.timer.cancel_all();
    }
}
