// The check-in protocol: one request, one answer.
//
// attempt() never fails. Every way the exchange can go wrong ends up as a
// CheckInResult, so whatever is showing the result always has something to
// show. Retrying is the caller's business.

use crate::error::TransportError;
use crate::evidence::EvidenceArtifact;
use crate::identity::DeviceFingerprint;
use crate::transport::{Backend, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const RUN_PATH: &str = "/checkin/run/";
const RUN_TENTATIVE_PATH: &str = "/checkin/runTentative/";
const STUDENT_EXISTS_PATH: &str = "/checkin/studentExists/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckInMode {
    #[serde(rename = "free_period")]
    FreePeriod,
    #[serde(rename = "sp_check_in")]
    SeniorPrivilegeCheckIn,
    #[serde(rename = "sp_check_out")]
    SeniorPrivilegeCheckOut,
}

impl CheckInMode {
    pub const ALL: [CheckInMode; 3] = [
        CheckInMode::FreePeriod,
        CheckInMode::SeniorPrivilegeCheckIn,
        CheckInMode::SeniorPrivilegeCheckOut,
    ];

    pub fn wire_name(&self) -> &'static str {
        match self {
            CheckInMode::FreePeriod => "free_period",
            CheckInMode::SeniorPrivilegeCheckIn => "sp_check_in",
            CheckInMode::SeniorPrivilegeCheckOut => "sp_check_out",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CheckInMode::FreePeriod => "Free period check in",
            CheckInMode::SeniorPrivilegeCheckIn => "Senior privileges check in",
            CheckInMode::SeniorPrivilegeCheckOut => "Senior privileges check out",
        }
    }
}

impl FromStr for CheckInMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CheckInMode::ALL
            .iter()
            .copied()
            .find(|mode| mode.wire_name() == s)
            .ok_or_else(|| {
                format!(
                    "unknown mode {:?} (expected free_period, sp_check_in or sp_check_out)",
                    s
                )
            })
    }
}

// Either an email or the numbers on a student ID card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Email(String),
    StudentId(String),
}

impl Identity {
    pub fn parse(raw: &str) -> Option<Identity> {
        let raw = raw.trim();
        if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
            Some(Identity::StudentId(raw.to_owned()))
        } else if raw.contains('@') && !raw.starts_with('@') && !raw.ends_with('@') {
            Some(Identity::Email(raw.to_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Identity::Email(email) => email,
            Identity::StudentId(id) => id,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// What vouches for the student being in the room. Only ever one of the two.
#[derive(Debug, Clone, PartialEq)]
pub enum Proof {
    Token(String),
    Evidence(EvidenceArtifact),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckInAttempt {
    pub identity: Identity,
    pub device: DeviceFingerprint,
    pub proof: Proof,
    pub mode: Option<CheckInMode>,
}

impl CheckInAttempt {
    pub fn token(&self) -> Option<&str> {
        match &self.proof {
            Proof::Token(token) => Some(token),
            Proof::Evidence(_) => None,
        }
    }

    fn input_data(&self) -> serde_json::Value {
        let mut body = json!({
            "email": self.identity.as_str(),
            "device_id": self.device.as_str(),
        });
        if let Some(mode) = self.mode {
            body["mode"] = json!(mode.wire_name());
        }
        if let Some(token) = self.token() {
            body["user_token"] = json!(token);
        }
        body
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    // Fix what you typed.
    UserInput,
    // Try scanning again.
    Transient,
    // Retrying can't help until something changes on the server.
    ProtocolState,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckInFailure {
    #[error("invalid identity")]
    InvalidIdentity,
    #[error("scanner not authenticated")]
    ScannerNotAuthenticated,
    #[error("no active window")]
    NoActiveWindow,
    #[error("duplicate device use")]
    DuplicateDevice,
    #[error("checked-in before checked-out")]
    CheckedInBeforeCheckedOut,
    #[error("unexpected status")]
    UnexpectedStatus(u16),
    #[error("unexpected status")]
    Network(String),
}

impl CheckInFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            CheckInFailure::InvalidIdentity => FailureKind::UserInput,
            CheckInFailure::UnexpectedStatus(_) | CheckInFailure::Network(_) => {
                FailureKind::Transient
            }
            CheckInFailure::ScannerNotAuthenticated
            | CheckInFailure::NoActiveWindow
            | CheckInFailure::DuplicateDevice
            | CheckInFailure::CheckedInBeforeCheckedOut => FailureKind::ProtocolState,
        }
    }

    // What a student actually gets to read.
    pub fn user_message(&self) -> String {
        match self {
            CheckInFailure::InvalidIdentity => {
                "Invalid Student ID/Email - maybe log out and log back in?".to_owned()
            }
            CheckInFailure::ScannerNotAuthenticated => {
                "This is not your fault - scanner app not logged in.".to_owned()
            }
            CheckInFailure::NoActiveWindow => {
                "There isn't a free period right now; try signing in later.".to_owned()
            }
            CheckInFailure::DuplicateDevice => {
                "This device has already checked in a user for this free period.".to_owned()
            }
            CheckInFailure::CheckedInBeforeCheckedOut => {
                "You're trying to check back in for senior privileges, but you haven't checked out yet."
                    .to_owned()
            }
            CheckInFailure::UnexpectedStatus(status) => {
                format!("Something went wrong (status {}). Try scanning again.", status)
            }
            CheckInFailure::Network(_) => {
                "Couldn't reach the check-in server. Try scanning again.".to_owned()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckInResult {
    Ok { student_name: Option<String> },
    Err(CheckInFailure),
    ModeNeeded,
    // Only ever produced on our side, while a request is in flight.
    Loading,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuccessBody {
    student_name: Option<String>,
}

// Total over status codes; keep in step with the server's numbering.
pub fn map_response(response: &HttpResponse) -> CheckInResult {
    match response.status {
        200 => CheckInResult::Ok {
            student_name: response
                .json::<SuccessBody>()
                .ok()
                .and_then(|body| body.student_name),
        },
        400 => CheckInResult::Err(CheckInFailure::InvalidIdentity),
        401 => CheckInResult::Err(CheckInFailure::ScannerNotAuthenticated),
        405 => CheckInResult::Err(CheckInFailure::NoActiveWindow),
        409 => CheckInResult::Err(CheckInFailure::DuplicateDevice),
        414 => CheckInResult::ModeNeeded,
        416 => CheckInResult::Err(CheckInFailure::CheckedInBeforeCheckedOut),
        other => CheckInResult::Err(CheckInFailure::UnexpectedStatus(other)),
    }
}

pub struct CheckInClient<'a, B: Backend> {
    backend: &'a B,
}

impl<'a, B: Backend> CheckInClient<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        CheckInClient { backend }
    }

    pub fn attempt(&self, attempt: &CheckInAttempt) -> CheckInResult {
        let input_data = attempt.input_data();
        tracing::info!(
            "Checking in {} (mode: {}, via {})",
            attempt.identity,
            attempt.mode.map(|m| m.wire_name()).unwrap_or("unspecified"),
            match attempt.proof {
                Proof::Token(_) => "token",
                Proof::Evidence(_) => "evidence",
            }
        );

        let response = match &attempt.proof {
            Proof::Token(_) => self.backend.post_json(RUN_PATH, &input_data),
            Proof::Evidence(evidence) => {
                self.backend
                    .post_evidence(RUN_TENTATIVE_PATH, &input_data, evidence)
            }
        };

        let result = match response {
            Ok(response) => map_response(&response),
            Err(e) => {
                tracing::warn!("Check-in request failed: {}", e);
                CheckInResult::Err(CheckInFailure::Network(e.to_string()))
            }
        };
        tracing::debug!("Check-in result: {:?}", result);
        result
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StudentLookup {
    // Carries the server's own email for the student, even when looked up by id.
    Found(Identity),
    Unknown,
    // Id lookups go through a rate limited directory. Emails still work.
    QuotaExceeded,
}

#[derive(Deserialize)]
struct StudentExistsBody {
    exists: bool,
    #[serde(default)]
    email: Option<String>,
}

pub fn lookup_student<B: Backend>(
    backend: &B,
    identity: &Identity,
) -> Result<StudentLookup, TransportError> {
    let path = format!("{}{}", STUDENT_EXISTS_PATH, identity.as_str());
    let response = backend.get(&path, &[])?;
    if response.status == 418 {
        return Ok(StudentLookup::QuotaExceeded);
    }
    if !response.is_success() {
        return Err(TransportError::Status {
            path,
            status: response.status,
        });
    }

    let body: StudentExistsBody = response.json()?;
    if !body.exists {
        return Ok(StudentLookup::Unknown);
    }
    let resolved = body
        .email
        .as_deref()
        .and_then(Identity::parse)
        .unwrap_or_else(|| identity.clone());
    Ok(StudentLookup::Found(resolved))
}


#[cfg(test)]
mod protocol_tests {
    use super::fake::*;
    use super::*;
    use crate::evidence::fake::{webm, FakeRecorder};
    use crate::evidence::EvidenceCapture;
    use crate::transport::fake::FakeBackend;
    use chrono::{Duration, TimeZone, Utc};

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    pub fn student_lookup_resolves_ids_to_emails() {
        let backend = FakeBackend::new();
        backend
            .respond(200, json!({"exists": true, "email": "JDoe@caryacademy.org"}))
            .respond(200, json!({"exists": false, "email": null}))
            .respond_text(418, "")
            .respond_text(500, "");
        let id = Identity::parse("12345").unwrap();

        assert_eq!(
            lookup_student(&backend, &id).unwrap(),
            StudentLookup::Found(Identity::Email("jdoe@caryacademy.org".to_owned()))
        );
        assert_eq!(lookup_student(&backend, &id).unwrap(), StudentLookup::Unknown);
        assert_eq!(
            lookup_student(&backend, &id).unwrap(),
            StudentLookup::QuotaExceeded
        );
        assert!(matches!(
            lookup_student(&backend, &id),
            Err(TransportError::Status { status: 500, .. })
        ));
        assert_eq!(backend.request(0).path, "/checkin/studentExists/12345");
        assert_eq!(backend.request(0).method, "GET");
    }

    #[test]
    pub fn status_table() {
        let cases = vec![
            (400, "invalid identity"),
            (401, "scanner not authenticated"),
            (405, "no active window"),
            (409, "duplicate device use"),
            (416, "checked-in before checked-out"),
            (403, "unexpected status"),
            (500, "unexpected status"),
        ];
        for (status, message) in cases {
            match map_response(&response(status, "")) {
                CheckInResult::Err(failure) => assert_eq!(failure.to_string(), message),
                other => panic!("{} mapped to {:?}", status, other),
            }
        }
        assert_eq!(map_response(&response(414, "")), CheckInResult::ModeNeeded);
        assert_eq!(
            map_response(&response(200, r#"{"studentName": "Jane Doe"}"#)),
            CheckInResult::Ok {
                student_name: Some("Jane Doe".to_owned())
            }
        );
        // A success without a name is still a success
        assert_eq!(
            map_response(&response(200, r#"{"successMsg": "ok"}"#)),
            CheckInResult::Ok { student_name: None }
        );
    }

    #[test]
    pub fn failure_kinds() {
        assert_eq!(CheckInFailure::InvalidIdentity.kind(), FailureKind::UserInput);
        assert_eq!(CheckInFailure::DuplicateDevice.kind(), FailureKind::ProtocolState);
        assert_eq!(
            CheckInFailure::Network("down".to_owned()).kind(),
            FailureKind::Transient
        );
    }

    #[test]
    pub fn identities() {
        assert_eq!(
            Identity::parse(" 12345 "),
            Some(Identity::StudentId("12345".to_owned()))
        );
        assert_eq!(
            Identity::parse("JDoe@CaryAcademy.org"),
            Some(Identity::Email("jdoe@caryacademy.org".to_owned()))
        );
        assert_eq!(Identity::parse("jdoe"), None);
        assert_eq!(Identity::parse("@caryacademy.org"), None);
        assert_eq!(Identity::parse(""), None);
    }

    #[test]
    pub fn modes_use_the_wire_names() {
        assert_eq!(
            serde_json::to_value(CheckInMode::SeniorPrivilegeCheckOut).unwrap(),
            "sp_check_out"
        );
        assert_eq!(
            "free_period".parse::<CheckInMode>(),
            Ok(CheckInMode::FreePeriod)
        );
        assert!("lunch".parse::<CheckInMode>().is_err());
    }

    #[test]
    pub fn token_attempt_posts_json_to_run() {
        let backend = FakeBackend::new();
        backend.respond(200, serde_json::json!({"studentName": "Jane Doe"}));
        let client = CheckInClient::new(&backend);

        let attempt = token_attempt("jdoe@caryacademy.org", "user-token-1");
        assert_eq!(
            client.attempt(&attempt),
            CheckInResult::Ok {
                student_name: Some("Jane Doe".to_owned())
            }
        );

        let sent = backend.request(0);
        assert_eq!(sent.path, "/checkin/run/");
        let body = sent.body.expect("no body sent");
        assert_eq!(body["email"], "jdoe@caryacademy.org");
        assert_eq!(body["user_token"], "user-token-1");
        assert_eq!(body["device_id"], device().as_str());
        // No mode unless we were asked for one
        assert!(body.get("mode").is_none());
    }

    #[test]
    pub fn evidence_attempt_sends_the_recording_untouched() {
        let (recorder, _log) = FakeRecorder::new(vec![vec![webm(b"\x1a\x45\xdf\xa3clip")]]);
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let artifact = EvidenceCapture::begin(recorder, now, Duration::seconds(15))
            .expect("Failed to begin capture")
            .finish(now + Duration::seconds(2))
            .expect("Failed to finish capture");

        let backend = FakeBackend::new();
        backend.respond(200, serde_json::json!({"studentName": "Jane Doe"}));
        let client = CheckInClient::new(&backend);
        let attempt = CheckInAttempt {
            identity: Identity::parse("12345").unwrap(),
            device: device(),
            proof: Proof::Evidence(artifact.clone()),
            mode: Some(CheckInMode::SeniorPrivilegeCheckOut),
        };
        assert!(matches!(client.attempt(&attempt), CheckInResult::Ok { .. }));

        let sent = backend.request(0);
        assert_eq!(sent.path, "/checkin/runTentative/");
        let body = sent.body.expect("no input_data sent");
        assert_eq!(body["mode"], "sp_check_out");
        assert!(body.get("user_token").is_none());
        assert_eq!(
            sent.video,
            Some(("video/webm".to_owned(), artifact.bytes().to_vec()))
        );
    }

    #[test]
    pub fn network_failure_is_a_result_not_a_panic() {
        let backend = FakeBackend::new();
        backend.fail("connection refused");
        let client = CheckInClient::new(&backend);

        match client.attempt(&token_attempt("12345", "t")) {
            CheckInResult::Err(CheckInFailure::Network(reason)) => {
                assert!(reason.contains("connection refused"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
