// One scan, start to finish, on the student's device.
//
// This is the glue between the pieces: it asks each of them for its input,
// feeds the answers to the state machine, and runs whatever attempt the
// machine asks for. Anything that needs a human (showing progress, picking a
// mode, recording evidence) goes through CheckInUi.

use crate::error::{CaptureError, LoginError};
use crate::evidence::EvidenceArtifact;
use crate::identity::{FingerprintProvider, ProfileSource};
use crate::machine::{CheckInMachine, CheckInState};
use crate::protocol::{
    lookup_student, CheckInClient, CheckInFailure, CheckInMode, Identity, StudentLookup,
};
use crate::store::IdentityStore;
use crate::token::{TokenSource, UserTokenStatus};
use crate::transport::Backend;

// Remembers who checks in from this device. The server has to know the
// student, and what gets stored is the email it answers with.
pub fn log_in<B: Backend, S: IdentityStore>(
    backend: &B,
    store: &mut S,
    raw: &str,
) -> Result<Identity, LoginError> {
    let identity = Identity::parse(raw).ok_or(LoginError::Malformed)?;
    match lookup_student(backend, &identity)? {
        StudentLookup::Found(resolved) => {
            store.set(resolved.as_str())?;
            tracing::info!("Logged in as {}", resolved);
            Ok(resolved)
        }
        StudentLookup::Unknown => Err(LoginError::UnknownStudent(identity.to_string())),
        StudentLookup::QuotaExceeded => Err(LoginError::QuotaExceeded),
    }
}

pub trait CheckInUi {
    fn show(&mut self, state: &CheckInState);

    // None means the student backed out.
    fn pick_mode(&mut self) -> Option<CheckInMode>;

    fn capture_evidence(&mut self) -> Result<EvidenceArtifact, CaptureError>;
}

pub struct CheckInSession<'a, B: Backend, S: IdentityStore, P: ProfileSource> {
    backend: &'a B,
    identity_store: &'a S,
    fingerprints: &'a FingerprintProvider<P>,
    machine: CheckInMachine,
}

impl<'a, B: Backend, S: IdentityStore, P: ProfileSource> CheckInSession<'a, B, S, P> {
    pub fn new(
        backend: &'a B,
        identity_store: &'a S,
        fingerprints: &'a FingerprintProvider<P>,
    ) -> Self {
        CheckInSession {
            backend,
            identity_store,
            fingerprints,
            machine: CheckInMachine::new(),
        }
    }

    pub fn state(&self) -> &CheckInState {
        self.machine.state()
    }

    pub fn run_scan(&mut self, fragment: &str, ui: &mut dyn CheckInUi) -> CheckInState {
        self.machine.scan(fragment);
        ui.show(self.machine.state());
        if self.machine.has_deferred_scan() {
            return self.machine.state().clone();
        }

        let kiosk_token = match self.machine.kiosk_token() {
            Some(token) => token.to_owned(),
            None => return self.machine.state().clone(),
        };

        // Identity and fingerprint go first since neither needs the network.
        match self.identity_store.get() {
            Ok(Some(raw)) => match Identity::parse(&raw) {
                Some(identity) => self.machine.provide_identity(identity),
                None => {
                    self.machine.fail(CheckInFailure::InvalidIdentity);
                    return self.finish(ui);
                }
            },
            Ok(None) => return self.finish(ui),
            Err(e) => {
                tracing::warn!("Couldn't read the stored identity: {}", e);
                return self.finish(ui);
            }
        }

        match self.fingerprints.get_fingerprint() {
            Ok(fingerprint) => self.machine.provide_fingerprint(fingerprint),
            Err(e) => {
                tracing::warn!("No device fingerprint, can't check in: {}", e);
                return self.finish(ui);
            }
        }

        match TokenSource::new(self.backend).user_token(&kiosk_token) {
            Ok(status) => {
                let stale = status == UserTokenStatus::Stale;
                self.machine.token_resolved(status);
                if stale {
                    ui.show(self.machine.state());
                    match ui.capture_evidence() {
                        Ok(evidence) => self.machine.provide_evidence(evidence),
                        Err(e) => {
                            tracing::warn!("Evidence capture failed: {}", e);
                            return self.finish(ui);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Couldn't exchange the kiosk token: {}", e);
                self.machine.fail(CheckInFailure::Network(e.to_string()));
                return self.finish(ui);
            }
        }

        self.run_attempts(ui)
    }

    fn run_attempts(&mut self, ui: &mut dyn CheckInUi) -> CheckInState {
        let client = CheckInClient::new(self.backend);

        let mut next = self.machine.evaluate();
        while let Some((id, attempt)) = next.take() {
            ui.show(self.machine.state());
            let result = client.attempt(&attempt);
            self.machine.complete(id, result);

            if self.machine.state() == &CheckInState::ModeNeeded {
                ui.show(self.machine.state());
                match ui.pick_mode() {
                    Some(mode) => next = self.machine.select_mode(mode),
                    None => tracing::info!("No mode picked, leaving the question open"),
                }
            }
        }

        self.finish(ui)
    }

    fn finish(&mut self, ui: &mut dyn CheckInUi) -> CheckInState {
        let state = self.machine.state().clone();
        ui.show(&state);
        state
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;
    use crate::evidence::fake::{webm, FakeRecorder};
    use crate::evidence::EvidenceCapture;
    use crate::identity::fake::{fixed_provider, FixedProfile};
    use crate::machine::Waiting;
    use crate::store::MemoryIdentityStore;
    use crate::transport::fake::FakeBackend;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;

    // Scripted student: picks the given modes in order, records a fixed clip.
    #[derive(Default)]
    struct ScriptedUi {
        modes: Vec<CheckInMode>,
        shown: Vec<CheckInState>,
        mode_prompts: usize,
        captures: usize,
    }

    impl CheckInUi for ScriptedUi {
        fn show(&mut self, state: &CheckInState) {
            self.shown.push(state.clone());
        }

        fn pick_mode(&mut self) -> Option<CheckInMode> {
            self.mode_prompts += 1;
            if self.modes.is_empty() {
                None
            } else {
                Some(self.modes.remove(0))
            }
        }

        fn capture_evidence(&mut self) -> Result<EvidenceArtifact, CaptureError> {
            self.captures += 1;
            let (recorder, _log) = FakeRecorder::new(vec![vec![webm(b"evidence-clip")]]);
            let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
            EvidenceCapture::begin(recorder, now, Duration::seconds(15))?
                .finish(now + Duration::seconds(3))
        }
    }

    fn jane() -> MemoryIdentityStore {
        MemoryIdentityStore::with_identity("jdoe@caryacademy.org")
    }

    #[test]
    pub fn scenario_a_straight_through() {
        let backend = FakeBackend::new();
        backend
            .respond(200, json!({"token": "u1"}))
            .respond(200, json!({"studentName": "Jane Doe"}));
        let store = jane();
        let fingerprints = fixed_provider("phone-1");
        let mut session = CheckInSession::new(&backend, &store, &fingerprints);
        let mut ui = ScriptedUi::default();

        let state = session.run_scan("#/CheckInPage?last_token=k1", &mut ui);
        assert_eq!(
            state,
            CheckInState::Ok {
                student_name: Some("Jane Doe".to_owned())
            }
        );
        assert_eq!(
            backend.paths(),
            vec!["/checkin/userToken/", "/checkin/run/"]
        );
        assert!(ui
            .shown
            .iter()
            .any(|s| matches!(s, CheckInState::Loading { .. })));
        assert_eq!(ui.mode_prompts, 0);
    }

    #[test]
    pub fn scenario_b_stale_token_goes_to_evidence() {
        let backend = FakeBackend::new();
        backend
            .respond_text(403, "Invalid token")
            .respond(200, json!({"studentName": "Jane Doe"}));
        let store = jane();
        let fingerprints = fixed_provider("phone-1");
        let mut session = CheckInSession::new(&backend, &store, &fingerprints);
        let mut ui = ScriptedUi::default();

        let state = session.run_scan("#/CheckInPage?last_token=old", &mut ui);
        assert!(matches!(state, CheckInState::Ok { .. }));
        assert_eq!(ui.captures, 1);
        assert!(ui.shown.contains(&CheckInState::Idle {
            waiting_for: Waiting::Evidence
        }));
        // Never tried the stale token against /run/
        assert_eq!(
            backend.paths(),
            vec!["/checkin/userToken/", "/checkin/runTentative/"]
        );
        let sent = backend.request(1);
        assert_eq!(
            sent.video,
            Some(("video/webm".to_owned(), b"evidence-clip".to_vec()))
        );
    }

    #[test]
    pub fn scenario_c_mode_needed_then_free_period() {
        let backend = FakeBackend::new();
        backend
            .respond(200, json!({"token": "u1"}))
            .respond_text(414, "")
            .respond(200, json!({"studentName": "Jane Doe"}));
        let store = jane();
        let fingerprints = fixed_provider("phone-1");
        let mut session = CheckInSession::new(&backend, &store, &fingerprints);
        let mut ui = ScriptedUi {
            modes: vec![CheckInMode::FreePeriod],
            ..ScriptedUi::default()
        };

        let state = session.run_scan("#/CheckInPage?last_token=k1", &mut ui);
        assert!(matches!(state, CheckInState::Ok { .. }));
        assert!(ui.shown.contains(&CheckInState::ModeNeeded));
        assert_eq!(ui.mode_prompts, 1);

        let runs: Vec<_> = backend
            .requests
            .borrow()
            .iter()
            .filter(|r| r.path == "/checkin/run/")
            .cloned()
            .collect();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].body.as_ref().unwrap().get("mode").is_none());
        assert_eq!(runs[1].body.as_ref().unwrap()["mode"], "free_period");
        assert_eq!(runs[1].body.as_ref().unwrap()["user_token"], "u1");
    }

    #[test]
    pub fn backing_out_of_the_mode_question_sends_nothing_more() {
        let backend = FakeBackend::new();
        backend
            .respond(200, json!({"token": "u1"}))
            .respond_text(414, "");
        let store = jane();
        let fingerprints = fixed_provider("phone-1");
        let mut session = CheckInSession::new(&backend, &store, &fingerprints);
        let mut ui = ScriptedUi::default();

        let state = session.run_scan("last_token=k1", &mut ui);
        assert_eq!(state, CheckInState::ModeNeeded);
        assert_eq!(backend.paths().len(), 2);

        // Scanning again doesn't jump the unanswered question
        let again = session.run_scan("last_token=k2", &mut ui);
        assert_eq!(again, CheckInState::ModeNeeded);
        assert_eq!(backend.paths().len(), 2);
    }

    #[test]
    pub fn scenario_d_same_device_twice() {
        let backend = FakeBackend::new();
        backend
            .respond(200, json!({"token": "u1"}))
            .respond(200, json!({"studentName": "Jane Doe"}))
            .respond(200, json!({"token": "u2"}))
            .respond_text(409, "");
        let store = jane();
        let fingerprints = fixed_provider("phone-1");
        let mut session = CheckInSession::new(&backend, &store, &fingerprints);
        let mut ui = ScriptedUi::default();

        assert!(matches!(
            session.run_scan("last_token=k1", &mut ui),
            CheckInState::Ok { .. }
        ));
        let second = session.run_scan("last_token=k1", &mut ui);
        assert_eq!(second, CheckInState::Err(CheckInFailure::DuplicateDevice));
        assert_eq!(
            second_message(&second),
            "This device has already checked in a user for this free period."
        );

        // Both attempts carried the same device id
        let first_body = backend.request(1).body.unwrap();
        let second_body = backend.request(3).body.unwrap();
        assert_eq!(first_body["device_id"], second_body["device_id"]);

        // And the session is still usable afterwards
        assert_eq!(
            session.state(),
            &CheckInState::Err(CheckInFailure::DuplicateDevice)
        );
    }

    fn second_message(state: &CheckInState) -> String {
        match state {
            CheckInState::Err(failure) => failure.user_message(),
            other => panic!("expected an error, got {:?}", other),
        }
    }

    #[test]
    pub fn log_in_stores_the_servers_email() {
        let backend = FakeBackend::new();
        backend.respond(200, json!({"exists": true, "email": "jdoe@caryacademy.org"}));
        let mut store = MemoryIdentityStore::default();

        let identity = log_in(&backend, &mut store, " 12345 ").unwrap();
        assert_eq!(identity, Identity::Email("jdoe@caryacademy.org".to_owned()));
        assert_eq!(
            store.get().unwrap().as_deref(),
            Some("jdoe@caryacademy.org")
        );
        assert_eq!(backend.paths(), vec!["/checkin/studentExists/12345"]);
    }

    #[test]
    pub fn log_in_refuses_unknown_students() {
        let backend = FakeBackend::new();
        backend
            .respond(200, json!({"exists": false, "email": null}))
            .respond_text(418, "");
        let mut store = jane();

        assert!(matches!(
            log_in(&backend, &mut store, "99999"),
            Err(LoginError::UnknownStudent(_))
        ));
        assert!(matches!(
            log_in(&backend, &mut store, "99999"),
            Err(LoginError::QuotaExceeded)
        ));
        assert!(matches!(
            log_in(&backend, &mut store, "not an id"),
            Err(LoginError::Malformed)
        ));
        // The previous identity is untouched
        assert_eq!(
            store.get().unwrap().as_deref(),
            Some("jdoe@caryacademy.org")
        );
        assert_eq!(backend.paths().len(), 2);
    }

    #[test]
    pub fn no_identity_means_no_requests() {
        let backend = FakeBackend::new();
        let store = MemoryIdentityStore::default();
        let fingerprints = fixed_provider("phone-1");
        let mut session = CheckInSession::new(&backend, &store, &fingerprints);

        let state = session.run_scan("last_token=k1", &mut ScriptedUi::default());
        assert_eq!(
            state,
            CheckInState::Idle {
                waiting_for: Waiting::Identity
            }
        );
        assert!(backend.paths().is_empty());
    }

    #[test]
    pub fn malformed_identity_is_rejected_locally() {
        let backend = FakeBackend::new();
        let store = MemoryIdentityStore::with_identity("not an email");
        let fingerprints = fixed_provider("phone-1");
        let mut session = CheckInSession::new(&backend, &store, &fingerprints);

        let state = session.run_scan("last_token=k1", &mut ScriptedUi::default());
        assert_eq!(state, CheckInState::Err(CheckInFailure::InvalidIdentity));
        assert!(backend.paths().is_empty());
    }

    #[test]
    pub fn missing_fingerprint_blocks_the_attempt() {
        let backend = FakeBackend::new();
        let store = jane();
        let fingerprints = FingerprintProvider::new(
            FixedProfile {
                profile: None,
                calls: Rc::new(Cell::new(0)),
            },
            None,
        );
        let mut session = CheckInSession::new(&backend, &store, &fingerprints);

        let state = session.run_scan("last_token=k1", &mut ScriptedUi::default());
        assert_eq!(
            state,
            CheckInState::Idle {
                waiting_for: Waiting::Fingerprint
            }
        );
        assert!(backend.paths().is_empty());
    }

    #[test]
    pub fn unreachable_server_while_exchanging_token() {
        let backend = FakeBackend::new();
        backend.fail("connection refused");
        let store = jane();
        let fingerprints = fixed_provider("phone-1");
        let mut session = CheckInSession::new(&backend, &store, &fingerprints);

        let state = session.run_scan("last_token=k1", &mut ScriptedUi::default());
        assert!(matches!(
            state,
            CheckInState::Err(CheckInFailure::Network(_))
        ));
    }

    #[test]
    pub fn fragment_without_token_does_nothing() {
        let backend = FakeBackend::new();
        let store = jane();
        let fingerprints = fixed_provider("phone-1");
        let mut session = CheckInSession::new(&backend, &store, &fingerprints);

        let state = session.run_scan("#/CheckInPage", &mut ScriptedUi::default());
        assert_eq!(
            state,
            CheckInState::Idle {
                waiting_for: Waiting::Scan
            }
        );
        assert!(backend.paths().is_empty());
    }
}
