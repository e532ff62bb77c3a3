// The check-in state machine, as the student sees it.
//
//   Idle -> Loading -> Ok | Err | ModeNeeded
//                              ModeNeeded -> (mode picked) -> Loading
//
// The machine never talks to the network. It says when an attempt should
// start (and with what), and it is told how attempts ended. Every attempt gets
// an id, and an answer carrying any id other than the one we're waiting on is
// thrown away, so a slow response to an abandoned scan can't overwrite a
// newer one.

use crate::evidence::EvidenceArtifact;
use crate::identity::DeviceFingerprint;
use crate::protocol::{CheckInAttempt, CheckInFailure, CheckInMode, CheckInResult, Identity, Proof};
use crate::token::{token_from_fragment, UserTokenStatus};
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaChaRng;
use std::collections::VecDeque;

// How many finished user tokens we remember.
const SPENT_TOKEN_MEMORY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waiting {
    Scan,
    Identity,
    Fingerprint,
    Token,
    Evidence,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckInState {
    Idle { waiting_for: Waiting },
    Loading { attempt: AttemptId },
    Ok { student_name: Option<String> },
    Err(CheckInFailure),
    ModeNeeded,
}

impl CheckInState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckInState::Ok { .. } | CheckInState::Err(_))
    }
}

#[derive(Default)]
struct Inputs {
    kiosk_token: Option<String>,
    identity: Option<Identity>,
    fingerprint: Option<DeviceFingerprint>,
    user_token: Option<String>,
    token_stale: bool,
    evidence: Option<EvidenceArtifact>,
    mode: Option<CheckInMode>,
}

pub struct CheckInMachine {
    state: CheckInState,
    inputs: Inputs,
    // The attempt we are waiting on, and whether it is the retry after ModeNeeded.
    in_flight: Option<(AttemptId, CheckInAttempt)>,
    retrying_with_mode: bool,
    // A scan that arrived while a mode question was still open.
    deferred_scan: Option<String>,
    // User tokens that already went through a finished attempt, oldest first.
    spent_tokens: VecDeque<String>,
    rng: ChaChaRng,
}

impl Default for CheckInMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckInMachine {
    pub fn new() -> Self {
        CheckInMachine {
            state: CheckInState::Idle {
                waiting_for: Waiting::Scan,
            },
            inputs: Inputs::default(),
            in_flight: None,
            retrying_with_mode: false,
            deferred_scan: None,
            spent_tokens: VecDeque::new(),
            rng: ChaChaRng::from_entropy(),
        }
    }

    pub fn state(&self) -> &CheckInState {
        &self.state
    }

    pub fn kiosk_token(&self) -> Option<&str> {
        self.inputs.kiosk_token.as_deref()
    }

    pub fn has_deferred_scan(&self) -> bool {
        self.deferred_scan.is_some()
    }

    // The address fragment changed, i.e. someone scanned a code. Always forces a
    // fresh evaluation, even if it's the same code as last time.
    pub fn scan(&mut self, fragment: &str) {
        if self.mode_question_open() {
            tracing::info!("Holding on to new scan until the mode question is answered");
            self.deferred_scan = Some(fragment.to_owned());
            return;
        }

        if let Some((id, _)) = self.in_flight.take() {
            tracing::info!("New scan supersedes attempt {:?}", id);
        }
        self.retrying_with_mode = false;
        self.state = CheckInState::Idle {
            waiting_for: Waiting::Scan,
        };

        // Who we are and what device we're on survive a rescan; everything
        // else belongs to the old code.
        self.inputs = Inputs {
            kiosk_token: token_from_fragment(fragment),
            identity: self.inputs.identity.take(),
            fingerprint: self.inputs.fingerprint.take(),
            ..Inputs::default()
        };
        self.refresh_idle();
    }

    pub fn provide_identity(&mut self, identity: Identity) {
        self.inputs.identity = Some(identity);
        self.refresh_idle();
    }

    pub fn provide_fingerprint(&mut self, fingerprint: DeviceFingerprint) {
        self.inputs.fingerprint = Some(fingerprint);
        self.refresh_idle();
    }

    pub fn token_resolved(&mut self, status: UserTokenStatus) {
        match status {
            UserTokenStatus::Issued(token) if !self.is_spent(&token) => {
                self.inputs.user_token = Some(token);
                self.inputs.token_stale = false;
            }
            UserTokenStatus::Issued(token) => {
                tracing::warn!("Refusing to reuse spent token {}", token);
                self.inputs.user_token = None;
            }
            UserTokenStatus::Stale => {
                self.inputs.user_token = None;
                self.inputs.token_stale = true;
            }
        }
        self.refresh_idle();
    }

    pub fn provide_evidence(&mut self, evidence: EvidenceArtifact) {
        if !self.inputs.token_stale {
            tracing::warn!("Ignoring evidence, the token path is still usable");
            return;
        }
        self.inputs.evidence = Some(evidence);
        self.refresh_idle();
    }

    // Something failed before we even got to make an attempt (unparseable
    // identity, server unreachable while fetching a token, ...).
    pub fn fail(&mut self, failure: CheckInFailure) {
        if matches!(self.state, CheckInState::Idle { .. }) {
            self.state = CheckInState::Err(failure);
        }
    }

    // Starts an attempt if everything it needs is here. Returns what to send.
    pub fn evaluate(&mut self) -> Option<(AttemptId, CheckInAttempt)> {
        if !matches!(self.state, CheckInState::Idle { .. }) {
            return None;
        }
        if let Err(waiting_for) = self.missing_input() {
            self.state = CheckInState::Idle { waiting_for };
            return None;
        }

        let attempt = self.build_attempt()?;
        Some(self.start(attempt))
    }

    // Only legal while ModeNeeded. Produces the single retry, now with a mode.
    pub fn select_mode(&mut self, mode: CheckInMode) -> Option<(AttemptId, CheckInAttempt)> {
        if self.state != CheckInState::ModeNeeded {
            return None;
        }
        self.inputs.mode = Some(mode);
        let attempt = self.build_attempt()?;
        self.retrying_with_mode = true;
        Some(self.start(attempt))
    }

    // Feeds back how an attempt went. Returns false if the answer was for an
    // attempt we no longer care about.
    pub fn complete(&mut self, id: AttemptId, result: CheckInResult) -> bool {
        let attempt = match &self.in_flight {
            Some((current, attempt)) if *current == id => attempt.clone(),
            _ => {
                tracing::debug!("Dropping stale response for attempt {:?}", id);
                return false;
            }
        };
        self.in_flight = None;

        self.state = match result {
            CheckInResult::Ok { student_name } => CheckInState::Ok { student_name },
            CheckInResult::Err(failure) => CheckInState::Err(failure),
            // A second "which mode?" after we already told it would loop forever.
            CheckInResult::ModeNeeded if self.retrying_with_mode => {
                CheckInState::Err(CheckInFailure::UnexpectedStatus(414))
            }
            CheckInResult::ModeNeeded => CheckInState::ModeNeeded,
            CheckInResult::Loading => {
                tracing::warn!("Attempt {:?} completed with Loading, ignoring", id);
                self.in_flight = Some((id, attempt));
                return false;
            }
        };

        if self.state.is_terminal() {
            self.retrying_with_mode = false;
            if let Some(token) = attempt.token() {
                self.mark_spent(token);
            }
            // The proof belonged to this attempt. Only a new scan brings another.
            self.inputs.user_token = None;
            self.inputs.evidence = None;
            self.inputs.token_stale = false;
            self.inputs.mode = None;
            if let Some(fragment) = self.deferred_scan.take() {
                self.scan(&fragment);
            }
        }
        true
    }

    fn is_spent(&self, token: &str) -> bool {
        self.spent_tokens.iter().any(|spent| spent == token)
    }

    fn mark_spent(&mut self, token: &str) {
        if self.spent_tokens.len() == SPENT_TOKEN_MEMORY {
            self.spent_tokens.pop_front();
        }
        self.spent_tokens.push_back(token.to_owned());
    }

    fn mode_question_open(&self) -> bool {
        self.state == CheckInState::ModeNeeded
            || (self.retrying_with_mode && self.in_flight.is_some())
    }

    fn start(&mut self, attempt: CheckInAttempt) -> (AttemptId, CheckInAttempt) {
        let id = AttemptId(self.rng.gen());
        tracing::debug!("Starting attempt {:?}", id);
        self.in_flight = Some((id, attempt.clone()));
        self.state = CheckInState::Loading { attempt: id };
        (id, attempt)
    }

    fn missing_input(&self) -> Result<(), Waiting> {
        let inputs = &self.inputs;
        if inputs.kiosk_token.is_none() {
            return Err(Waiting::Scan);
        }
        if inputs.identity.is_none() {
            return Err(Waiting::Identity);
        }
        if inputs.fingerprint.is_none() {
            return Err(Waiting::Fingerprint);
        }
        if inputs.token_stale {
            if inputs.evidence.is_none() {
                return Err(Waiting::Evidence);
            }
        } else if inputs.user_token.is_none() {
            return Err(Waiting::Token);
        }
        Ok(())
    }

    fn build_attempt(&self) -> Option<CheckInAttempt> {
        let inputs = &self.inputs;
        // A stale token is never sent, evidence replaces it.
        let proof = if inputs.token_stale {
            Proof::Evidence(inputs.evidence.clone()?)
        } else {
            Proof::Token(inputs.user_token.clone()?)
        };
        Some(CheckInAttempt {
            identity: inputs.identity.clone()?,
            device: inputs.fingerprint.clone()?,
            proof,
            mode: inputs.mode,
        })
    }

    // Ok/Err stay put until the next scan, which resets to Idle itself.
    fn refresh_idle(&mut self) {
        if matches!(self.state, CheckInState::Idle { .. }) && self.in_flight.is_none() {
            self.state = CheckInState::Idle {
                waiting_for: self.missing_input().err().unwrap_or(Waiting::Scan),
            };
        }
    }
}
