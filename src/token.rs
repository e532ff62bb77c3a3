// Kiosk tokens.
//
// The kiosk shows a QR code whose token rotates every few seconds, so a
// screenshot sent to a friend stops working almost immediately. The server
// decides what's expired; we only use its "time until refresh" to decide
// when to ask again.

use crate::error::TransportError;
use crate::timer::RefreshTimer;
use crate::transport::Backend;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

const KIOSK_TOKEN_PATH: &str = "/checkin/token";
const USER_TOKEN_PATH: &str = "/checkin/userToken/";

// A server that says "refresh in 0s" shouldn't turn the kiosk into a busy loop.
const MIN_REFRESH_MILLIS: i64 = 100;
// Nor should "refresh in 1e300s" park it forever.
const MAX_REFRESH_MILLIS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct KioskToken {
    pub value: String,
    pub seconds_until_refresh: f64,
}

impl KioskToken {
    pub fn refresh_delay(&self) -> Duration {
        refresh_delay(self.seconds_until_refresh)
    }
}

fn refresh_delay(seconds: f64) -> Duration {
    // NaN casts to 0 and infinities saturate, both end up clamped.
    let millis = (seconds * 1000.0).round() as i64;
    Duration::milliseconds(millis.clamp(MIN_REFRESH_MILLIS, MAX_REFRESH_MILLIS))
}

#[derive(Debug, Clone, PartialEq)]
pub enum KioskPoll {
    Active {
        token: KioskToken,
        free_block: Option<String>,
    },
    // Nothing to check into right now; ask again once the next block starts.
    NoActiveBlock { retry_in: Duration },
    // Not logged in as a kiosk. Retrying won't fix that.
    Forbidden,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserTokenStatus {
    Issued(String),
    // The scanned kiosk token already rotated out.
    Stale,
}

#[derive(Deserialize)]
struct KioskTokenBody {
    token: Option<String>,
    time_until_refresh: f64,
    #[serde(default)]
    curr_free_block: Option<String>,
}

#[derive(Deserialize)]
struct UserTokenBody {
    token: String,
}

pub struct TokenSource<'a, B: Backend> {
    backend: &'a B,
}

impl<'a, B: Backend> TokenSource<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        TokenSource { backend }
    }

    // The kiosk's own poll. Passing the token we're currently showing lets the
    // server tell us if it's already been replaced.
    pub fn current_token(&self, last_token: Option<&str>) -> Result<KioskPoll, TransportError> {
        let query: Vec<(&str, &str)> = last_token.map(|t| ("last_token", t)).into_iter().collect();
        let response = self.backend.get(KIOSK_TOKEN_PATH, &query)?;

        if response.status == 403 {
            tracing::warn!("Kiosk token poll forbidden, is this kiosk logged in?");
            return Ok(KioskPoll::Forbidden);
        }
        if !response.is_success() {
            return Err(TransportError::Status {
                path: KIOSK_TOKEN_PATH.to_owned(),
                status: response.status,
            });
        }

        let body: KioskTokenBody = response.json()?;
        Ok(match body.token {
            Some(value) => KioskPoll::Active {
                token: KioskToken {
                    value,
                    seconds_until_refresh: body.time_until_refresh,
                },
                free_block: body.curr_free_block,
            },
            None => KioskPoll::NoActiveBlock {
                retry_in: refresh_delay(body.time_until_refresh),
            },
        })
    }

    // What the scanning device does with the token it read off the QR code.
    pub fn user_token(&self, kiosk_token: &str) -> Result<UserTokenStatus, TransportError> {
        let response = self
            .backend
            .get(USER_TOKEN_PATH, &[("kiosk_token", kiosk_token)])?;

        if response.status == 403 {
            tracing::info!("Scanned kiosk token is stale");
            return Ok(UserTokenStatus::Stale);
        }
        if !response.is_success() {
            return Err(TransportError::Status {
                path: USER_TOKEN_PATH.to_owned(),
                status: response.status,
            });
        }

        let body: UserTokenBody = response.json()?;
        Ok(UserTokenStatus::Issued(body.token))
    }
}

// Where the QR code sends the student.
pub fn qr_url(checkin_page_url: &str, token: &str) -> String {
    format!("{}#/CheckInPage?last_token={}", checkin_page_url, token)
}

// Pulls the token back out of a scanned address fragment. Anything after the
// first "token=" counts, so both last_token= and kiosk_token= links work.
pub fn token_from_fragment(fragment: &str) -> Option<String> {
    let start = fragment.find("token=")? + "token=".len();
    let token: String = fragment[start..]
        .chars()
        .take_while(|c| *c != '&')
        .collect();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KioskDisplay {
    Loading,
    Showing {
        token: KioskToken,
        free_block: Option<String>,
    },
    NothingToCheckInto,
    NotLoggedIn,
}

// Drives the kiosk's self-adjusting poll. The next poll is scheduled from the
// previous answer, so a slow network just means slower polls.
pub struct KioskPoller<'a, B: Backend> {
    source: TokenSource<'a, B>,
    timer: RefreshTimer,
    retry_after_failure: Duration,
    display: KioskDisplay,
    stopped: bool,
}

impl<'a, B: Backend> KioskPoller<'a, B> {
    pub fn new(backend: &'a B, retry_after_failure: Duration) -> Self {
        KioskPoller {
            source: TokenSource::new(backend),
            timer: RefreshTimer::new(),
            retry_after_failure,
            display: KioskDisplay::Loading,
            stopped: false,
        }
    }

    pub fn display(&self) -> &KioskDisplay {
        &self.display
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn timer(&self) -> &RefreshTimer {
        &self.timer
    }

    // Polls if it's time to (or if we never have). Returns true when the
    // display may have changed.
    pub fn tick(&mut self, now: DateTime<Utc>) -> bool {
        if self.stopped {
            return false;
        }
        let first_poll = self.timer.pending_count() == 0 && self.display == KioskDisplay::Loading;
        if !first_poll && self.timer.fire(now).is_none() {
            return false;
        }

        let last_token = match &self.display {
            KioskDisplay::Showing { token, .. } => Some(token.value.clone()),
            _ => None,
        };

        match self.source.current_token(last_token.as_deref()) {
            Ok(KioskPoll::Active { token, free_block }) => {
                tracing::debug!(
                    "Kiosk token {} (refresh in {:.1}s)",
                    token.value,
                    token.seconds_until_refresh
                );
                self.timer.schedule(now, token.refresh_delay());
                self.display = KioskDisplay::Showing { token, free_block };
            }
            Ok(KioskPoll::NoActiveBlock { retry_in }) => {
                tracing::info!("No free block right now, next poll in {}s", retry_in.num_seconds());
                self.timer.schedule(now, retry_in);
                self.display = KioskDisplay::NothingToCheckInto;
            }
            Ok(KioskPoll::Forbidden) => {
                self.stop();
                self.display = KioskDisplay::NotLoggedIn;
            }
            Err(e) => {
                // Keep showing whatever we had, it may still be valid.
                tracing::warn!("Kiosk token poll failed: {}", e);
                self.timer.schedule(now, self.retry_after_failure);
            }
        }
        true
    }

    pub fn stop(&mut self) {
        self.stopped = true;
        self.timer.cancel_all();
    }
}
