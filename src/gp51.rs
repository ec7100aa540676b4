//! GP51 vendor API client.
//!
//! This module provides authenticated access to the GP51 tracking API with:
//! - A closed set of typed actions (no free-form action strings)
//! - An explicit session object with an acquire/validate/clear lifecycle
//! - Response validation (non-empty body, parseable JSON, vendor `status == 0`)
//! - Bounded retry driven by the classified-error taxonomy
//! - An overall deadline so a cancelled call surfaces as a timeout, not a hang
//!
//! The vendor signals success with `{"status": 0, ...}`; any other status, an
//! HTTP error or an unreadable body becomes a [`ClassifiedError`]. Recoverable
//! failures are retried with their kind-specific backoff; authentication and
//! fatal vendor errors abort immediately.
//!
//! Attempt counts and error kinds are logged. The session token never is.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info, warn};
use md5::{Digest, Md5};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ClassifiedError, Result, API_BACKOFF};
use crate::Position;

/// How long a login token is trusted before the client demands a fresh
/// login. GP51 does not advertise a TTL; this stays just under its daily
/// re-login expectation.
pub const SESSION_TTL_MS: i64 = 23 * 60 * 60 * 1000;

/// Configuration for the GP51 client.
#[derive(Debug, Clone)]
pub struct Gp51Config {
    /// Vendor endpoint, e.g. `https://api.gp51.com/webapi`.
    pub base_url: String,
    /// Per-request timeout. Default: 30 seconds
    pub timeout: Duration,
    /// Maximum attempts for a single call, initial request included.
    /// Default: 3
    pub max_retries: u32,
}

impl Default for Gp51Config {
    fn default() -> Self {
        Self {
            base_url: "https://api.gp51.com/webapi".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// An authenticated GP51 session.
///
/// Obtained from [`Gp51Client::login`] and held by the client; there is no
/// process-global token state, so expiry is testable with a caller-supplied
/// clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gp51Session {
    pub token: String,
    pub username: String,
    pub expires_at_ms: i64,
}

impl Gp51Session {
    /// Whether the token is present and unexpired at `now_ms`.
    pub fn is_valid(&self, now_ms: i64) -> bool {
        !self.token.is_empty() && now_ms < self.expires_at_ms
    }
}

/// The closed set of supported vendor actions.
///
/// Each action carries its own typed parameters; an unsupported action is a
/// compile error rather than a runtime string mismatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Gp51Action {
    Login {
        username: String,
        password: String,
    },
    QueryMonitorList {
        username: String,
    },
    LastPosition {
        device_ids: Vec<String>,
        last_query_time_ms: i64,
    },
    QueryTracks {
        device_id: String,
        begin_time_ms: i64,
        end_time_ms: i64,
    },
    QueryAllUsers,
}

impl Gp51Action {
    /// Wire name of the action.
    pub fn name(&self) -> &'static str {
        match self {
            Gp51Action::Login { .. } => "login",
            Gp51Action::QueryMonitorList { .. } => "querymonitorlist",
            Gp51Action::LastPosition { .. } => "lastposition",
            Gp51Action::QueryTracks { .. } => "querytracks",
            Gp51Action::QueryAllUsers => "queryallusers",
        }
    }

    /// Every action except login rides on an existing session token.
    pub fn requires_token(&self) -> bool {
        !matches!(self, Gp51Action::Login { .. })
    }

    /// JSON request body. The login password is sent as its MD5 digest, as
    /// the vendor requires; the cleartext never leaves this call.
    pub fn body(&self) -> Value {
        match self {
            Gp51Action::Login { username, password } => json!({
                "username": username,
                "password": md5_hex(password),
            }),
            Gp51Action::QueryMonitorList { username } => json!({ "username": username }),
            Gp51Action::LastPosition {
                device_ids,
                last_query_time_ms,
            } => json!({
                "deviceids": device_ids,
                "lastquerypositiontime": last_query_time_ms,
            }),
            Gp51Action::QueryTracks {
                device_id,
                begin_time_ms,
                end_time_ms,
            } => json!({
                "deviceid": device_id,
                "begintime": begin_time_ms,
                "endtime": end_time_ms,
            }),
            Gp51Action::QueryAllUsers => json!({}),
        }
    }
}

/// Lowercase hex MD5 digest, as GP51 expects for login passwords.
fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

// ============================================================================
// Vendor record types
// ============================================================================

/// A tracked device as reported by `querymonitorlist`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(rename = "deviceid")]
    pub device_id: String,
    #[serde(rename = "devicename", default)]
    pub device_name: String,
    #[serde(rename = "devicetype", default)]
    pub device_type: Option<i64>,
    #[serde(rename = "simnum", default)]
    pub sim_number: Option<String>,
    #[serde(rename = "groupname", default)]
    pub group_name: Option<String>,
    #[serde(rename = "lastactivetime", default)]
    pub last_active_ms: Option<i64>,
}

impl DeviceRecord {
    pub fn new(device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type: None,
            sim_number: None,
            group_name: None,
            last_active_ms: None,
        }
    }
}

/// A platform user as reported by `queryallusers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    #[serde(rename = "showname", default)]
    pub show_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(rename = "usertype", default)]
    pub user_type: Option<i64>,
}

impl UserRecord {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            show_name: None,
            email: None,
            user_type: None,
        }
    }
}

/// Device group wrapper in the `querymonitorlist` response.
#[derive(Debug, Deserialize)]
struct DeviceGroup {
    #[serde(rename = "groupname", default)]
    group_name: String,
    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

/// Raw position record in `lastposition`/`querytracks` responses.
#[derive(Debug, Deserialize)]
struct RawPosition {
    #[serde(rename = "deviceid")]
    device_id: String,
    #[serde(rename = "callat")]
    latitude: f64,
    #[serde(rename = "callon")]
    longitude: f64,
    #[serde(default)]
    speed: f64,
    #[serde(default)]
    course: f64,
    #[serde(rename = "updatetime", default)]
    timestamp_ms: i64,
}

impl RawPosition {
    fn into_position(self) -> Position {
        Position {
            device_id: self.device_id,
            latitude: self.latitude,
            longitude: self.longitude,
            speed: self.speed,
            course: self.course,
            timestamp_ms: self.timestamp_ms,
        }
    }
}

// ============================================================================
// Response validation and retry
// ============================================================================

/// Validate a raw response body against the vendor envelope.
///
/// Enforces: non-empty body, parseable JSON, an integer `status` field, and
/// `status == 0`. A non-zero status is classified from its `cause` text so
/// an expired token surfaces as authentication, not a generic API error.
fn parse_vendor_payload(body: &str) -> Result<Value> {
    if body.trim().is_empty() {
        return Err(ClassifiedError::data("empty response body"));
    }

    let value: Value = serde_json::from_str(body)
        .map_err(|e| ClassifiedError::data(format!("invalid JSON in response: {}", e)))?;

    let status = value
        .get("status")
        .and_then(Value::as_i64)
        .ok_or_else(|| ClassifiedError::data("response missing integer 'status' field"))?;

    if status != 0 {
        let cause = value
            .get("cause")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Err(if cause.is_empty() {
            ClassifiedError::api(format!("vendor status {}", status))
        } else {
            ClassifiedError::from_message(format!("vendor status {}: {}", status, cause))
        });
    }

    Ok(value)
}

fn classify_reqwest(err: reqwest::Error) -> ClassifiedError {
    if err.is_timeout() {
        ClassifiedError::timeout(err.to_string())
    } else {
        ClassifiedError::network(err.to_string())
    }
}

/// Drive `op` until it succeeds, the failure is not retryable, or
/// `max_retries` attempts are spent. Sleeps each failure's own
/// `retry_after` between attempts.
pub(crate) async fn run_with_retry<T, F, Fut>(label: &str, max_retries: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("[Gp51Client] {} succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(err) => {
                if !err.should_retry() || attempt >= max_retries.max(1) {
                    warn!(
                        "[Gp51Client] {} failed with {} error after {} attempt(s)",
                        label, err.kind, attempt
                    );
                    return Err(err);
                }
                let delay = err.retry_after.unwrap_or(API_BACKOFF);
                warn!(
                    "[Gp51Client] {} attempt {} failed with {} error; retrying in {:?}",
                    label, attempt, err.kind, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Bound `fut` by an overall deadline; expiry becomes a timeout-classified
/// error instead of a hang.
pub(crate) async fn with_deadline<T>(
    label: &str,
    deadline: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClassifiedError::timeout(format!(
            "{} aborted after {:?}",
            label, deadline
        ))),
    }
}

// ============================================================================
// Client
// ============================================================================

/// Authenticated GP51 API client.
pub struct Gp51Client {
    http: reqwest::Client,
    config: Gp51Config,
    session: Mutex<Option<Gp51Session>>,
}

impl Gp51Client {
    /// Create a client with the given configuration.
    pub fn new(config: Gp51Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClassifiedError::network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            session: Mutex::new(None),
        })
    }

    /// Snapshot of the current session, if any.
    pub fn session(&self) -> Option<Gp51Session> {
        self.session.lock().unwrap().clone()
    }

    /// Install a previously acquired session (e.g. restored from storage).
    pub fn install_session(&self, session: Gp51Session) {
        *self.session.lock().unwrap() = Some(session);
    }

    /// Drop the current session. Subsequent calls fail with an
    /// authentication error until the next login.
    pub fn clear_session(&self) {
        *self.session.lock().unwrap() = None;
    }

    /// Authenticate and install the resulting session.
    ///
    /// The password is hashed before it is sent; the response token is kept
    /// in the session object, never logged.
    pub async fn login(&self, username: &str, password: &str, now_ms: i64) -> Result<Gp51Session> {
        let action = Gp51Action::Login {
            username: username.to_string(),
            password: password.to_string(),
        };
        let value = self.call(&action, now_ms).await?;

        let token = value
            .get("token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ClassifiedError::data("login response missing token"))?;

        let session = Gp51Session {
            token: token.to_string(),
            username: username.to_string(),
            expires_at_ms: now_ms + SESSION_TTL_MS,
        };
        self.install_session(session.clone());
        info!("[Gp51Client] logged in as {}", username);
        Ok(session)
    }

    /// Execute an action with retry, returning the validated response value.
    ///
    /// Fails immediately with an authentication error when the action needs
    /// a token and the session is missing or expired at `now_ms` — token
    /// acquisition is an interactive concern, not something to retry into.
    pub async fn call(&self, action: &Gp51Action, now_ms: i64) -> Result<Value> {
        let token = self.resolve_token(action, now_ms)?;
        run_with_retry(action.name(), self.config.max_retries, || {
            let token = token.clone();
            async move { self.dispatch(action, token.as_deref()).await }
        })
        .await
    }

    /// Like [`Gp51Client::call`], bounded by an overall deadline covering
    /// all attempts and backoff waits.
    pub async fn call_with_deadline(
        &self,
        action: &Gp51Action,
        now_ms: i64,
        deadline: Duration,
    ) -> Result<Value> {
        with_deadline(action.name(), deadline, self.call(action, now_ms)).await
    }

    fn resolve_token(&self, action: &Gp51Action, now_ms: i64) -> Result<Option<String>> {
        if !action.requires_token() {
            return Ok(None);
        }
        let session = self.session.lock().unwrap();
        match session.as_ref() {
            Some(s) if s.is_valid(now_ms) => Ok(Some(s.token.clone())),
            Some(_) => Err(ClassifiedError::authentication("session token has expired")),
            None => Err(ClassifiedError::authentication(
                "no session token; log in first",
            )),
        }
    }

    /// One attempt: POST, then validate the response envelope.
    async fn dispatch(&self, action: &Gp51Action, token: Option<&str>) -> Result<Value> {
        let mut url = format!("{}?action={}", self.config.base_url, action.name());
        if let Some(token) = token {
            url.push_str("&token=");
            url.push_str(token);
        }

        debug!("[Gp51Client] POST action={}", action.name());

        let response = self
            .http
            .post(&url)
            .json(&action.body())
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifiedError::from_http_status(
                status.as_u16(),
                format!("HTTP {} from vendor", status),
            ));
        }

        let body = response.text().await.map_err(classify_reqwest)?;
        parse_vendor_payload(&body)
    }

    // ------------------------------------------------------------------
    // Typed wrappers
    // ------------------------------------------------------------------

    /// All devices visible to `username`, flattened across device groups.
    pub async fn query_monitor_list(
        &self,
        username: &str,
        now_ms: i64,
    ) -> Result<Vec<DeviceRecord>> {
        let action = Gp51Action::QueryMonitorList {
            username: username.to_string(),
        };
        let value = self.call(&action, now_ms).await?;
        let groups: Vec<DeviceGroup> = parse_field(&value, "groups")?;

        let mut devices = Vec::new();
        for group in groups {
            for mut device in group.devices {
                if device.group_name.is_none() && !group.group_name.is_empty() {
                    device.group_name = Some(group.group_name.clone());
                }
                devices.push(device);
            }
        }
        Ok(devices)
    }

    /// Latest known positions for the given devices.
    pub async fn last_positions(
        &self,
        device_ids: &[String],
        last_query_time_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<Position>> {
        let action = Gp51Action::LastPosition {
            device_ids: device_ids.to_vec(),
            last_query_time_ms,
        };
        let value = self.call(&action, now_ms).await?;
        let raw: Vec<RawPosition> = parse_field(&value, "records")?;
        Ok(raw.into_iter().map(RawPosition::into_position).collect())
    }

    /// Historical track points for one device in a time window.
    pub async fn query_tracks(
        &self,
        device_id: &str,
        begin_time_ms: i64,
        end_time_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<Position>> {
        let action = Gp51Action::QueryTracks {
            device_id: device_id.to_string(),
            begin_time_ms,
            end_time_ms,
        };
        let value = self.call(&action, now_ms).await?;
        let raw: Vec<RawPosition> = parse_field(&value, "records")?;
        Ok(raw.into_iter().map(RawPosition::into_position).collect())
    }

    /// All platform users.
    pub async fn query_all_users(&self, now_ms: i64) -> Result<Vec<UserRecord>> {
        let value = self.call(&Gp51Action::QueryAllUsers, now_ms).await?;
        parse_field(&value, "users")
    }
}

fn parse_field<T: DeserializeOwned>(value: &Value, field: &str) -> Result<T> {
    let raw = value.get(field).cloned().unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(raw)
        .map_err(|e| ClassifiedError::data(format!("malformed '{}' field in response: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_md5_hex_known_vector() {
        assert_eq!(md5_hex("123456"), "e10adc3949ba59abbe56e057f20f883e");
    }

    #[test]
    fn test_login_body_hashes_password() {
        let action = Gp51Action::Login {
            username: "octopus".into(),
            password: "123456".into(),
        };
        let body = action.body();
        assert_eq!(body["username"], "octopus");
        assert_eq!(body["password"], "e10adc3949ba59abbe56e057f20f883e");
    }

    #[test]
    fn test_action_names_and_token_requirements() {
        let login = Gp51Action::Login {
            username: "u".into(),
            password: "p".into(),
        };
        assert_eq!(login.name(), "login");
        assert!(!login.requires_token());

        let list = Gp51Action::QueryMonitorList { username: "u".into() };
        assert_eq!(list.name(), "querymonitorlist");
        assert!(list.requires_token());

        assert_eq!(Gp51Action::QueryAllUsers.name(), "queryallusers");
    }

    #[test]
    fn test_parse_vendor_payload_success() {
        let value = parse_vendor_payload(r#"{"status":0,"token":"abc"}"#).unwrap();
        assert_eq!(value["token"], "abc");
    }

    #[test]
    fn test_parse_vendor_payload_rejects_bad_bodies() {
        assert_eq!(parse_vendor_payload("").unwrap_err().kind, ErrorKind::Data);
        assert_eq!(
            parse_vendor_payload("not json").unwrap_err().kind,
            ErrorKind::Data
        );
        assert_eq!(
            parse_vendor_payload(r#"{"ok":true}"#).unwrap_err().kind,
            ErrorKind::Data
        );
    }

    #[test]
    fn test_vendor_status_classified_from_cause() {
        let err = parse_vendor_payload(r#"{"status":1,"cause":"token expired"}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Authentication);

        let err = parse_vendor_payload(r#"{"status":2,"cause":"action not found"}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Api);
        assert!(!err.recoverable);

        // No cause text: generic recoverable API error.
        let err = parse_vendor_payload(r#"{"status":9}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Api);
        assert!(err.recoverable);
    }

    #[test]
    fn test_session_validity_window() {
        let session = Gp51Session {
            token: "t".into(),
            username: "u".into(),
            expires_at_ms: 1_000,
        };
        assert!(session.is_valid(999));
        assert!(!session.is_valid(1_000));

        let empty = Gp51Session {
            token: String::new(),
            username: "u".into(),
            expires_at_ms: 1_000,
        };
        assert!(!empty.is_valid(0));
    }

    #[tokio::test]
    async fn test_call_without_session_fails_fast() {
        let client = Gp51Client::new(Gp51Config::default()).unwrap();
        let action = Gp51Action::QueryMonitorList { username: "u".into() };
        let err = client.call(&action, 0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn test_call_with_expired_session_fails_fast() {
        let client = Gp51Client::new(Gp51Config::default()).unwrap();
        client.install_session(Gp51Session {
            token: "t".into(),
            username: "u".into(),
            expires_at_ms: 100,
        });
        let action = Gp51Action::QueryMonitorList { username: "u".into() };
        let err = client.call(&action, 200).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Authentication);

        client.clear_session();
        assert!(client.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_attempt_with_backoff() {
        let attempts = AtomicU32::new(0);
        let start = Instant::now();

        let result = run_with_retry("test-op", 3, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ClassifiedError::timeout("simulated timeout"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Two timeout backoffs of 10s each.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(20));
        assert!(elapsed < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_error_is_never_retried() {
        let attempts = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<u32> = run_with_retry("test-op", 3, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ClassifiedError::authentication("bad token")) }
        })
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::Authentication);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let attempts = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<u32> = run_with_retry("test-op", 3, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ClassifiedError::timeout("still down")) }
        })
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::Timeout);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Backoff runs between attempts only: two waits, not three.
        assert!(start.elapsed() >= Duration::from_secs(20));
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_surfaces_as_timeout() {
        let err = with_deadline("slow-op", Duration::from_secs(5), async {
            futures::future::pending::<Result<()>>().await
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.detail.contains("slow-op"));
    }

    #[test]
    fn test_monitor_list_group_name_flattening() {
        let payload: Value = serde_json::from_str(
            r#"{
                "status": 0,
                "groups": [
                    {
                        "groupname": "Fleet A",
                        "devices": [
                            {"deviceid": "d1", "devicename": "Truck 1"},
                            {"deviceid": "d2", "devicename": "Truck 2", "groupname": "Override"}
                        ]
                    }
                ]
            }"#,
        )
        .unwrap();

        let groups: Vec<DeviceGroup> = parse_field(&payload, "groups").unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].devices.len(), 2);
        assert_eq!(groups[0].devices[1].group_name.as_deref(), Some("Override"));
    }

    #[test]
    fn test_raw_position_mapping() {
        let payload: Value = serde_json::from_str(
            r#"{
                "status": 0,
                "records": [
                    {"deviceid": "d1", "callat": 51.5, "callon": -0.12,
                     "speed": 43.0, "course": 180.0, "updatetime": 1700000000000}
                ]
            }"#,
        )
        .unwrap();

        let raw: Vec<RawPosition> = parse_field(&payload, "records").unwrap();
        let position = raw.into_iter().next().unwrap().into_position();
        assert_eq!(position.device_id, "d1");
        assert_eq!(position.latitude, 51.5);
        assert_eq!(position.speed, 43.0);
        assert_eq!(position.timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn test_parse_field_missing_defaults_to_empty() {
        let payload: Value = serde_json::from_str(r#"{"status":0}"#).unwrap();
        let users: Vec<UserRecord> = parse_field(&payload, "users").unwrap();
        assert!(users.is_empty());
    }
}
