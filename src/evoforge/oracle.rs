//! Provider-agnostic oracle client primitives.
//!
//! Every agent in the swarm talks to exactly one external capability: "given a
//! prompt, return text".  The [`OracleClient`] trait abstracts that capability
//! over concrete vendor implementations, while [`ask_structured`] layers the
//! hard parts on top of it once, for everyone:
//!
//! - bounded retry with exponential backoff (1s start, x2, 10s cap),
//! - retryable/fatal error classification,
//! - defensive extraction of JSON from free-form model output,
//! - shallow schema validation of the extracted value.
//!
//! The oracle is a natural-language model, so responses routinely arrive
//! wrapped in code fences, prose, or half-valid JSON.  Handling that here
//! means the role parsers in [`population`](crate::evoforge::population) can
//! assume a well-formed [`serde_json::Value`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use evoforge::oracle::{
//!     ask_structured, CancelSignal, ExpectedShape, FieldType, OracleClient,
//! };
//!
//! # async fn demo(client: Arc<dyn OracleClient>) -> Result<(), Box<dyn std::error::Error>> {
//! let schema = [("title", FieldType::String), ("novelty", FieldType::Number)];
//! let answer = ask_structured(
//!     client.as_ref(),
//!     "gpt-4o-mini",
//!     "Propose one idea as JSON with fields title and novelty.",
//!     ExpectedShape::JsonObject,
//!     &schema,
//!     &CancelSignal::never(),
//! )
//! .await?;
//! println!("{}", answer.value["title"]);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Default number of attempts made by [`ask_structured`] before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// First backoff delay between attempts.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on the backoff delay, regardless of attempt count.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Classification of an oracle failure.
///
/// The split drives the retry loop in [`ask_structured`]: retryable kinds are
/// attempted again with backoff, fatal kinds short-circuit immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleErrorKind {
    /// Connection reset, timeout, DNS failure, connection refused.
    Transport,
    /// HTTP 429 from the provider.
    RateLimited,
    /// HTTP 5xx from the provider.
    Server,
    /// The response text did not contain parseable JSON.
    JsonParse,
    /// The parsed value did not match the expected shape or field types.
    SchemaMismatch,
    /// Authentication or authorization failure (HTTP 401/403).
    Auth,
    /// The request itself was malformed (other HTTP 4xx).
    BadRequest,
    /// The caller cancelled the operation.
    Cancelled,
    /// All attempts were exhausted; the last cause is attached.
    Exhausted,
}

impl OracleErrorKind {
    /// Whether another attempt may succeed for this failure kind.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            OracleErrorKind::Transport
                | OracleErrorKind::RateLimited
                | OracleErrorKind::Server
                | OracleErrorKind::JsonParse
                | OracleErrorKind::SchemaMismatch
        )
    }
}

/// Error type returned by oracle calls.
///
/// Carries a [`OracleErrorKind`] classification and, for
/// [`Exhausted`](OracleErrorKind::Exhausted) errors, the last underlying
/// cause so callers can see *why* the retries failed.
#[derive(Debug)]
pub struct OracleError {
    kind: OracleErrorKind,
    message: String,
    cause: Option<Box<OracleError>>,
}

impl OracleError {
    /// Build an error with the given classification and message.
    pub fn new(kind: OracleErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Build the terminal error produced when every attempt has failed.
    pub fn exhausted(last_cause: OracleError) -> Self {
        Self {
            kind: OracleErrorKind::Exhausted,
            message: format!("oracle unavailable after retries: {}", last_cause),
            cause: Some(Box::new(last_cause)),
        }
    }

    /// Build a cancellation error.
    pub fn cancelled() -> Self {
        Self::new(OracleErrorKind::Cancelled, "oracle call cancelled")
    }

    /// The failure classification.
    pub fn kind(&self) -> OracleErrorKind {
        self.kind
    }

    /// Whether the retry loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// The last underlying cause, present on exhaustion errors.
    pub fn last_cause(&self) -> Option<&OracleError> {
        self.cause.as_deref()
    }
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OracleErrorKind::Transport => write!(f, "transport error: {}", self.message),
            OracleErrorKind::RateLimited => write!(f, "rate limited: {}", self.message),
            OracleErrorKind::Server => write!(f, "server error: {}", self.message),
            OracleErrorKind::JsonParse => write!(f, "JSON parse failure: {}", self.message),
            OracleErrorKind::SchemaMismatch => write!(f, "schema mismatch: {}", self.message),
            OracleErrorKind::Auth => write!(f, "authentication failure: {}", self.message),
            OracleErrorKind::BadRequest => write!(f, "malformed request: {}", self.message),
            OracleErrorKind::Cancelled => write!(f, "cancelled: {}", self.message),
            OracleErrorKind::Exhausted => write!(f, "{}", self.message),
        }
    }
}

impl Error for OracleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_ref().map(|c| c.as_ref() as &(dyn Error + 'static))
    }
}

/// Trait-driven abstraction over a concrete text-completion provider.
///
/// Implementations must be thread-safe (`Send + Sync`) so a single client can
/// be shared across every agent task in a run via `Arc<dyn OracleClient>`.
/// Implementations should *not* retry internally; retry lives in
/// [`ask_structured`] so the policy is applied uniformly.
#[async_trait]
pub trait OracleClient: Send + Sync {
    /// Send `prompt` to the model identified by `model` and return the raw
    /// completion text.
    async fn ask(&self, model: &str, prompt: &str) -> Result<String, OracleError>;
}

/// The shape [`ask_structured`] expects to extract from the raw completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedShape {
    /// No extraction; the trimmed completion text is returned as a JSON string.
    Text,
    /// The first balanced `{...}` object in the completion.
    JsonObject,
    /// The first balanced `[...]` array in the completion.
    JsonArray,
}

/// Shallow field-type constraint used by [`validate_schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    /// Present with any type.
    Any,
}

/// Retry tuning for [`ask_structured_with_policy`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Cap applied after each doubling.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }
}

/// A successfully parsed structured answer.
///
/// `retry_errors` holds one human-readable entry per failed attempt that
/// preceded the success, so callers can surface warnings without the oracle
/// layer knowing anything about event buses.
#[derive(Debug, Clone)]
pub struct StructuredAnswer {
    /// The extracted and schema-validated value.
    pub value: serde_json::Value,
    /// 1-based attempt number that produced `value`.
    pub attempts: u32,
    /// Description of each failed attempt before the successful one.
    pub retry_errors: Vec<String>,
}

/// Cooperative cancellation signal handed down from a run to every
/// subordinate oracle call.
///
/// Clones observe the same underlying [`watch`] channel.  The signal is
/// checked between retry attempts and raced against the in-flight provider
/// call.
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
    // Keeps the channel open for signals constructed via `never()`.
    _hold: Option<Arc<watch::Sender<bool>>>,
}

/// The triggering side of a [`CancelSignal`] pair.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Fire the signal.  All clones of the paired [`CancelSignal`] observe it.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether [`cancel`](CancelHandle::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Create a connected `(handle, signal)` pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx, _hold: None })
}

impl CancelSignal {
    /// A signal that never fires.  Useful for tests and one-shot tools.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _hold: Some(Arc::new(tx)),
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested.  Never resolves if the handle
    /// side is dropped without firing.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without cancelling; park forever.
                futures_util::future::pending::<()>().await;
            }
        }
    }
}

/// Ask the oracle for a structured answer using the default [`RetryPolicy`].
///
/// See [`ask_structured_with_policy`] for the full contract.
pub async fn ask_structured(
    client: &dyn OracleClient,
    model: &str,
    prompt: &str,
    shape: ExpectedShape,
    schema: &[(&str, FieldType)],
    cancel: &CancelSignal,
) -> Result<StructuredAnswer, OracleError> {
    ask_structured_with_policy(client, model, prompt, shape, schema, cancel, &RetryPolicy::default())
        .await
}

/// Ask the oracle for a structured answer, retrying on retryable failures.
///
/// One attempt is: call [`OracleClient::ask`], extract JSON per `shape`,
/// validate against `schema`.  JSON parse failures and schema mismatches are
/// retryable exactly like transport errors; a language model that produced
/// broken JSON once frequently produces valid JSON on the next attempt.
///
/// Fatal errors (auth, malformed request, cancellation) short-circuit.  When
/// every attempt fails the returned error has kind
/// [`OracleErrorKind::Exhausted`] with the last cause attached.
///
/// Cancellation is observed between attempts (during backoff) and raced
/// against the in-flight call itself.
pub async fn ask_structured_with_policy(
    client: &dyn OracleClient,
    model: &str,
    prompt: &str,
    shape: ExpectedShape,
    schema: &[(&str, FieldType)],
    cancel: &CancelSignal,
    policy: &RetryPolicy,
) -> Result<StructuredAnswer, OracleError> {
    let mut backoff = policy.initial_backoff;
    let mut retry_errors: Vec<String> = Vec::new();
    let mut last: Option<OracleError> = None;
    let attempts = policy.max_attempts.max(1);

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(OracleError::cancelled());
        }

        if attempt > 1 {
            let mut cancel_wait = cancel.clone();
            tokio::select! {
                _ = cancel_wait.cancelled() => return Err(OracleError::cancelled()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(policy.max_backoff);
        }

        let mut cancel_call = cancel.clone();
        let raw = tokio::select! {
            _ = cancel_call.cancelled() => return Err(OracleError::cancelled()),
            result = client.ask(model, prompt) => result,
        };

        match raw {
            Ok(text) => {
                match extract_json(&text, shape).and_then(|value| {
                    validate_schema(&value, schema)?;
                    Ok(value)
                }) {
                    Ok(value) => {
                        return Ok(StructuredAnswer {
                            value,
                            attempts: attempt,
                            retry_errors,
                        });
                    }
                    Err(err) => {
                        log::debug!(
                            "oracle attempt {}/{} for model {} produced unusable output: {}",
                            attempt,
                            attempts,
                            model,
                            err
                        );
                        retry_errors.push(format!("attempt {}: {}", attempt, err));
                        last = Some(err);
                    }
                }
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                log::warn!(
                    "oracle attempt {}/{} for model {} failed: {}",
                    attempt,
                    attempts,
                    model,
                    err
                );
                retry_errors.push(format!("attempt {}: {}", attempt, err));
                last = Some(err);
            }
        }
    }

    Err(OracleError::exhausted(last.unwrap_or_else(|| {
        OracleError::new(OracleErrorKind::Server, "no attempts were made")
    })))
}

/// Extract a JSON value of the expected shape from raw model output.
///
/// The extraction is deliberately forgiving, in this order:
///
/// 1. strip Markdown code-fence wrappers,
/// 2. locate the first balanced bracket pair of the right kind, tracking
///    nesting and string literals so stray closers and braces inside strings
///    are tolerated,
/// 3. drop ASCII control characters,
/// 4. strip `//` and `/* */` comments and trailing commas outside strings,
/// 5. parse with [`serde_json`].
///
/// # Examples
///
/// ```rust
/// use evoforge::oracle::{extract_json, ExpectedShape};
///
/// let fence = "```";
/// let raw = format!("Sure! Here you go:\n{}json\n{{\"title\": \"A\", \"novelty\": 0.7,}}\n{}", fence, fence);
/// let value = extract_json(&raw, ExpectedShape::JsonObject).unwrap();
/// assert_eq!(value["title"], "A");
/// ```
pub fn extract_json(raw: &str, shape: ExpectedShape) -> Result<serde_json::Value, OracleError> {
    if let ExpectedShape::Text = shape {
        return Ok(serde_json::Value::String(raw.trim().to_string()));
    }

    let (open, close) = match shape {
        ExpectedShape::JsonObject => ('{', '}'),
        ExpectedShape::JsonArray => ('[', ']'),
        ExpectedShape::Text => unreachable!(),
    };

    let defenced = strip_code_fences(raw);
    let candidate = balanced_slice(defenced, open, close).ok_or_else(|| {
        OracleError::new(
            OracleErrorKind::JsonParse,
            format!("no balanced '{}…{}' found in oracle output", open, close),
        )
    })?;
    let cleaned = sanitize_json(candidate);

    serde_json::from_str(&cleaned)
        .map_err(|e| OracleError::new(OracleErrorKind::JsonParse, e.to_string()))
}

/// Validate a parsed value against a shallow field-type map.
///
/// Fields named in `schema` must be present on the object (or on every
/// element of an array of objects) with the given type.  Mismatches are
/// classified retryable, and the model is asked again.
pub fn validate_schema(
    value: &serde_json::Value,
    schema: &[(&str, FieldType)],
) -> Result<(), OracleError> {
    if schema.is_empty() {
        return Ok(());
    }
    match value {
        serde_json::Value::Object(_) => validate_object(value, schema),
        serde_json::Value::Array(items) => {
            for item in items {
                validate_object(item, schema)?;
            }
            Ok(())
        }
        other => Err(OracleError::new(
            OracleErrorKind::SchemaMismatch,
            format!("expected object or array, found {}", json_type_name(other)),
        )),
    }
}

fn validate_object(
    value: &serde_json::Value,
    schema: &[(&str, FieldType)],
) -> Result<(), OracleError> {
    let obj = value.as_object().ok_or_else(|| {
        OracleError::new(
            OracleErrorKind::SchemaMismatch,
            format!("expected object, found {}", json_type_name(value)),
        )
    })?;
    for (field, expected) in schema {
        let actual = obj.get(*field).ok_or_else(|| {
            OracleError::new(
                OracleErrorKind::SchemaMismatch,
                format!("missing field '{}'", field),
            )
        })?;
        let ok = match expected {
            FieldType::String => actual.is_string(),
            FieldType::Number => actual.is_number(),
            FieldType::Boolean => actual.is_boolean(),
            FieldType::Array => actual.is_array(),
            FieldType::Any => true,
        };
        if !ok {
            return Err(OracleError::new(
                OracleErrorKind::SchemaMismatch,
                format!(
                    "field '{}' has type {}, expected {:?}",
                    field,
                    json_type_name(actual),
                    expected
                ),
            ));
        }
    }
    Ok(())
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Remove Markdown code-fence wrappers (```json … ``` and bare ``` … ```).
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return raw;
    }
    // Skip the opening fence line (which may carry a language tag).
    let after_open = match trimmed.find('\n') {
        Some(idx) => &trimmed[idx + 1..],
        None => return raw,
    };
    match after_open.rfind("```") {
        Some(idx) => &after_open[..idx],
        None => after_open,
    }
}

/// Find the first balanced `open…close` slice, tracking nesting depth and
/// string literals.  Closers appearing before the first opener are skipped,
/// which tolerates model output like `"} Sure: {\"a\":1}"`.
fn balanced_slice(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == open {
            depth += 1;
        } else if ch == close {
            // Stray closers inside the candidate cannot occur once depth
            // tracking has started; depth 0 is unreachable here.
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(&text[start..start + offset + ch.len_utf8()]);
            }
        }
    }
    None
}

/// Drop control characters and strip comments and trailing commas outside of
/// string literals.
fn sanitize_json(candidate: &str) -> String {
    // Pass 1: remove control characters and comments.
    let mut no_comments = String::with_capacity(candidate.len());
    let mut chars = candidate.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(ch) = chars.next() {
        if in_string {
            // Raw control characters are invalid inside JSON strings; soften
            // them to spaces rather than losing the whole response.
            if (ch as u32) < 0x20 {
                no_comments.push(' ');
            } else {
                no_comments.push(ch);
            }
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                no_comments.push(ch);
            }
            '/' => match chars.peek() {
                Some('/') => {
                    while let Some(&next) = chars.peek() {
                        if next == '\n' {
                            break;
                        }
                        chars.next();
                    }
                }
                Some('*') => {
                    chars.next();
                    let mut prev = '\0';
                    while let Some(inner) = chars.next() {
                        if prev == '*' && inner == '/' {
                            break;
                        }
                        prev = inner;
                    }
                }
                _ => no_comments.push(ch),
            },
            c if (c as u32) < 0x20 && c != '\n' && c != '\t' => {}
            c => no_comments.push(c),
        }
    }

    // Pass 2: remove trailing commas (a comma whose next non-whitespace
    // character closes the container).
    let mut out = String::with_capacity(no_comments.len());
    let bytes: Vec<char> = no_comments.chars().collect();
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0usize;

    while i < bytes.len() {
        let ch = bytes[i];
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if ch == '"' {
            in_string = true;
            out.push(ch);
            i += 1;
            continue;
        }
        if ch == ',' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_whitespace() {
                j += 1;
            }
            if j < bytes.len() && (bytes[j] == '}' || bytes[j] == ']') {
                i += 1;
                continue;
            }
        }
        out.push(ch);
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_object_from_prose() {
        let raw = "Of course. The idea: {\"title\": \"X\"} enjoy!";
        let value = extract_json(raw, ExpectedShape::JsonObject).unwrap();
        assert_eq!(value["title"], "X");
    }

    #[test]
    fn tolerates_stray_closers_before_opener() {
        let raw = "}} noise {\"a\": 1}";
        let value = extract_json(raw, ExpectedShape::JsonObject).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn ignores_braces_inside_strings() {
        let raw = "{\"text\": \"look: } and { inside\", \"n\": 2}";
        let value = extract_json(raw, ExpectedShape::JsonObject).unwrap();
        assert_eq!(value["n"], 2);
    }

    #[test]
    fn strips_fences_comments_and_trailing_commas() {
        let raw = "```json\n{\n  // a comment\n  \"a\": [1, 2, 3,], /* block */\n  \"b\": \"ok\",\n}\n```";
        let value = extract_json(raw, ExpectedShape::JsonObject).unwrap();
        assert_eq!(value["a"].as_array().unwrap().len(), 3);
        assert_eq!(value["b"], "ok");
    }

    #[test]
    fn drops_control_characters() {
        let raw = "{\"a\": \u{0001}1}";
        let value = extract_json(raw, ExpectedShape::JsonObject).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn extracts_array_shape() {
        let raw = "ideas below\n[{\"t\": 1}, {\"t\": 2}]";
        let value = extract_json(raw, ExpectedShape::JsonArray).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
    }

    #[test]
    fn missing_json_is_a_parse_error() {
        let err = extract_json("no json here", ExpectedShape::JsonObject).unwrap_err();
        assert_eq!(err.kind(), OracleErrorKind::JsonParse);
        assert!(err.is_retryable());
    }

    #[test]
    fn schema_validation_catches_type_mismatch() {
        let value = serde_json::json!({"title": "ok", "novelty": "high"});
        let schema = [("title", FieldType::String), ("novelty", FieldType::Number)];
        let err = validate_schema(&value, &schema).unwrap_err();
        assert_eq!(err.kind(), OracleErrorKind::SchemaMismatch);
    }

    #[test]
    fn schema_validation_applies_to_array_elements() {
        let value = serde_json::json!([{"title": "a"}, {"nope": 1}]);
        let schema = [("title", FieldType::String)];
        assert!(validate_schema(&value, &schema).is_err());
    }

    #[test]
    fn exhausted_carries_last_cause() {
        let last = OracleError::new(OracleErrorKind::JsonParse, "bad brace");
        let err = OracleError::exhausted(last);
        assert_eq!(err.kind(), OracleErrorKind::Exhausted);
        assert_eq!(
            err.last_cause().unwrap().kind(),
            OracleErrorKind::JsonParse
        );
    }
}
