// Stream records — the JSON envelope on the wire and the closed set of
// record variants the engine acts on.
//
// Every line of the stream is an envelope `{msgType, data, clientReceivedTsMs,
// ...}`. Validation happens once, here: an envelope either becomes one of the
// Record variants, is ignored (a msgType this engine doesn't consume), or
// fails with a ValidationError naming the offending field.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::db::models::{
    EngagementObservation, EngagementSnapshot, ExternalFeed, ExternalSample, PostKey,
    PostSentiment, PostType,
};

/// Suffix of records coming back from the sentiment classifier.
pub const RESPONSE_SUFFIX: &str = "-sentiment-response";
/// Suffix of records sent to the sentiment classifier.
pub const REQUEST_SUFFIX: &str = "-sentiment-request";

/// Twitter's legacy `created_at` format, e.g. `Wed Oct 10 20:19:24 +0000 2018`.
const TWITTER_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// One line of the stream. Fields this engine doesn't read are kept in
/// `extra` so re-emitted records carry them through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "msgType")]
    pub msg_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(
        rename = "clientReceivedTsMs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_received_ts_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictions: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{msg_type}: missing field {field}")]
    MissingField {
        msg_type: String,
        field: &'static str,
    },

    #[error("{msg_type}: field {field} has an unexpected type or value")]
    InvalidField {
        msg_type: String,
        field: &'static str,
    },

    #[error("{msg_type}: unrecognized created_at {value:?}")]
    InvalidTimestamp { msg_type: String, value: String },
}

/// A raw post as crawled, before sentiment scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPost {
    pub post_type: PostType,
    pub post_id: i64,
    pub text: String,
    pub user_name: String,
    pub created_at_ms: i64,
    pub interaction_total: i64,
    pub likes_total: i64,
    /// When the crawler received the post; falls back to `created_at_ms`.
    pub received_at_ms: i64,
}

impl RawPost {
    pub fn key(&self) -> PostKey {
        PostKey::new(self.post_type, self.post_id)
    }

    pub fn snapshot(&self) -> EngagementSnapshot {
        EngagementSnapshot {
            post_type: self.post_type,
            interaction_total: self.interaction_total,
            likes_total: self.likes_total,
        }
    }

    pub fn to_observation(&self) -> EngagementObservation {
        EngagementObservation {
            post_type: self.post_type,
            post_id: self.post_id,
            interaction_total: self.interaction_total,
            likes_total: self.likes_total,
            observed_at_ms: self.received_at_ms,
        }
    }
}

/// The records this engine consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// A crawled post carrying engagement counters.
    RawPost(RawPost),
    /// A post returned by the sentiment classifier.
    ScoredPost(PostSentiment),
    /// A reading from a third-party sentiment feed.
    External(ExternalSample),
}

impl Record {
    /// Validate an envelope into a record. `Ok(None)` for message types this
    /// engine doesn't consume.
    pub fn parse(envelope: &Envelope) -> Result<Option<Record>, ValidationError> {
        let msg_type = envelope.msg_type.as_str();

        if let Some(post_type) = PostType::from_tag(msg_type) {
            return parse_raw_post(envelope, post_type).map(|p| Some(Record::RawPost(p)));
        }

        if let Some(post_type) = msg_type
            .strip_suffix(RESPONSE_SUFFIX)
            .and_then(PostType::from_tag)
        {
            return parse_scored_post(envelope, post_type).map(|p| Some(Record::ScoredPost(p)));
        }

        if let Some(feed) = ExternalFeed::from_tag(msg_type) {
            return parse_external(envelope, feed).map(|s| Some(Record::External(s)));
        }

        Ok(None)
    }
}

impl Envelope {
    /// Rewrite a raw post envelope into a classifier request. Message board
    /// posts carry their text in `body`; the classifier reads `text`.
    pub fn into_sentiment_request(mut self) -> Envelope {
        if self.msg_type == PostType::Stocktwit.as_str() {
            if let Some(data) = self.data.as_object_mut() {
                if let Some(body) = data.remove("body") {
                    data.insert("text".to_string(), body);
                }
            }
        }
        self.msg_type = format!("{}{}", self.msg_type, REQUEST_SUFFIX);
        self
    }
}

fn missing(envelope: &Envelope, field: &'static str) -> ValidationError {
    ValidationError::MissingField {
        msg_type: envelope.msg_type.clone(),
        field,
    }
}

fn invalid(envelope: &Envelope, field: &'static str) -> ValidationError {
    ValidationError::InvalidField {
        msg_type: envelope.msg_type.clone(),
        field,
    }
}

/// Look up a JSON pointer under `data`, treating `null` as absent.
fn lookup<'a>(data: &'a Value, pointer: &str) -> Option<&'a Value> {
    data.pointer(pointer).filter(|v| !v.is_null())
}

fn required_str(envelope: &Envelope, pointer: &'static str) -> Result<String, ValidationError> {
    match lookup(&envelope.data, pointer) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(invalid(envelope, pointer)),
        None => Err(missing(envelope, pointer)),
    }
}

/// An integer that may arrive as a JSON number or a string of digits.
fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn required_id(envelope: &Envelope) -> Result<i64, ValidationError> {
    let value = lookup(&envelope.data, "/id").ok_or_else(|| missing(envelope, "/id"))?;
    as_integer(value).ok_or_else(|| invalid(envelope, "/id"))
}

fn optional_count(envelope: &Envelope, pointer: &'static str) -> Result<i64, ValidationError> {
    match lookup(&envelope.data, pointer) {
        Some(value) => as_integer(value).ok_or_else(|| invalid(envelope, pointer)),
        None => Ok(0),
    }
}

fn required_prediction(envelope: &Envelope, name: &'static str) -> Result<f64, ValidationError> {
    let values = envelope
        .predictions
        .as_ref()
        .and_then(|p| p.get("values"))
        .ok_or_else(|| missing(envelope, "predictions"))?;
    match values.get(name).filter(|v| !v.is_null()) {
        Some(value) => value.as_f64().ok_or_else(|| invalid(envelope, name)),
        None => Err(missing(envelope, name)),
    }
}

/// The blended score every series is built from; 0.5 is neutral.
fn required_mixed_sentiment(envelope: &Envelope) -> Result<f64, ValidationError> {
    const FIELD: &str = "bull_vader_sentiment";
    let value = required_prediction(envelope, FIELD)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(envelope, FIELD));
    }
    Ok(value)
}

fn required_created_at(envelope: &Envelope) -> Result<i64, ValidationError> {
    let value = lookup(&envelope.data, "/created_at")
        .ok_or_else(|| missing(envelope, "/created_at"))?;
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => parse_created_at(s),
        _ => None,
    };
    parsed.ok_or_else(|| ValidationError::InvalidTimestamp {
        msg_type: envelope.msg_type.clone(),
        value: value.to_string(),
    })
}

/// Parse a post timestamp into epoch milliseconds.
///
/// Accepts RFC 3339 (`2018-10-10T20:19:24Z`), Twitter's legacy format
/// (`Wed Oct 10 20:19:24 +0000 2018`), a naive `YYYY-MM-DD HH:MM:SS` taken as
/// UTC, or a string of epoch milliseconds.
pub fn parse_created_at(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(ms) = value.parse::<i64>() {
        return Some(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_str(value, TWITTER_TIME_FORMAT) {
        return Some(dt.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Where each source keeps the fields we need.
struct SourceLayout {
    text: &'static str,
    user_name: &'static str,
    interaction: &'static str,
    likes: &'static str,
}

fn layout(post_type: PostType) -> SourceLayout {
    match post_type {
        PostType::Stocktwit => SourceLayout {
            text: "/body",
            user_name: "/user/username",
            interaction: "/conversation/replies",
            likes: "/likes/total",
        },
        PostType::TwitterTopic | PostType::TwitterUser => SourceLayout {
            text: "/text",
            user_name: "/user/screen_name",
            interaction: "/retweet_count",
            likes: "/favorite_count",
        },
    }
}

fn parse_raw_post(envelope: &Envelope, post_type: PostType) -> Result<RawPost, ValidationError> {
    let layout = layout(post_type);
    let created_at_ms = required_created_at(envelope)?;

    Ok(RawPost {
        post_type,
        post_id: required_id(envelope)?,
        text: required_str(envelope, layout.text)?,
        user_name: required_str(envelope, layout.user_name)?,
        created_at_ms,
        interaction_total: optional_count(envelope, layout.interaction)?,
        likes_total: optional_count(envelope, layout.likes)?,
        received_at_ms: envelope.client_received_ts_ms.unwrap_or(created_at_ms),
    })
}

fn parse_scored_post(
    envelope: &Envelope,
    post_type: PostType,
) -> Result<PostSentiment, ValidationError> {
    let layout = layout(post_type);
    let post_id = required_id(envelope)?;
    let user_name = required_str(envelope, layout.user_name)?;
    // Requests move the message board `body` into `text`; accept either.
    let body = required_str(envelope, "/text").or_else(|_| required_str(envelope, layout.text))?;
    let link = match post_type {
        PostType::Stocktwit => format!("https://stocktwits.com/{user_name}/message/{post_id}"),
        PostType::TwitterTopic | PostType::TwitterUser => {
            format!("https://twitter.com/{user_name}/status/{post_id}")
        }
    };

    Ok(PostSentiment {
        post_type,
        post_id,
        body,
        link,
        user_name,
        sentiment_ml_model: required_prediction(envelope, "bull_sentiment")?,
        sentiment_vader_normalized: required_prediction(envelope, "vader_sentiment")?,
        sentiment_mixed: required_mixed_sentiment(envelope)?,
        impact: 1,
        created_at_ms: required_created_at(envelope)?,
        client_received_ms: envelope
            .client_received_ts_ms
            .ok_or_else(|| missing(envelope, "clientReceivedTsMs"))?,
    })
}

fn parse_external(envelope: &Envelope, feed: ExternalFeed) -> Result<ExternalSample, ValidationError> {
    let field = feed.value_field();
    let raw = match envelope.data.get(field).filter(|v| !v.is_null()) {
        Some(value) => value.as_f64().ok_or_else(|| invalid(envelope, field))?,
        None => return Err(missing(envelope, field)),
    };

    Ok(ExternalSample {
        feed,
        received_at_ms: envelope
            .client_received_ts_ms
            .ok_or_else(|| missing(envelope, "clientReceivedTsMs"))?,
        sentiment_absolute: feed.normalize(raw),
    })
}
