// Data models — the records that flow between the engine and its store.
//
// These are separate from the SQL so the engine components can use them
// without depending on rusqlite or sqlx directly. Field names serialize in
// camelCase to match the external activity payload shape.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::feed::{FeedKind, RankSpec};

/// Canonical text form of a timestamp (RFC 3339, millisecond precision, UTC).
///
/// Every stored timestamp goes through this so that `(foreignId, time)`
/// comparisons and recency ordering work on the text column directly.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// A feed: an addressable, ordered collection of activities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feed {
    /// "<group>:<target>"
    pub id: String,
    pub group: String,
    pub target: String,
    pub kind: FeedKind,
    pub realtime: bool,
    /// Trim threshold; None disables trimming.
    pub max_length: Option<u32>,
    /// Aggregation template (aggregated/notification feeds only).
    pub aggregation: Option<String>,
    /// Rank spec for bucket contents (aggregated/notification feeds only).
    pub rank: Option<String>,
    pub seen_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Feed {
    /// The template used to compute bucket group keys.
    pub fn aggregation_template(&self) -> &str {
        self.aggregation
            .as_deref()
            .unwrap_or_else(|| self.kind.default_template())
    }

    /// The feed's rank spec; an unparseable stored value falls back to the default.
    pub fn rank_spec(&self) -> RankSpec {
        self.rank
            .as_deref()
            .and_then(|r| RankSpec::parse(r).ok())
            .unwrap_or_default()
    }
}

/// Values used when a feed is lazily created.
#[derive(Debug, Clone)]
pub struct NewFeed {
    pub id: String,
    pub group: String,
    pub target: String,
    pub kind: FeedKind,
    pub max_length: Option<u32>,
}

/// Mutable feed settings. Unset fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSettings {
    pub realtime: Option<bool>,
    pub max_length: Option<u32>,
    pub aggregation: Option<String>,
    pub rank: Option<String>,
}

/// An activity as submitted by a caller (or copied between feeds).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewActivity {
    /// Owning feed; stamped by the engine from the addressed feed.
    #[serde(default)]
    pub feed: String,
    pub actor: String,
    pub verb: String,
    pub object: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Caller-supplied external id; `(foreignId, time)` identifies the
    /// activity for idempotent re-creation, update and removal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_id: Option<String>,
    /// Logical event time; defaults to now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Additional feeds to copy into at create time. Never persisted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    /// Feed this copy came from (cc, fan-out or backfill).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Id of the original activity this copy was made from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub popularity: Option<i64>,
    /// Free-form fields (message, state, ...) stored verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NewActivity {
    pub fn new(actor: &str, verb: &str, object: &str) -> Self {
        Self {
            actor: actor.to_string(),
            verb: verb.to_string(),
            object: object.to_string(),
            ..Default::default()
        }
    }

    pub fn with_foreign_id(mut self, foreign_id: &str, time: DateTime<Utc>) -> Self {
        self.foreign_id = Some(foreign_id.to_string());
        self.time = Some(time);
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn with_cc(mut self, feeds: &[&str]) -> Self {
        self.cc = feeds.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

/// A stored activity, either a flat-feed record or an item inside a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: i64,
    pub feed: String,
    pub actor: String,
    pub verb: String,
    pub object: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_id: Option<String>,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<i64>,
    pub popularity: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Activity {
    /// Build the stored form of a new activity.
    pub fn from_new(id: i64, new: NewActivity, now: DateTime<Utc>) -> Self {
        Self {
            id,
            feed: new.feed,
            actor: new.actor,
            verb: new.verb,
            object: new.object,
            target: new.target,
            foreign_id: new.foreign_id,
            time: new.time.unwrap_or(now),
            source: new.source,
            origin: new.origin,
            popularity: new.popularity.unwrap_or(1),
            extra: new.extra,
            created_at: now,
            updated_at: now,
        }
    }

    /// Id of the activity this one ultimately derives from.
    pub fn root_id(&self) -> i64 {
        self.origin.unwrap_or(self.id)
    }

    /// A copy of this activity destined for another feed. The store assigns
    /// a fresh id; `source` records where the copy came from and `origin`
    /// links it back to the root activity.
    pub fn to_copy(&self, feed: &str, source: &str) -> NewActivity {
        NewActivity {
            feed: feed.to_string(),
            actor: self.actor.clone(),
            verb: self.verb.clone(),
            object: self.object.clone(),
            target: self.target.clone(),
            foreign_id: self.foreign_id.clone(),
            time: Some(self.time),
            cc: Vec::new(),
            source: Some(source.to_string()),
            origin: Some(self.root_id()),
            popularity: Some(self.popularity),
            extra: self.extra.clone(),
        }
    }
}

/// How an update or removal finds its activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivitySelector {
    /// The store-assigned id.
    Id(i64),
    /// The caller's external id plus the activity time.
    #[serde(rename_all = "camelCase")]
    Foreign {
        foreign_id: String,
        time: DateTime<Utc>,
    },
    /// Every copy of the given root activity.
    Origin(i64),
    /// Every activity copied from the given source feed.
    Source(String),
}

impl ActivitySelector {
    pub fn foreign(foreign_id: &str, time: DateTime<Utc>) -> Self {
        ActivitySelector::Foreign {
            foreign_id: foreign_id.to_string(),
            time,
        }
    }

    /// Selector that matches the copies of `activity` in other feeds.
    pub fn copies_of(activity: &Activity) -> Self {
        ActivitySelector::Origin(activity.root_id())
    }
}

/// Fields an update may change. Unset fields are left alone; `extra` keys
/// are merged into the stored object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub popularity: Option<i64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ActivityPatch {
    pub fn is_empty(&self) -> bool {
        self.actor.is_none()
            && self.verb.is_none()
            && self.object.is_none()
            && self.target.is_none()
            && self.popularity.is_none()
            && self.extra.is_empty()
    }

    /// Apply the patch to an in-memory activity.
    pub fn apply(&self, activity: &mut Activity) {
        if let Some(actor) = &self.actor {
            activity.actor = actor.clone();
        }
        if let Some(verb) = &self.verb {
            activity.verb = verb.clone();
        }
        if let Some(object) = &self.object {
            activity.object = object.clone();
        }
        if let Some(target) = &self.target {
            activity.target = Some(target.clone());
        }
        if let Some(popularity) = self.popularity {
            activity.popularity = popularity;
        }
        for (k, v) in &self.extra {
            activity.extra.insert(k.clone(), v.clone());
        }
    }
}

/// One element of a bulk update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityUpdate {
    pub selector: ActivitySelector,
    pub patch: ActivityPatch,
}

/// Paging and filtering for feed reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityQuery {
    pub limit: usize,
    pub offset: usize,
    pub verb: Option<String>,
    pub actor: Option<String>,
    pub source: Option<String>,
}

impl Default for ActivityQuery {
    fn default() -> Self {
        Self {
            limit: 25,
            offset: 0,
            verb: None,
            actor: None,
            source: None,
        }
    }
}

impl ActivityQuery {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn has_filter(&self) -> bool {
        self.verb.is_some() || self.actor.is_some() || self.source.is_some()
    }

    pub fn matches(&self, activity: &Activity) -> bool {
        self.verb.as_ref().is_none_or(|v| &activity.verb == v)
            && self.actor.as_ref().is_none_or(|a| &activity.actor == a)
            && self
                .source
                .as_ref()
                .is_none_or(|s| activity.source.as_ref() == Some(s))
    }
}

/// Identity of an aggregation bucket (not unique: a full bucket and its
/// successor share the same key).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub feed: String,
    pub group: String,
    pub verb: String,
}

/// A bounded group of activities displayed as one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationBucket {
    pub id: i64,
    pub feed: String,
    pub group: String,
    pub verb: String,
    /// Distinct actors, in rank order of the activities.
    pub actors: Vec<String>,
    /// Distinct objects, in rank order of the activities.
    pub objects: Vec<String>,
    pub activities: Vec<Activity>,
    pub seen_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AggregationBucket {
    /// Order the activities by `rank` and rebuild the distinct caches.
    pub fn rank_activities(&mut self, rank: &RankSpec) {
        rank.sort(&mut self.activities);
        self.actors = distinct(self.activities.iter().map(|a| a.actor.as_str()));
        self.objects = distinct(self.activities.iter().map(|a| a.object.as_str()));
    }
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for v in values {
        if !out.iter().any(|o| o == v) {
            out.push(v.to_string());
        }
    }
    out
}

/// The result of reading a feed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "items", rename_all = "lowercase")]
pub enum FeedItems {
    Flat(Vec<Activity>),
    Aggregated(Vec<AggregationBucket>),
}

impl FeedItems {
    /// Number of activities across all items.
    pub fn activity_count(&self) -> usize {
        match self {
            FeedItems::Flat(items) => items.len(),
            FeedItems::Aggregated(buckets) => buckets.iter().map(|b| b.activities.len()).sum(),
        }
    }

    pub fn into_activities(self) -> Vec<Activity> {
        match self {
            FeedItems::Flat(items) => items,
            FeedItems::Aggregated(buckets) => {
                buckets.into_iter().flat_map(|b| b.activities).collect()
            }
        }
    }
}

/// Engagement marks on notification buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Seen,
    Read,
}

/// A directed, prioritized follow edge between two feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Followship {
    pub follower: String,
    pub followee: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

/// A single failed item of an unordered bulk write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkFailure {
    /// Position of the item in the submitted batch.
    pub index: usize,
    pub message: String,
}

/// Outcome of an unordered bulk write. Failures do not roll back siblings.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkWriteResult {
    pub inserted: usize,
    /// Items that matched an existing record by idempotency key.
    pub upserted: usize,
    pub matched: usize,
    pub modified: usize,
    pub removed: usize,
    pub failures: Vec<BulkFailure>,
}

impl BulkWriteResult {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: BulkWriteResult) {
        self.inserted += other.inserted;
        self.upserted += other.upserted;
        self.matched += other.matched;
        self.modified += other.modified;
        self.removed += other.removed;
        self.failures.extend(other.failures);
    }
}

/// Idempotency keys already claimed by earlier items of one batch.
///
/// A batch written in a single pass must not insert the same origin or
/// `(foreignId, time)` twice; later duplicates refresh the first record.
#[derive(Debug, Default)]
pub struct BatchKeys<'a> {
    by_origin: HashMap<i64, usize>,
    by_foreign: HashMap<(&'a str, String), usize>,
}

impl<'a> BatchKeys<'a> {
    /// Position of an earlier item sharing a key with `item`. When there is
    /// none, `item`'s keys are claimed for `index`.
    pub fn first_of(&mut self, index: usize, item: &'a NewActivity) -> Option<usize> {
        let foreign = match (&item.foreign_id, &item.time) {
            (Some(foreign_id), Some(time)) => Some((foreign_id.as_str(), format_timestamp(time))),
            _ => None,
        };
        let earlier = item
            .origin
            .and_then(|origin| self.by_origin.get(&origin).copied())
            .or_else(|| foreign.as_ref().and_then(|key| self.by_foreign.get(key).copied()));
        if earlier.is_some() {
            return earlier;
        }
        if let Some(origin) = item.origin {
            self.by_origin.insert(origin, index);
        }
        if let Some(key) = foreign {
            self.by_foreign.insert(key, index);
        }
        None
    }
}

/// Records touched by a bulk write plus the bulk result.
///
/// For adds, `activities` holds the successfully written records in
/// submission order; for removals it holds the removed records.
#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    pub activities: Vec<Activity>,
    pub result: BulkWriteResult,
}

impl WriteOutcome {
    /// Pair each written activity with its position in the submitted batch.
    /// Only meaningful for adds, where every item either succeeded or failed.
    pub fn indexed(&self) -> Vec<(usize, &Activity)> {
        let failed: Vec<usize> = self.result.failures.iter().map(|f| f.index).collect();
        let total = self.activities.len() + failed.len();
        (0..total)
            .filter(|i| !failed.contains(i))
            .zip(self.activities.iter())
            .collect()
    }

    pub fn merge(&mut self, other: WriteOutcome) {
        self.activities.extend(other.activities);
        self.result.merge(other.result);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// A persisted background job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: i64,
    pub name: String,
    /// JSON-encoded job payload.
    pub payload: String,
    pub priority: i32,
    pub status: JobStatus,
    /// Number of times the job has been claimed.
    pub attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Row counts for the status display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub feeds: i64,
    pub activities: i64,
    pub buckets: i64,
    pub bucket_activities: i64,
    pub followships: i64,
    pub jobs_pending: i64,
    pub jobs_running: i64,
    pub jobs_failed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_text_roundtrip_truncates_to_millis() {
        let ts = Utc.timestamp_nanos(1_700_000_000_123_456_789);
        let text = format_timestamp(&ts);
        assert_eq!(text, "2023-11-14T22:13:20.123Z");
        let back = parse_timestamp(&text).unwrap();
        assert_eq!(format_timestamp(&back), text);
    }

    #[test]
    fn test_payload_shape_is_camel_case_with_extra_fields() {
        let json = r#"{
            "actor": "user:1", "verb": "like", "object": "post:2",
            "foreignId": "like:1:2", "cc": ["notification:2"], "message": "hi"
        }"#;
        let activity: NewActivity = serde_json::from_str(json).unwrap();
        assert_eq!(activity.foreign_id.as_deref(), Some("like:1:2"));
        assert_eq!(activity.cc, vec!["notification:2".to_string()]);
        assert_eq!(activity.extra.get("message"), Some(&Value::from("hi")));
        assert!(activity.feed.is_empty());
    }

    #[test]
    fn test_copy_strips_cc_and_links_origin() {
        let now = Utc::now();
        let mut new = NewActivity::new("user:1", "post", "post:5").with_cc(&["user:9"]);
        new.feed = "user:1".into();
        let original = Activity::from_new(41, new, now);
        let copy = original.to_copy("timeline:2", "user:1");
        assert_eq!(copy.feed, "timeline:2");
        assert_eq!(copy.source.as_deref(), Some("user:1"));
        assert_eq!(copy.origin, Some(41));
        assert!(copy.cc.is_empty());

        // A copy of a copy still points at the root activity
        let second = Activity::from_new(99, copy, now).to_copy("aggregated:2", "timeline:2");
        assert_eq!(second.origin, Some(41));
    }

    #[test]
    fn test_query_filter_matching() {
        let mut new = NewActivity::new("user:1", "like", "post:5");
        new.source = Some("user:1".into());
        let activity = Activity::from_new(1, new, Utc::now());
        let query = ActivityQuery {
            verb: Some("like".into()),
            source: Some("user:1".into()),
            ..Default::default()
        };
        assert!(query.matches(&activity));
        let other = ActivityQuery {
            actor: Some("user:2".into()),
            ..Default::default()
        };
        assert!(!other.matches(&activity));
    }

    #[test]
    fn test_bucket_distinct_caches_follow_rank() {
        let now = Utc::now();
        let make = |id: i64, actor: &str| {
            Activity::from_new(id, NewActivity::new(actor, "like", "post:1"), now)
        };
        let mut bucket = AggregationBucket {
            id: 1,
            feed: "aggregated:1".into(),
            group: "like-today".into(),
            verb: "like".into(),
            actors: vec![],
            objects: vec![],
            activities: vec![make(1, "user:a"), make(2, "user:b"), make(3, "user:a")],
            seen_at: None,
            read_at: None,
            created_at: now,
            updated_at: now,
        };
        bucket.rank_activities(&RankSpec::default());
        assert_eq!(bucket.actors, vec!["user:a".to_string(), "user:b".to_string()]);
        assert_eq!(bucket.objects, vec!["post:1".to_string()]);
        assert_eq!(bucket.activities[0].id, 3);
    }
}
