// Rank specs — the ordering of activities inside an aggregation bucket.
//
// Stored on the feed as a short string: a field name, optionally prefixed
// with '-' for descending order ("-updated_at" is the default). camelCase
// spellings from JSON payloads ("-updatedAt") are accepted too.

use std::cmp::Ordering;
use std::fmt;

use crate::db::models::Activity;
use crate::error::FeedError;

pub const DEFAULT_RANK: &str = "-updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankField {
    UpdatedAt,
    CreatedAt,
    Time,
    Popularity,
}

impl RankField {
    fn as_str(&self) -> &'static str {
        match self {
            RankField::UpdatedAt => "updated_at",
            RankField::CreatedAt => "created_at",
            RankField::Time => "time",
            RankField::Popularity => "popularity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankSpec {
    pub field: RankField,
    pub descending: bool,
}

impl Default for RankSpec {
    fn default() -> Self {
        Self {
            field: RankField::UpdatedAt,
            descending: true,
        }
    }
}

impl RankSpec {
    pub fn parse(spec: &str) -> Result<Self, FeedError> {
        let spec = spec.trim();
        let (descending, name) = match spec.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, spec.strip_prefix('+').unwrap_or(spec)),
        };
        let field = match name {
            "updated_at" | "updatedAt" => RankField::UpdatedAt,
            "created_at" | "createdAt" => RankField::CreatedAt,
            "time" => RankField::Time,
            "popularity" => RankField::Popularity,
            other => {
                return Err(FeedError::Validation(format!(
                    "unknown rank field '{other}'"
                )))
            }
        };
        Ok(Self { field, descending })
    }

    /// Compare two activities under this rank. Ties fall back to id in the
    /// same direction, so equal timestamps still order by insertion.
    pub fn compare(&self, a: &Activity, b: &Activity) -> Ordering {
        let ord = match self.field {
            RankField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            RankField::CreatedAt => a.created_at.cmp(&b.created_at),
            RankField::Time => a.time.cmp(&b.time),
            RankField::Popularity => a.popularity.cmp(&b.popularity),
        }
        .then(a.id.cmp(&b.id));
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }

    pub fn sort(&self, activities: &mut [Activity]) {
        activities.sort_by(|a, b| self.compare(a, b));
    }
}

impl fmt::Display for RankSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.descending {
            write!(f, "-{}", self.field.as_str())
        } else {
            write!(f, "{}", self.field.as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewActivity;
    use chrono::{Duration, Utc};

    fn activity(id: i64, popularity: i64, age_secs: i64) -> Activity {
        let at = Utc::now() - Duration::seconds(age_secs);
        let mut a = Activity::from_new(id, NewActivity::new("user:1", "like", "post:1"), at);
        a.popularity = popularity;
        a
    }

    #[test]
    fn test_parse_default_and_camel_case() {
        assert_eq!(RankSpec::parse(DEFAULT_RANK).unwrap(), RankSpec::default());
        assert_eq!(RankSpec::parse("-updatedAt").unwrap(), RankSpec::default());
        let asc = RankSpec::parse("popularity").unwrap();
        assert_eq!(asc.field, RankField::Popularity);
        assert!(!asc.descending);
        assert_eq!(asc.to_string(), "popularity");
    }

    #[test]
    fn test_parse_rejects_unknown_field() {
        assert!(RankSpec::parse("-score").is_err());
    }

    #[test]
    fn test_sort_descending_by_popularity() {
        let mut items = vec![activity(1, 5, 0), activity(2, 9, 0), activity(3, 1, 0)];
        RankSpec::parse("-popularity").unwrap().sort(&mut items);
        let ids: Vec<i64> = items.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn test_sort_default_most_recent_first() {
        let mut items = vec![activity(1, 1, 30), activity(2, 1, 10), activity(3, 1, 20)];
        RankSpec::default().sort(&mut items);
        let ids: Vec<i64> = items.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }
}
