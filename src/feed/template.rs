// Aggregation templates — the group key of an aggregation bucket.
//
// A template such as "${verb}-${time}" is formatted against the activity
// being inserted. Available variables:
//   ${verb} ${time} ${object} ${target} ${id} ${actor} ${feed}
// ${time} is the activity's day (YYYY-MM-DD), so the default templates
// group per verb (and object) per day. ${id} is the id of the original
// activity the item was copied from. Unknown or absent variables format
// as an empty string.

use std::sync::OnceLock;

use chrono::Utc;
use regex_lite::{Captures, Regex};

use crate::db::models::NewActivity;

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{(\w+)\}").expect("static pattern compiles"))
}

/// Format an aggregation template against an activity.
pub fn format_aggregation(template: &str, activity: &NewActivity) -> String {
    variable_pattern()
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            match name {
                "verb" => activity.verb.clone(),
                "actor" => activity.actor.clone(),
                "object" => activity.object.clone(),
                "feed" => activity.feed.clone(),
                "target" => activity.target.clone().unwrap_or_default(),
                "id" => activity.origin.map(|id| id.to_string()).unwrap_or_default(),
                "time" => activity
                    .time
                    .unwrap_or_else(Utc::now)
                    .format("%Y-%m-%d")
                    .to_string(),
                _ => String::new(),
            }
        })
        .into_owned()
}
