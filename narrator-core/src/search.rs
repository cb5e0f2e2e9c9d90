//! Local scoring search over entity collections.
//!
//! Pure functions: a directive and a collection in, a capped, ordered result
//! list out. Scores are additive across matched fields. Hard filters (status,
//! date range) drop an entity before it is scored, and entities that score
//! zero are never returned.
//!
//! All text matching is case-insensitive. Dates are compared as strings, so
//! the world is expected to use zero-padded ISO-style dates (`1520-03-14`).

use crate::entity::{Character, Event, Law};
use serde::{Deserialize, Serialize};

/// Maximum characters returned per search.
pub const CHARACTER_CAP: usize = 4;
/// Maximum events returned per search.
pub const EVENT_CAP: usize = 6;
/// Maximum laws returned per search.
pub const LAW_CAP: usize = 3;

const CHARACTER_ID_MATCH: u32 = 50;
const CHARACTER_NAME_KEYWORD: u32 = 20;
const CHARACTER_TITLE_KEYWORD: u32 = 10;
const CHARACTER_TASK_KEYWORD: u32 = 5;
const CHARACTER_CATEGORY: u32 = 8;
const CHARACTER_LOCATION: u32 = 12;

const EVENT_SUMMARY_KEYWORD: u32 = 10;
const EVENT_CHARACTER_OVERLAP: u32 = 15;
const EVENT_TYPE: u32 = 8;
const EVENT_DATED: u32 = 1;

const LAW_TITLE_KEYWORD: u32 = 15;
const LAW_SUMMARY_KEYWORD: u32 = 10;

/// Structured search criteria produced by the router.
///
/// One shape serves every entity kind; fields that do not apply to a kind are
/// ignored. For event searches `ids` holds the IDs of characters involved in
/// the event (the router may also spell it `characters`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchDirective {
    pub keywords: Vec<String>,
    #[serde(alias = "characters")]
    pub ids: Vec<String>,
    pub categories: Vec<String>,
    pub locations: Vec<String>,
    pub types: Vec<String>,
    #[serde(alias = "dateAfter")]
    pub date_after: Option<String>,
    #[serde(alias = "dateBefore")]
    pub date_before: Option<String>,
    pub status: Option<String>,
}

impl SearchDirective {
    pub fn keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_locations<I, S>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locations = locations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_date_range(mut self, after: Option<&str>, before: Option<&str>) -> Self {
        self.date_after = after.map(str::to_string);
        self.date_before = before.map(str::to_string);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    fn lowered_keywords(&self) -> Vec<String> {
        lowered(&self.keywords)
    }

    fn status_filter(&self) -> Option<String> {
        self.status
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }
}

/// An entity together with its relevance score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredResult<T> {
    pub entity: T,
    pub score: u32,
}

/// Results of one routed search across all three kinds.
#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub characters: Vec<ScoredResult<Character>>,
    pub events: Vec<ScoredResult<Event>>,
    pub laws: Vec<ScoredResult<Law>>,
}

impl SearchResults {
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty() && self.events.is_empty() && self.laws.is_empty()
    }

    pub fn total(&self) -> usize {
        self.characters.len() + self.events.len() + self.laws.len()
    }
}

/// Score characters. `status` is a hard filter.
pub fn search_characters(
    directive: &SearchDirective,
    characters: &[Character],
) -> Vec<ScoredResult<Character>> {
    let keywords = directive.lowered_keywords();
    let categories = lowered(&directive.categories);
    let locations = lowered(&directive.locations);
    let status = directive.status_filter();

    let mut results: Vec<ScoredResult<Character>> = characters
        .iter()
        .filter(|c| status_passes(status.as_deref(), &c.status))
        .filter_map(|c| {
            let name = c.name.to_lowercase();
            let title = c.title.to_lowercase();
            let task = c.current_task.to_lowercase();
            let category = c.category.to_lowercase();
            let location = c.location.to_lowercase();

            let mut score = 0;
            if directive.ids.iter().any(|id| id == &c.id) {
                score += CHARACTER_ID_MATCH;
            }
            for keyword in &keywords {
                if name.contains(keyword.as_str()) {
                    score += CHARACTER_NAME_KEYWORD;
                }
                if title.contains(keyword.as_str()) {
                    score += CHARACTER_TITLE_KEYWORD;
                }
                if task.contains(keyword.as_str()) {
                    score += CHARACTER_TASK_KEYWORD;
                }
            }
            if !category.is_empty() && categories.iter().any(|cat| *cat == category) {
                score += CHARACTER_CATEGORY;
            }
            if !location.is_empty() && locations.iter().any(|loc| location.contains(loc.as_str())) {
                score += CHARACTER_LOCATION;
            }

            scored(c, score)
        })
        .collect();

    results.sort_by(|a, b| b.score.cmp(&a.score));
    results.truncate(CHARACTER_CAP);
    results
}

/// Score events. `date_after`/`date_before` are inclusive hard filters; an
/// undated event fails any date bound.
pub fn search_events(directive: &SearchDirective, events: &[Event]) -> Vec<ScoredResult<Event>> {
    let keywords = directive.lowered_keywords();
    let types = lowered(&directive.types);
    let after = directive.date_after.as_deref().filter(|d| !d.is_empty());
    let before = directive.date_before.as_deref().filter(|d| !d.is_empty());

    let mut results: Vec<ScoredResult<Event>> = events
        .iter()
        .filter(|e| in_date_range(&e.date, after, before))
        .filter_map(|e| {
            let summary = e.summary.to_lowercase();
            let event_type = e.event_type.to_lowercase();

            let mut score = 0;
            for keyword in &keywords {
                if summary.contains(keyword.as_str()) {
                    score += EVENT_SUMMARY_KEYWORD;
                }
            }
            for id in &directive.ids {
                if e.characters.iter().any(|c| c == id) {
                    score += EVENT_CHARACTER_OVERLAP;
                }
            }
            if !event_type.is_empty() && types.iter().any(|t| *t == event_type) {
                score += EVENT_TYPE;
            }
            // The recency nudge only orders matches; it never makes a match.
            if score > 0 && !e.date.is_empty() {
                score += EVENT_DATED;
            }

            scored(e, score)
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.entity.date.cmp(&a.entity.date))
    });
    results.truncate(EVENT_CAP);
    results
}

/// Score laws. `status` is a hard filter.
pub fn search_laws(directive: &SearchDirective, laws: &[Law]) -> Vec<ScoredResult<Law>> {
    let keywords = directive.lowered_keywords();
    let status = directive.status_filter();

    let mut results: Vec<ScoredResult<Law>> = laws
        .iter()
        .filter(|l| status_passes(status.as_deref(), &l.status))
        .filter_map(|l| {
            let title = l.title.to_lowercase();
            let summary = l.summary.to_lowercase();

            let mut score = 0;
            for keyword in &keywords {
                if title.contains(keyword.as_str()) {
                    score += LAW_TITLE_KEYWORD;
                }
                if summary.contains(keyword.as_str()) {
                    score += LAW_SUMMARY_KEYWORD;
                }
            }

            scored(l, score)
        })
        .collect();

    results.sort_by(|a, b| b.score.cmp(&a.score));
    results.truncate(LAW_CAP);
    results
}

fn scored<T: Clone>(entity: &T, score: u32) -> Option<ScoredResult<T>> {
    (score > 0).then(|| ScoredResult {
        entity: entity.clone(),
        score,
    })
}

fn lowered(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

fn status_passes(filter: Option<&str>, status: &str) -> bool {
    match filter {
        Some(wanted) => status.trim().to_lowercase() == wanted,
        None => true,
    }
}

fn in_date_range(date: &str, after: Option<&str>, before: Option<&str>) -> bool {
    if after.is_none() && before.is_none() {
        return true;
    }
    if date.is_empty() {
        return false;
    }
    after.map_or(true, |a| date >= a) && before.map_or(true, |b| date <= b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn court() -> Vec<Character> {
        vec![
            Character::new("c1", "Queen Lucía")
                .with_title("Queen of Castile")
                .with_category("royalty")
                .with_location("Alcázar of Toledo")
                .with_status("alive"),
            Character::new("c2", "Don Rodrigo")
                .with_title("Duke of Alba")
                .with_current_task("Plotting against the queen")
                .with_category("nobility")
                .with_status("exiled"),
            Character::new("c3", "Brother Tomás")
                .with_title("Royal confessor")
                .with_location("Toledo Cathedral")
                .with_status("alive"),
            Character::new("c4", "Isabel")
                .with_title("Lady-in-waiting to the Queen")
                .with_location("Alcázar of Toledo")
                .with_status("alive"),
            Character::new("c5", "Queen Mother Juana")
                .with_title("Dowager Queen")
                .with_status("dead"),
            Character::new("c6", "Queen's Guard Captain").with_status("alive"),
        ]
    }

    #[test]
    fn test_queen_keyword_scenario() {
        let directive = SearchDirective::keywords(["queen"]);
        let results = search_characters(&directive, &court());

        assert!(results.len() <= CHARACTER_CAP);
        let lucia = results
            .iter()
            .find(|r| r.entity.name == "Queen Lucía")
            .expect("Queen Lucía should be returned");
        assert!(lucia.score >= 20);
        assert_eq!(lucia.score, 30);
    }

    #[test]
    fn test_character_weights() {
        let characters = court();
        let directive = SearchDirective::default().with_ids(["c3"]);
        assert_eq!(search_characters(&directive, &characters)[0].score, 50);

        let directive = SearchDirective::keywords(["plotting"]);
        let results = search_characters(&directive, &characters);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, 5);

        let directive = SearchDirective::default().with_categories(["NOBILITY"]);
        assert_eq!(search_characters(&directive, &characters)[0].score, 8);

        let directive = SearchDirective::default().with_locations(["toledo"]);
        let results = search_characters(&directive, &characters);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.score == 12));
    }

    #[test]
    fn test_character_status_is_hard_filter() {
        let directive = SearchDirective::default()
            .with_ids(["c2"])
            .with_status("alive");
        let results = search_characters(&directive, &court());
        assert!(results.is_empty());

        let directive = SearchDirective::keywords(["queen"]).with_status("Dead");
        let results = search_characters(&directive, &court());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entity.id, "c5");
    }

    #[test]
    fn test_character_cap_and_order() {
        let directive = SearchDirective::keywords(["queen"]).with_ids(["c4"]);
        let results = search_characters(&directive, &court());

        assert_eq!(results.len(), CHARACTER_CAP);
        assert_eq!(results[0].entity.id, "c4");
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_zero_scores_are_excluded() {
        let directive = SearchDirective::keywords(["dragon"]);
        assert!(search_characters(&directive, &court()).is_empty());
        assert!(search_characters(&SearchDirective::default(), &court()).is_empty());
    }

    fn history() -> Vec<Event> {
        vec![
            Event::new("e1", "The coronation of the queen")
                .with_date("1518-05-01")
                .with_characters(["c1", "c3"])
                .with_type("ceremony"),
            Event::new("e2", "Rodrigo insults the queen at court")
                .with_date("1520-02-11")
                .with_characters(["c1", "c2"])
                .with_type("scandal"),
            Event::new("e3", "A plague reaches Toledo").with_date("1520-06-30"),
            Event::new("e4", "The queen's secret letter").with_characters(["c1"]),
        ]
    }

    #[test]
    fn test_event_weights() {
        let events = history();

        let directive = SearchDirective::keywords(["plague"]);
        let results = search_events(&directive, &events);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, 11);

        let directive = SearchDirective::default().with_ids(["c1", "c2"]);
        let results = search_events(&directive, &events);
        assert_eq!(results[0].entity.id, "e2");
        assert_eq!(results[0].score, 31);

        let directive = SearchDirective::default().with_types(["Ceremony"]);
        let results = search_events(&directive, &events);
        assert_eq!(results[0].score, 9);

        // Undated event gets no recency nudge.
        let directive = SearchDirective::keywords(["letter"]);
        assert_eq!(search_events(&directive, &events)[0].score, 10);
    }

    #[test]
    fn test_event_ties_break_by_date_descending() {
        let directive = SearchDirective::keywords(["queen"]);
        let results = search_events(&directive, &history());
        let ids: Vec<&str> = results.iter().map(|r| r.entity.id.as_str()).collect();
        assert_eq!(ids, vec!["e2", "e1", "e4"]);
    }

    #[test]
    fn test_event_date_range_is_hard_filter() {
        let directive =
            SearchDirective::keywords(["queen"]).with_date_range(Some("1519-01-01"), None);
        let results = search_events(&directive, &history());
        let ids: Vec<&str> = results.iter().map(|r| r.entity.id.as_str()).collect();
        assert_eq!(ids, vec!["e2"]);

        let directive =
            SearchDirective::keywords(["queen"]).with_date_range(None, Some("1518-05-01"));
        let results = search_events(&directive, &history());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entity.id, "e1");
    }

    #[test]
    fn test_event_cap() {
        let events: Vec<Event> = (0..20)
            .map(|i| Event::new(format!("e{i}"), "a feast").with_date(format!("1520-01-{:02}", i + 1)))
            .collect();
        let results = search_events(&SearchDirective::keywords(["feast"]), &events);
        assert_eq!(results.len(), EVENT_CAP);
        assert_eq!(results[0].entity.id, "e19");
    }

    #[test]
    fn test_law_weights_and_status_filter() {
        let laws = vec![
            Law::new("l1", "Edict of Toledo")
                .with_summary("Forbids duels within the city")
                .with_status("active"),
            Law::new("l2", "Duel Pardon")
                .with_summary("Pardons duellists of noble birth")
                .with_status("repealed"),
            Law::new("l3", "Tax on wool").with_status("active"),
        ];

        let directive = SearchDirective::keywords(["duel"]);
        let results = search_laws(&directive, &laws);
        assert_eq!(results[0].entity.id, "l2");
        assert_eq!(results[0].score, 25);
        assert_eq!(results[1].score, 10);

        let directive = SearchDirective::keywords(["duel"]).with_status("active");
        let results = search_laws(&directive, &laws);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entity.id, "l1");
    }

    #[test]
    fn test_law_cap() {
        let laws: Vec<Law> = (0..10).map(|i| Law::new(format!("l{i}"), "Royal decree")).collect();
        assert_eq!(search_laws(&SearchDirective::keywords(["decree"]), &laws).len(), LAW_CAP);
    }

    #[test]
    fn test_search_is_deterministic() {
        let directive = SearchDirective::keywords(["queen", "toledo"]).with_locations(["alcázar"]);
        let first = search_characters(&directive, &court());
        let second = search_characters(&directive, &court());
        assert_eq!(first, second);
    }

    #[test]
    fn test_directive_parses_router_shape() {
        let json = r#"{"keywords": ["queen"], "characters": ["c1"], "dateAfter": "1519-01-01"}"#;
        let directive: SearchDirective = serde_json::from_str(json).unwrap();
        assert_eq!(directive.ids, vec!["c1"]);
        assert_eq!(directive.date_after.as_deref(), Some("1519-01-01"));
        assert!(directive.status.is_none());
    }
}
