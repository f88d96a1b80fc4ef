use serde_json::json;

use crate::agent_engine::signals::{self, Language};
use crate::agent_engine::state::{ToolCall, ToolName};
use crate::browser::Observation;

#[derive(Debug, Clone)]
struct GoalUrl {
    url: String,
    visited: bool,
    attempted: bool,
    skipped: bool,
}

/// Bookkeeping for URLs named in the goal. When the goal orders them
/// ("open A, then B") the tracker forces navigation in that order.
#[derive(Debug, Clone)]
pub struct GoalTracker {
    urls: Vec<GoalUrl>,
    ordered: bool,
    language: Language,
    /// Index of the URL the user was last asked about.
    asked: Option<usize>,
}

impl GoalTracker {
    pub fn from_goal(goal: &str) -> Self {
        let urls: Vec<GoalUrl> = signals::ordered_goal_urls(goal)
            .into_iter()
            .map(|url| GoalUrl {
                url,
                visited: false,
                attempted: false,
                skipped: false,
            })
            .collect();
        let ordered = urls.len() > 1 && signals::has_ordering_cue(goal);
        Self {
            urls,
            ordered,
            language: signals::detect_language(goal),
            asked: None,
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.iter().map(|g| g.url.clone()).collect()
    }

    /// Empty unless ordering is enforced.
    pub fn ordered_urls(&self) -> Vec<String> {
        if self.ordered {
            self.urls()
        } else {
            Vec::new()
        }
    }

    pub fn visited_urls(&self) -> Vec<String> {
        self.urls
            .iter()
            .filter(|g| g.visited)
            .map(|g| g.url.clone())
            .collect()
    }

    pub fn is_visited(&self, url: &str) -> bool {
        self.urls.iter().any(|g| g.url == url && g.visited)
    }

    fn next_unvisited(&self) -> Option<usize> {
        self.urls.iter().position(|g| !g.visited && !g.skipped)
    }

    /// Called when the user answers. A URL the user was asked about because
    /// it could not be reached is skipped from then on. Returns that URL.
    pub fn note_user_reply(&mut self) -> Option<String> {
        let idx = self.asked.take()?;
        let goal = &mut self.urls[idx];
        goal.skipped = true;
        tracing::info!(url = %goal.url, "unreachable goal URL skipped after user reply");
        Some(goal.url.clone())
    }

    /// Updates visited/attempted flags after a step. `page_url` is the page
    /// the action was computed against.
    pub fn record_step(&mut self, call: &ToolCall, ok: bool, page_url: &str) {
        let Some(tool) = call.tool() else {
            return;
        };
        if tool == ToolName::Navigate {
            if let Some(target) = call.str_arg("url") {
                for goal in self.urls.iter_mut() {
                    if signals::url_matches_prefix(target, &goal.url) {
                        goal.attempted = true;
                    }
                }
            }
        }
        if !ok || tool.is_navigational() {
            return;
        }
        if self.ordered {
            if let Some(idx) = self.next_unvisited() {
                if signals::url_matches_prefix(page_url, &self.urls[idx].url) {
                    self.urls[idx].visited = true;
                    tracing::info!(url = %self.urls[idx].url, "goal URL visited");
                }
            }
        } else {
            for goal in self.urls.iter_mut().filter(|g| !g.visited) {
                if signals::url_matches_prefix(page_url, &goal.url) {
                    goal.visited = true;
                    tracing::info!(url = %goal.url, "goal URL visited");
                }
            }
        }
    }

    /// The action that replaces a decision-maker call while ordering is
    /// enforced and the next goal URL is not the current page.
    pub fn forced_action(&mut self, observation: &Observation, stall: u32, stall_limit: u32) -> Option<ToolCall> {
        if !self.ordered {
            return None;
        }
        let idx = self.next_unvisited()?;
        let next = &self.urls[idx];
        if signals::url_matches_prefix(&observation.url, &next.url) {
            return None;
        }
        if next.attempted && stall >= stall_limit {
            let question = match self.language {
                Language::En => format!(
                    "I could not reach {} (the browser stays on {}). Please open it or tell me how to continue.",
                    next.url, observation.url
                ),
                Language::Ru => format!(
                    "Не удаётся открыть {} (браузер остаётся на {}). Откройте страницу или подскажите, как продолжить.",
                    next.url, observation.url
                ),
            };
            self.asked = Some(idx);
            return Some(ToolCall::new("ask_user", json!({ "question": question })));
        }
        Some(ToolCall::new("navigate", json!({ "url": next.url })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(url: &str) -> Observation {
        Observation {
            url: url.into(),
            title: "t".into(),
            ..Default::default()
        }
    }

    fn click() -> ToolCall {
        ToolCall::new("click", json!({"element_id": "1"}))
    }

    #[test]
    fn then_between_two_urls_enables_ordering() {
        let tracker = GoalTracker::from_goal("open https://a.test/x then https://b.test/y");
        assert!(tracker.is_ordered());
        assert_eq!(tracker.ordered_urls().len(), 2);
        assert!(!GoalTracker::from_goal("compare a.test and b.test").is_ordered());
        assert!(!GoalTracker::from_goal("open a.test then scroll").is_ordered());
    }

    #[test]
    fn after_orders_the_referenced_url_first() {
        let mut tracker = GoalTracker::from_goal("Open https://b.test after you open https://a.test");
        assert!(tracker.is_ordered());
        assert_eq!(tracker.ordered_urls(), vec!["https://a.test", "https://b.test"]);
        let forced = tracker.forced_action(&at("about:blank"), 0, 5).unwrap();
        assert_eq!(forced.str_arg("url"), Some("https://a.test"));
        tracker.record_step(&click(), true, "https://b.test/");
        assert!(tracker.visited_urls().is_empty());
    }

    #[test]
    fn forces_first_url_until_acted_on() {
        let mut tracker = GoalTracker::from_goal("open https://a.test/x then https://b.test/y");
        let forced = tracker.forced_action(&at("about:blank"), 0, 5).unwrap();
        assert_eq!(forced.str_arg("url"), Some("https://a.test/x"));

        let nav = ToolCall::new("navigate", json!({"url": "https://a.test/x"}));
        tracker.record_step(&nav, true, "about:blank");
        assert!(tracker.visited_urls().is_empty());
        // On the page: the decision-maker gets to act.
        assert!(tracker.forced_action(&at("https://a.test/x"), 0, 5).is_none());

        tracker.record_step(&ToolCall::new("back", json!({})), true, "https://a.test/x");
        assert!(tracker.visited_urls().is_empty());

        tracker.record_step(&click(), false, "https://a.test/x");
        assert!(tracker.visited_urls().is_empty());

        tracker.record_step(&click(), true, "https://a.test/x/page");
        assert_eq!(tracker.visited_urls(), vec!["https://a.test/x".to_string()]);

        let forced = tracker.forced_action(&at("https://a.test/x/page"), 0, 5).unwrap();
        assert_eq!(forced.str_arg("url"), Some("https://b.test/y"));
    }

    #[test]
    fn second_url_is_not_marked_out_of_order() {
        let mut tracker = GoalTracker::from_goal("first https://a.test then https://b.test");
        tracker.record_step(&click(), true, "https://b.test/");
        assert!(tracker.visited_urls().is_empty());
    }

    #[test]
    fn unreachable_attempted_url_asks_user_after_stall_limit() {
        let mut tracker = GoalTracker::from_goal("open https://a.test then https://b.test");
        let nav = ToolCall::new("navigate", json!({"url": "https://a.test"}));
        tracker.record_step(&nav, true, "about:blank");
        let stuck = at("https://login.a-corp.test/");
        assert_eq!(tracker.forced_action(&stuck, 4, 5).unwrap().name, "navigate");
        assert_eq!(tracker.forced_action(&stuck, 5, 5).unwrap().name, "ask_user");
    }

    #[test]
    fn reply_to_unreachable_url_moves_on_to_the_next_one() {
        let mut tracker = GoalTracker::from_goal("open https://a.test then https://b.test");
        assert_eq!(tracker.note_user_reply(), None);
        let nav = ToolCall::new("navigate", json!({"url": "https://a.test"}));
        tracker.record_step(&nav, true, "about:blank");
        let stuck = at("https://login.a-corp.test/");
        assert_eq!(tracker.forced_action(&stuck, 5, 5).unwrap().name, "ask_user");

        assert_eq!(tracker.note_user_reply().as_deref(), Some("https://a.test"));
        let forced = tracker.forced_action(&stuck, 5, 5).unwrap();
        assert_eq!(forced.name, "navigate");
        assert_eq!(forced.str_arg("url"), Some("https://b.test"));
        assert!(tracker.visited_urls().is_empty());
    }
}
