// Confirmation gate for irreversible page actions.
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::agent_engine::state::{ToolCall, ToolName};
use crate::browser::Observation;

const CONFIRM_KEYWORDS: &[&str] = &[
    "delete account",
    "close account",
    "remove account",
    "cancel subscription",
    "place order",
    "save changes",
    "update settings",
    "sign up",
    "delete",
    "remove",
    "trash",
    "erase",
    "wipe",
    "unsubscribe",
    "send",
    "submit",
    "apply",
    "respond",
    "checkout",
    "pay",
    "payment",
    "purchase",
    "buy",
    "order",
    "confirm",
    "approve",
    "publish",
    "register",
    "withdraw",
    "transfer",
    "charge",
    "donate",
    "finalize",
    "удалить",
    "удаление",
    "спам",
    "отправить",
    "откликнуться",
    "оплатить",
    "заказать",
    "подтвердить",
    "купить",
    "отписаться",
    "перевести",
];

static CONFIRM_RE: Lazy<Regex> = Lazy::new(|| {
    let alternatives = CONFIRM_KEYWORDS
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{alternatives})")).expect("confirm keywords regex")
});

/// Why an action was held back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    /// What the user is asked to confirm, e.g. `click "Delete account"`.
    pub summary: String,
    pub matched: String,
}

/// Stateless predicate: only `click` and `type` on a target whose text reads
/// as destructive or irreversible need confirmation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SecurityPolicy;

impl SecurityPolicy {
    pub fn check(&self, tool: &str, args: &Map<String, Value>, observation: &Observation) -> Option<Confirmation> {
        let name = ToolName::parse(tool)?;
        if !matches!(name, ToolName::Click | ToolName::Type) {
            return None;
        }
        let call = ToolCall {
            name: tool.to_string(),
            arguments: args.clone(),
        };
        let target = call.target_text(observation);
        if target.is_empty() {
            return None;
        }
        let matched = CONFIRM_RE.find(&target)?.as_str().to_lowercase();
        tracing::info!(tool, target = %target, matched = %matched, "action requires confirmation");
        Some(Confirmation {
            summary: format!("{} \"{}\"", name, target),
            matched,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::InteractiveElement;
    use serde_json::json;

    fn page() -> Observation {
        Observation {
            url: "https://account.test/settings".into(),
            title: "Settings".into(),
            visible_text: String::new(),
            interactive_elements: vec![
                InteractiveElement {
                    id: "1".into(),
                    role: "button".into(),
                    text: "Delete account".into(),
                    ..Default::default()
                },
                InteractiveElement {
                    id: "2".into(),
                    role: "link".into(),
                    text: "Continue browsing".into(),
                    ..Default::default()
                },
                InteractiveElement {
                    id: "3".into(),
                    role: "button".into(),
                    aria_label: "Удалить письмо".into(),
                    ..Default::default()
                },
            ],
        }
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn destructive_label_requires_confirmation() {
        let policy = SecurityPolicy;
        let hit = policy
            .check("click", &args(json!({"element_id": "1"})), &page())
            .unwrap();
        assert_eq!(hit.matched, "delete account");
        assert!(hit.summary.contains("Delete account"));
        assert!(policy
            .check("type", &args(json!({"element_id": "1", "text": "x"})), &page())
            .is_some());
    }

    #[test]
    fn harmless_label_passes() {
        let policy = SecurityPolicy;
        assert!(policy
            .check("click", &args(json!({"element_id": "2"})), &page())
            .is_none());
        assert!(policy
            .check("click", &args(json!({"element_id": "404"})), &page())
            .is_none());
    }

    #[test]
    fn only_click_and_type_are_gated() {
        let policy = SecurityPolicy;
        assert!(policy
            .check("navigate", &args(json!({"url": "https://shop.test/checkout"})), &page())
            .is_none());
        assert!(policy.check("scroll", &args(json!({"element_id": "1"})), &page()).is_none());
    }

    #[test]
    fn strategy_hints_and_russian_vocabulary() {
        let policy = SecurityPolicy;
        assert!(policy
            .check("click", &args(json!({"click_strategy": {"text": "Place order"}})), &page())
            .is_some());
        assert!(policy
            .check("click", &args(json!({"element_id": "3"})), &page())
            .is_some());
        // Word boundary: "border" is not "order".
        assert!(policy
            .check("click", &args(json!({"click_strategy": {"text": "Border styles"}})), &page())
            .is_none());
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let policy = SecurityPolicy;
        let a = policy.check("click", &args(json!({"element_id": "1"})), &page());
        let b = policy.check("click", &args(json!({"element_id": "1"})), &page());
        assert_eq!(a, b);
    }
}
