use crate::agent_engine::memory::MemoryState;
use crate::agents::Role;
use crate::browser::Observation;

const EXTRACTION_KEYWORDS: &[&str] = &[
    "extract",
    "summarize",
    "summarise",
    "list",
    "find",
    "извлеки",
    "перечисли",
    "список",
    "найди",
    "суммируй",
];

/// Steps that must be recorded before extraction is attempted.
const EXTRACTOR_MIN_STEPS: usize = 3;

/// Picks the role for the next decision.
///
/// Recovery comes first (any error this turn, or two stalled steps), then
/// extraction once the goal asks for it and the navigator had room to reach
/// content, otherwise forward navigation.
pub fn route(goal: &str, step_count: usize, error_count: u32, stall_count: u32) -> Role {
    if error_count > 0 || stall_count >= 2 {
        return Role::Reflector;
    }
    let goal = goal.to_lowercase();
    if step_count >= EXTRACTOR_MIN_STEPS && EXTRACTION_KEYWORDS.iter().any(|k| goal.contains(k)) {
        return Role::Extractor;
    }
    Role::Navigator
}

/// Session-facing wrapper over [`route`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Coordinator;

impl Coordinator {
    pub fn select(
        &self,
        goal: &str,
        memory: &MemoryState,
        _observation: &Observation,
        error_count: u32,
        stall_count: u32,
    ) -> Role {
        route(goal, memory.len(), error_count, stall_count)
    }
}
