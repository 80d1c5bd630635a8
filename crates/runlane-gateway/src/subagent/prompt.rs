//! System prompt announcing a delegation to the child run.

use std::fmt::Write as _;

/// A configured agent listed in the fleet table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetEntry {
    pub id: String,
    pub model: Option<String>,
    pub description: Option<String>,
}

/// How much further the child may delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationTier {
    /// May spawn children that can spawn again.
    FullOrchestrator,
    /// May spawn, but its children are leaves.
    LastDelegator,
    /// Must not spawn.
    LeafWorker,
}

impl DelegationTier {
    pub const fn for_depth(depth: u32, max_depth: u32, recursion_enabled: bool) -> Self {
        if !recursion_enabled || depth >= max_depth {
            Self::LeafWorker
        } else if depth.saturating_add(1) >= max_depth {
            Self::LastDelegator
        } else {
            Self::FullOrchestrator
        }
    }

    pub const fn title(self) -> &'static str {
        match self {
            Self::FullOrchestrator => "Full Orchestrator",
            Self::LastDelegator => "Last Delegator",
            Self::LeafWorker => "Leaf Worker",
        }
    }
}

/// Inputs to [`build_delegation_prompt`].
#[derive(Debug, Clone, Default)]
pub struct DelegationContext {
    pub requester_session_key: String,
    pub child_session_key: String,
    pub label: Option<String>,
    pub task: String,
    /// Depth of the child being spawned.
    pub depth: u32,
    pub max_depth: u32,
    pub recursion_enabled: bool,
    pub child_slots_available: usize,
    pub max_children: usize,
    pub global_slots_available: usize,
    pub max_concurrent: usize,
    pub fleet: Vec<FleetEntry>,
}

fn cell(value: Option<&str>) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.replace('|', "\\|"),
        _ => "-".to_string(),
    }
}

fn fleet_table(fleet: &[FleetEntry]) -> String {
    if fleet.is_empty() {
        return "_No configured agents found._".to_string();
    }
    let mut table = String::from("| Agent ID | Model | Description |\n| --- | --- | --- |");
    for entry in fleet {
        let _ = write!(
            table,
            "\n| {} | {} | {} |",
            cell(Some(entry.id.as_str())),
            cell(entry.model.as_deref()),
            cell(entry.description.as_deref())
        );
    }
    table
}

pub fn build_delegation_prompt(ctx: &DelegationContext) -> String {
    let parent = match ctx.requester_session_key.trim() {
        "" => "unknown",
        key => key,
    };
    let tier = DelegationTier::for_depth(ctx.depth, ctx.max_depth, ctx.recursion_enabled);

    let mut lines = vec![
        "# Subagent Context".to_string(),
        String::new(),
        format!("You are a subagent spawned by {parent} for a specific task."),
        format!("- Session: {}", ctx.child_session_key),
    ];
    if let Some(label) = ctx.label.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
        lines.push(format!("- Label: {label}"));
    }
    lines.extend([
        String::new(),
        "## Task".to_string(),
        ctx.task.trim().to_string(),
        String::new(),
        format!("## Delegation Tier: {}", tier.title()),
        String::new(),
    ]);

    match tier {
        DelegationTier::LeafWorker => {
            lines.extend([
                "- Complete your task directly. Do not attempt to spawn subagents.".to_string(),
                "- Write results to files when that helps your parent verify work.".to_string(),
                format!("- If blocked, message your parent at session key: {parent}."),
            ]);
            return lines.join("\n");
        }
        DelegationTier::LastDelegator => lines.extend([
            "- You may delegate, but children are leaf workers and cannot spawn further."
                .to_string(),
            "- Prefer cheaper/faster models for narrow tasks.".to_string(),
            "- Keep decomposition shallow and focused on concrete deliverables.".to_string(),
        ]),
        DelegationTier::FullOrchestrator => lines.extend([
            "## Delegation Philosophy".to_string(),
            "- Break work into independent, testable chunks.".to_string(),
            "- Delegate parallelizable tasks and aggregate findings.".to_string(),
            "- Escalate blockers to the parent session with clear context.".to_string(),
        ]),
    }

    lines.extend([
        String::new(),
        "## Spawn Limits".to_string(),
        format!("- Current depth: {}", ctx.depth),
        format!("- Maximum depth: {}", ctx.max_depth),
        format!(
            "- Child slots available: {}/{}",
            ctx.child_slots_available,
            ctx.max_children.max(1)
        ),
        format!(
            "- Global subagent slots available: {}/{}",
            ctx.global_slots_available,
            ctx.max_concurrent.max(1)
        ),
        format!("- Parent session key for messaging: {parent}"),
        String::new(),
        "## Fleet".to_string(),
        fleet_table(&ctx.fleet),
    ]);
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(depth: u32) -> DelegationContext {
        DelegationContext {
            requester_session_key: "agent:main:main".into(),
            child_session_key: "agent:main:subagent:abc".into(),
            label: Some("research".into()),
            task: "Find the docs".into(),
            depth,
            max_depth: 3,
            recursion_enabled: true,
            child_slots_available: 4,
            max_children: 5,
            global_slots_available: 7,
            max_concurrent: 8,
            fleet: vec![FleetEntry {
                id: "ops".into(),
                model: Some("openai/gpt-5".into()),
                description: Some("a|b".into()),
            }],
        }
    }

    #[test]
    fn tiers_follow_depth() {
        assert_eq!(DelegationTier::for_depth(1, 3, true), DelegationTier::FullOrchestrator);
        assert_eq!(DelegationTier::for_depth(2, 3, true), DelegationTier::LastDelegator);
        assert_eq!(DelegationTier::for_depth(3, 3, true), DelegationTier::LeafWorker);
        assert_eq!(DelegationTier::for_depth(1, 3, false), DelegationTier::LeafWorker);
    }

    #[test]
    fn orchestrator_prompt_lists_limits_and_fleet() {
        let prompt = build_delegation_prompt(&ctx(1));
        assert!(prompt.contains("You are a subagent spawned by agent:main:main"));
        assert!(prompt.contains("- Label: research"));
        assert!(prompt.contains("## Task\nFind the docs"));
        assert!(prompt.contains("## Delegation Tier: Full Orchestrator"));
        assert!(prompt.contains("- Child slots available: 4/5"));
        assert!(prompt.contains("| ops | openai/gpt-5 | a\\|b |"));
    }

    #[test]
    fn leaf_prompt_forbids_spawning() {
        let prompt = build_delegation_prompt(&ctx(3));
        assert!(prompt.contains("## Delegation Tier: Leaf Worker"));
        assert!(prompt.contains("Do not attempt to spawn subagents."));
        assert!(!prompt.contains("## Spawn Limits"));
    }

    #[test]
    fn empty_fleet_is_noted() {
        let mut c = ctx(2);
        c.fleet.clear();
        let prompt = build_delegation_prompt(&c);
        assert!(prompt.contains("## Delegation Tier: Last Delegator"));
        assert!(prompt.ends_with("_No configured agents found._"));
    }
}
