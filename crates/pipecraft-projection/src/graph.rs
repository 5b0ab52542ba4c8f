//! Pure derivation of the agent graph from the current task/worker state.
//! No I/O, no time-of-day: the same `(tasks, workers, agentStates)` always
//! produces the same graph, which is what makes it safe to recompute on
//! every projection tick.

use pipecraft_store::{Role, TaskRecord, TaskStatus, WorkerStatus};
use serde::Serialize;
use std::collections::HashMap;

/// The fixed pipeline shape every run follows, regardless of how many
/// epics or follow-up stages it goes through.
const EDGES: &[(Role, Role)] = &[
    (Role::AnalystA, Role::ConsensusBuilder),
    (Role::AnalystB, Role::ConsensusBuilder),
    (Role::ConsensusBuilder, Role::Splitter),
    (Role::Splitter, Role::Implementer),
    (Role::Implementer, Role::Tester),
    (Role::Tester, Role::Reviewer),
    (Role::Implementer, Role::Reviewer),
];

const ROLES: &[Role] = &[
    Role::AnalystA,
    Role::AnalystB,
    Role::ConsensusBuilder,
    Role::Splitter,
    Role::Implementer,
    Role::Tester,
    Role::Reviewer,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Idle,
    Pending,
    Active,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentNode {
    pub role: Role,
    pub state: NodeState,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentEdge {
    pub from: Role,
    pub to: Role,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentGraph {
    pub nodes: Vec<AgentNode>,
    pub edges: Vec<AgentEdge>,
}

/// One role's state, derived from the tasks currently assigned to it.
/// Error beats active beats pending beats done so a single stuck task
/// can't be hidden behind an otherwise-finished role.
fn role_state(tasks: &[&TaskRecord]) -> NodeState {
    if tasks.is_empty() {
        return NodeState::Idle;
    }
    if tasks.iter().any(|t| t.status == TaskStatus::Error) {
        return NodeState::Error;
    }
    if tasks.iter().any(|t| t.status == TaskStatus::InProgress) {
        return NodeState::Active;
    }
    if tasks
        .iter()
        .any(|t| matches!(t.status, TaskStatus::Ready | TaskStatus::Blocked | TaskStatus::ChangesRequested))
    {
        return NodeState::Pending;
    }
    NodeState::Done
}

/// Status text for a role: the summary of its most recently updated task
/// that has a worker outcome, falling back to an explicit `agentStates`
/// override when the caller supplies one.
fn role_status(tasks: &[&TaskRecord], agent_states: Option<&HashMap<Role, String>>, role: Role) -> Option<String> {
    if let Some(states) = agent_states {
        if let Some(text) = states.get(&role) {
            return Some(text.clone());
        }
    }
    tasks
        .iter()
        .filter(|t| t.worker_outcome.is_some())
        .max_by_key(|t| t.updated_at)
        .and_then(|t| t.summary.clone())
}

/// Builds the agent graph: one node per role, edges fixed by the pipeline
/// shape, each edge `active` iff its source node is `active`. `workers` is
/// accepted for parity with the conceptual `(tasks, workers, agentStates)`
/// signature but the current node/edge derivation only needs task state.
pub fn agent_graph(
    tasks: &[TaskRecord],
    _workers: &[WorkerStatus],
    agent_states: Option<&HashMap<Role, String>>,
) -> AgentGraph {
    let mut by_role: HashMap<Role, Vec<&TaskRecord>> = HashMap::new();
    for task in tasks {
        by_role.entry(task.role).or_default().push(task);
    }

    let mut nodes = Vec::with_capacity(ROLES.len());
    let mut node_state: HashMap<Role, NodeState> = HashMap::new();
    for &role in ROLES {
        let role_tasks = by_role.get(&role).map(Vec::as_slice).unwrap_or(&[]);
        let state = role_state(role_tasks);
        node_state.insert(role, state);
        nodes.push(AgentNode { role, state, status: role_status(role_tasks, agent_states, role) });
    }

    let edges = EDGES
        .iter()
        .map(|&(from, to)| AgentEdge { from, to, active: node_state.get(&from) == Some(&NodeState::Active) })
        .collect();

    AgentGraph { nodes, edges }
}
