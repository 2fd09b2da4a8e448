//! State graph ordering and reachability pruning.
//!
//! Uses `petgraph` to model unconditional `next` edges as a directed graph.
//! Topological sort detects cycles, and depth-based ranking orders states so
//! that every state follows all states naming it as `next`. Pruning walks
//! every edge a running instance could take and keeps only what it reaches.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use stepflow_types::definition::{State, StateMachine};
use thiserror::Error;

/// Structural errors in a state graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("{state}.Next={next}, but {next} not defined")]
    MissingState { state: String, next: String },

    #[error("cycle detected involving state '{0}'")]
    CyclicGraph(String),

    #[error("start state name must not be empty")]
    EmptyStart,

    #[error("start state '{0}' not defined")]
    UnknownStart(String),

    #[error("state '{state}' references undefined state '{target}'")]
    DanglingReference { state: String, target: String },

    #[error("branch {index} of parallel state '{state}': {source}")]
    Branch {
        state: String,
        index: usize,
        source: Box<GraphError>,
    },
}

// ---------------------------------------------------------------------------
// Topological ordering
// ---------------------------------------------------------------------------

/// A state together with the states that name it as `next`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateAndDeps<'a> {
    pub name: &'a str,
    pub state: &'a State,
    /// Predecessors along `next` edges, sorted by name.
    pub deps: Vec<&'a str>,
}

/// Order states so that each one follows every state naming it as `next`.
///
/// The algorithm:
///
/// 1. Invert `next` edges into a predecessor list per state.
/// 2. Run `petgraph::algo::toposort` to verify acyclicity.
/// 3. Rank each state by its longest predecessor chain.
/// 4. Emit states by rank, and by name within a rank.
///
/// Choice, Succeed and Fail states have no unconditional `next` and so never
/// contribute edges.
pub fn ordered_states(states: &BTreeMap<String, State>) -> Result<Vec<StateAndDeps<'_>>, GraphError> {
    let mut deps: BTreeMap<&str, Vec<&str>> =
        states.keys().map(|name| (name.as_str(), Vec::new())).collect();

    for (name, state) in states {
        if let Some(next) = state.next() {
            let Some(predecessors) = deps.get_mut(next) else {
                return Err(GraphError::MissingState {
                    state: name.clone(),
                    next: next.to_string(),
                });
            };
            predecessors.push(name.as_str());
        }
    }

    // Directed graph: edge from predecessor -> successor
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, NodeIndex> = deps
        .keys()
        .map(|&name| (name, graph.add_node(name)))
        .collect();
    for (&name, predecessors) in &deps {
        for predecessor in predecessors {
            graph.add_edge(nodes[predecessor], nodes[name], ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        GraphError::CyclicGraph(graph[cycle.node_id()].to_string())
    })?;

    // Rank = longest chain of predecessors; roots have rank 0
    let mut ranks: HashMap<&str, usize> = HashMap::new();
    for node in sorted {
        let name = graph[node];
        let rank = deps[name]
            .iter()
            .map(|predecessor| ranks.get(predecessor).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        ranks.insert(name, rank);
    }

    let mut ordered: Vec<StateAndDeps<'_>> = states
        .iter()
        .map(|(name, state)| StateAndDeps {
            name: name.as_str(),
            state,
            deps: deps.remove(name.as_str()).unwrap_or_default(),
        })
        .collect();
    ordered.sort_by(|a, b| ranks[a.name].cmp(&ranks[b.name]).then_with(|| a.name.cmp(b.name)));

    Ok(ordered)
}

// ---------------------------------------------------------------------------
// Reachability pruning
// ---------------------------------------------------------------------------

/// Return a copy of `machine` holding only the states reachable from its start.
///
/// Edges followed: `next`, Choice targets and default, and Catch targets.
/// Parallel branches are pruned recursively within their own machines. Any
/// reachable reference to an undefined state is an error; unreachable states
/// are never inspected.
pub fn pruned(machine: &StateMachine) -> Result<StateMachine, GraphError> {
    if machine.start_at.is_empty() {
        return Err(GraphError::EmptyStart);
    }
    if !machine.states.contains_key(&machine.start_at) {
        return Err(GraphError::UnknownStart(machine.start_at.clone()));
    }

    let mut reachable: BTreeSet<&str> = BTreeSet::from([machine.start_at.as_str()]);
    let mut queue: VecDeque<&str> = VecDeque::from([machine.start_at.as_str()]);

    while let Some(name) = queue.pop_front() {
        let Some(state) = machine.states.get(name) else {
            continue;
        };
        for target in state.targets() {
            if !machine.states.contains_key(target) {
                return Err(GraphError::DanglingReference {
                    state: name.to_string(),
                    target: target.to_string(),
                });
            }
            if reachable.insert(target) {
                queue.push_back(target);
            }
        }
    }

    let mut states = BTreeMap::new();
    for name in reachable {
        let Some(state) = machine.states.get(name) else {
            continue;
        };
        let mut state = state.clone();
        if let State::Parallel(parallel) = &mut state {
            for (index, branch) in parallel.branches.iter_mut().enumerate() {
                *branch = pruned(branch).map_err(|source| GraphError::Branch {
                    state: name.to_string(),
                    index,
                    source: Box::new(source),
                })?;
            }
        }
        states.insert(name.to_string(), state);
    }

    Ok(StateMachine {
        start_at: machine.start_at.clone(),
        states,
        comment: machine.comment.clone(),
        timeout_seconds: machine.timeout_seconds,
    })
}

/// Drop every state unreachable from the start state, in place.
///
/// The pruned machine is computed on a separate copy and only assigned on
/// success; on error `machine` is left untouched.
pub fn remove_inactive_states(machine: &mut StateMachine) -> Result<(), GraphError> {
    *machine = pruned(machine)?;
    Ok(())
}
