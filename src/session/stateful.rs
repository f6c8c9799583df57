//! State-machine navigation for protocols that declare a `state_model`:
//! exploration mode selection, termination injection, and coverage
//! tracking.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::data_model::{DataModel, FieldMap};

use super::FuzzingMode;

const TERMINAL_NAME_PATTERNS: &[&str] = &["CLOSE", "DISCONNECT", "LOGOUT", "TERMINATE", "END", "EXIT"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    #[serde(alias = "message_type", alias = "message")]
    pub trigger: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateModel {
    pub initial_state: String,
    pub states: Vec<String>,
    pub transitions: Vec<Transition>,
}

impl StateModel {
    pub fn outgoing(&self, from: &str) -> Vec<&Transition> {
        self.transitions.iter().filter(|t| t.from == from || t.from == "*").collect()
    }

    pub fn is_terminal(&self, state: &str) -> bool {
        if self.outgoing(state).is_empty() {
            return true;
        }
        let upper = state.to_uppercase();
        TERMINAL_NAME_PATTERNS.iter().any(|p| upper.contains(p))
    }

    /// BFS shortest path of transitions from `from` to `target`, or `None`
    /// if unreachable.
    pub fn path_to(&self, from: &str, target: &str) -> Option<Vec<&Transition>> {
        if from == target {
            return Some(Vec::new());
        }
        let mut visited = std::collections::HashSet::new();
        visited.insert(from.to_string());
        let mut queue: VecDeque<(String, Vec<&Transition>)> = VecDeque::new();
        queue.push_back((from.to_string(), Vec::new()));

        while let Some((state, path)) = queue.pop_front() {
            for t in self.outgoing(&state) {
                if visited.contains(&t.to) {
                    continue;
                }
                let mut next_path = path.clone();
                next_path.push(t);
                if t.to == target {
                    return Some(next_path);
                }
                visited.insert(t.to.clone());
                queue.push_back((t.to.clone(), next_path));
            }
        }
        None
    }
}

pub struct StatefulSession {
    model: StateModel,
    mode: FuzzingMode,
    target_state: Option<String>,
    current_state: String,
    state_coverage: HashMap<String, u64>,
    transition_coverage: HashMap<String, u64>,
    rng: StdRng,

    progression_weight: f64,
    reset_interval: u64,
    tests_since_reset: u64,
    tests_total: u64,

    enable_termination: bool,
    termination_test_interval: u64,
    termination_test_window: u64,
    pending_termination_reset: bool,
}

impl StatefulSession {
    pub fn new(
        model: StateModel,
        mode: FuzzingMode,
        target_state: Option<String>,
        progression_weight: f64,
        reset_interval: u64,
        enable_termination: bool,
        termination_test_interval: u64,
        termination_test_window: u64,
        rng_seed: u64,
    ) -> Self {
        let current_state = model.initial_state.clone();
        Self {
            model,
            mode,
            target_state,
            current_state,
            state_coverage: HashMap::new(),
            transition_coverage: HashMap::new(),
            rng: StdRng::seed_from_u64(rng_seed),
            progression_weight,
            reset_interval,
            tests_since_reset: 0,
            tests_total: 0,
            enable_termination,
            termination_test_interval,
            termination_test_window,
            pending_termination_reset: false,
        }
    }

    pub fn current_state(&self) -> &str {
        &self.current_state
    }

    pub fn state_coverage(&self) -> &HashMap<String, u64> {
        &self.state_coverage
    }

    pub fn transition_coverage(&self) -> &HashMap<String, u64> {
        &self.transition_coverage
    }

    /// Restores coverage counters on resume by adding a persisted baseline
    /// on top of a fresh (empty) session.
    pub fn apply_offsets(&mut self, state_offset: &HashMap<String, u64>, transition_offset: &HashMap<String, u64>) {
        for (k, v) in state_offset {
            *self.state_coverage.entry(k.clone()).or_insert(0) += v;
        }
        for (k, v) in transition_offset {
            *self.transition_coverage.entry(k.clone()).or_insert(0) += v;
        }
    }

    /// Picks the next transition to exercise. Returns `None` when there is
    /// no outgoing transition from the current state (a dead end).
    ///
    /// `outgoing` is collected into owned `Transition`s up front so the
    /// rest of this method is free to borrow `self` mutably (the RNG,
    /// coverage maps) without fighting a borrow tied to `self.model`.
    pub fn choose_next(&mut self) -> Option<Transition> {
        self.tests_total += 1;
        let outgoing: Vec<Transition> =
            self.model.outgoing(&self.current_state).into_iter().cloned().collect();
        if outgoing.is_empty() {
            return None;
        }

        if self.enable_termination && self.wants_termination_injection() {
            self.pending_termination_reset = true;
            if let Some(t) = self.transition_toward_terminal(&outgoing) {
                return Some(t);
            }
        }

        let roll: f64 = self.rng.gen();
        if roll < 0.15 {
            if let Some(t) = outgoing.iter().find(|t| !self.state_coverage.contains_key(&t.to)) {
                return Some(t.clone());
            }
        } else if roll < 0.25 {
            if let Some(t) = outgoing.iter().find(|t| self.model.is_terminal(&t.to)) {
                return Some(t.clone());
            }
        }

        match self.mode {
            FuzzingMode::Random => self.choose_random(&outgoing),
            FuzzingMode::Bfs => self.choose_breadth_first(&outgoing),
            FuzzingMode::Dfs => self.choose_depth_first(&outgoing),
            FuzzingMode::Targeted => self.choose_targeted(&outgoing),
        }
    }

    fn wants_termination_injection(&self) -> bool {
        if self.termination_test_interval > 0 && self.tests_total % self.termination_test_interval == 0 {
            return true;
        }
        let remaining = self.reset_interval.saturating_sub(self.tests_since_reset);
        remaining <= self.termination_test_window
    }

    fn transition_toward_terminal(&self, outgoing: &[Transition]) -> Option<Transition> {
        if let Some(t) = outgoing.iter().find(|t| self.model.is_terminal(&t.to)) {
            return Some(t.clone());
        }
        for state in &self.model.states {
            if self.model.is_terminal(state) {
                if let Some(path) = self.model.path_to(&self.current_state, state) {
                    if let Some(first) = path.first() {
                        return Some((*first).clone());
                    }
                }
            }
        }
        None
    }

    fn choose_random(&mut self, outgoing: &[Transition]) -> Option<Transition> {
        if self.rng.gen_bool(self.progression_weight.clamp(0.0, 1.0)) {
            outgoing.first().cloned()
        } else {
            let idx = self.rng.gen_range(0..outgoing.len());
            Some(outgoing[idx].clone())
        }
    }

    fn choose_breadth_first(&mut self, outgoing: &[Transition]) -> Option<Transition> {
        outgoing.iter().min_by_key(|t| self.state_coverage.get(&t.to).copied().unwrap_or(0)).cloned()
    }

    fn choose_depth_first(&mut self, outgoing: &[Transition]) -> Option<Transition> {
        outgoing
            .iter()
            .find(|t| !self.state_coverage.contains_key(&t.to))
            .cloned()
            .or_else(|| outgoing.iter().min_by_key(|t| self.state_coverage.get(&t.to).copied().unwrap_or(0)).cloned())
    }

    fn choose_targeted(&mut self, outgoing: &[Transition]) -> Option<Transition> {
        if let Some(target) = self.target_state.clone() {
            if let Some(path) = self.model.path_to(&self.current_state, &target) {
                if let Some(first) = path.first() {
                    if let Some(t) = outgoing.iter().find(|o| o.to == first.to && o.trigger == first.trigger) {
                        return Some(t.clone());
                    }
                }
            }
        }
        self.choose_random(outgoing)
    }

    /// Records a taken transition, updating coverage and resolving any
    /// pending termination reset once a terminal state is reached.
    pub fn record_transition(&mut self, transition: &Transition) {
        *self.state_coverage.entry(transition.to.clone()).or_insert(0) += 1;
        let key = format!("{}\u{2192}{}", transition.from, transition.to);
        *self.transition_coverage.entry(key).or_insert(0) += 1;
        self.current_state = transition.to.clone();
        self.tests_since_reset += 1;

        if self.pending_termination_reset && self.model.is_terminal(&self.current_state) {
            self.pending_termination_reset = false;
            self.tests_since_reset = 0;
        }
    }

    /// True once the configured reset interval is reached and no
    /// termination injection is in flight deferring it.
    pub fn should_reset(&self) -> bool {
        !self.pending_termination_reset && self.tests_since_reset >= self.reset_interval
    }

    pub fn reset(&mut self) {
        self.current_state = self.model.initial_state.clone();
        self.tests_since_reset = 0;
    }
}

/// Resolves the block used for stateful seed matching, then looks up the
/// integer value that corresponds to `message_type` in that block's
/// `values` enumeration (reverse lookup by name).
pub fn command_value_for_message_type(model: &DataModel, message_type: &str) -> Option<i64> {
    let block = model.command_field()?;
    let values = block.values.as_ref()?;
    values.iter().find(|(_, name)| name.as_str() == message_type).map(|(k, _)| *k)
}

/// Finds the index of a seed (already-parsed field map) whose command
/// field matches the value resolved for `message_type`.
pub fn find_matching_seed<'a>(
    model: &DataModel,
    message_type: &str,
    parsed_seeds: impl Iterator<Item = &'a FieldMap>,
) -> Option<usize> {
    let command_block = model.command_field()?;
    let target = command_value_for_message_type(model, message_type)?;
    parsed_seeds
        .enumerate()
        .find(|(_, fields)| fields.get(&command_block.name).and_then(|v| v.as_i64()) == Some(target))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> StateModel {
        StateModel {
            initial_state: "INIT".to_string(),
            states: vec!["INIT".to_string(), "AUTH".to_string(), "CLOSED".to_string()],
            transitions: vec![
                Transition { from: "INIT".to_string(), to: "AUTH".to_string(), trigger: "LOGIN".to_string() },
                Transition { from: "AUTH".to_string(), to: "CLOSED".to_string(), trigger: "LOGOUT".to_string() },
                Transition { from: "*".to_string(), to: "CLOSED".to_string(), trigger: "DISCONNECT".to_string() },
            ],
        }
    }

    #[test]
    fn closed_state_is_terminal_by_name() {
        let m = model();
        assert!(m.is_terminal("CLOSED"));
        assert!(!m.is_terminal("INIT"));
    }

    #[test]
    fn path_to_finds_shortest_route() {
        let m = model();
        let path = m.path_to("INIT", "CLOSED").unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].trigger, "DISCONNECT");
    }

    #[test]
    fn record_transition_updates_coverage() {
        let mut s = StatefulSession::new(model(), FuzzingMode::Bfs, None, 0.8, 20, false, 50, 3, 1);
        let t = Transition { from: "INIT".to_string(), to: "AUTH".to_string(), trigger: "LOGIN".to_string() };
        s.record_transition(&t);
        assert_eq!(s.current_state(), "AUTH");
        assert_eq!(*s.state_coverage().get("AUTH").unwrap(), 1);
    }

    #[test]
    fn targeted_mode_follows_shortest_path_to_target() {
        let mut s =
            StatefulSession::new(model(), FuzzingMode::Targeted, Some("AUTH".to_string()), 0.8, 20, false, 50, 3, 2);
        let outgoing: Vec<Transition> = s.model.outgoing("INIT").into_iter().cloned().collect();
        let chosen = s.choose_targeted(&outgoing).unwrap();
        assert_eq!(chosen.to, "AUTH");
    }

    #[test]
    fn wildcard_from_matches_any_state() {
        let m = model();
        let outgoing = m.outgoing("AUTH");
        assert!(outgoing.iter().any(|t| t.trigger == "DISCONNECT"));
    }
}
