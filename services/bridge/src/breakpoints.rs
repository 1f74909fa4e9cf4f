//! Mirror of debuggee breakpoints, keyed by `(script name, line)`.
//!
//! A breakpoint requested before its target script is loaded sits in
//! *standby* with a locally allocated id. Standby entries are promoted when
//! a `scripts` response shows the target loaded; the server's
//! `setbreakpoint` response then replaces the local id with the
//! server-assigned one. Connection loss moves every entry back to standby so
//! a later attach can re-promote them.

use crate::scripts::ScriptCatalog;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Locally allocated until the server acknowledges, then server-assigned.
    pub bp_id: u32,
    pub standby: bool,
    pub enabled: bool,
    pub condition: Option<String>,
    pub ignore_count: u32,
}

/// Outcome of inserting a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Added(u32),
    /// Same `(script, line)` key already present; insert is a no-op.
    Duplicate,
}

/// A standby entry whose target script is now loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionCandidate {
    pub name: String,
    pub line: u32,
    pub bp_id: u32,
}

#[derive(Debug, Default)]
pub struct BreakpointCatalog {
    entries: HashMap<(String, u32), Breakpoint>,
    next_local_id: u32,
}

impl BreakpointCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new breakpoint in standby state with a fresh local id.
    /// Duplicate keys are silently deduplicated.
    pub fn add_standby(&mut self, name: &str, line: u32) -> InsertOutcome {
        let key = (name.to_owned(), line);
        if self.entries.contains_key(&key) {
            return InsertOutcome::Duplicate;
        }
        self.next_local_id += 1;
        let bp_id = self.next_local_id;
        self.entries.insert(
            key,
            Breakpoint {
                bp_id,
                standby: true,
                enabled: true,
                condition: None,
                ignore_count: 0,
            },
        );
        InsertOutcome::Added(bp_id)
    }

    /// Remove the entry, returning its breakpoint and whether it had been
    /// acknowledged by the server (a standby entry has no server-side
    /// breakpoint to clear).
    pub fn remove(&mut self, name: &str, line: u32) -> Option<Breakpoint> {
        self.entries.remove(&(name.to_owned(), line))
    }

    pub fn get(&self, name: &str, line: u32) -> Option<&Breakpoint> {
        self.entries.get(&(name.to_owned(), line))
    }

    /// Find an entry by breakpoint id (local or server-assigned).
    pub fn find_by_id(&self, bp_id: u32) -> Option<(&str, u32)> {
        self.entries
            .iter()
            .find(|(_, bp)| bp.bp_id == bp_id)
            .map(|((name, line), _)| (name.as_str(), *line))
    }

    /// Standby entries whose target script is now loaded.
    pub fn standby_ready(&self, scripts: &ScriptCatalog) -> Vec<PromotionCandidate> {
        let mut ready: Vec<PromotionCandidate> = self
            .entries
            .iter()
            .filter(|((name, _), bp)| bp.standby && scripts.exists(name))
            .map(|((name, line), bp)| PromotionCandidate {
                name: name.clone(),
                line: *line,
                bp_id: bp.bp_id,
            })
            .collect();
        ready.sort_by(|a, b| a.name.cmp(&b.name).then(a.line.cmp(&b.line)));
        ready
    }

    /// Clear standby when the promotion `setbreakpoint` is issued. This is
    /// what keeps repeated `scripts` responses from re-promoting the same
    /// entry.
    pub fn clear_standby(&mut self, name: &str, line: u32) {
        if let Some(bp) = self.entries.get_mut(&(name.to_owned(), line)) {
            bp.standby = false;
        }
    }

    /// Record the server-assigned id from a `setbreakpoint` response. The
    /// server may have snapped the breakpoint to a different line; the entry
    /// is re-keyed to the actual location when it moved.
    pub fn acknowledge(&mut self, name: &str, requested_line: u32, actual_line: u32, server_id: u32) {
        let Some(mut bp) = self.entries.remove(&(name.to_owned(), requested_line)) else {
            return;
        };
        bp.bp_id = server_id;
        bp.standby = false;
        self.entries.insert((name.to_owned(), actual_line), bp);
    }

    pub fn set_enabled_by_id(&mut self, bp_id: u32, enabled: bool) -> bool {
        for bp in self.entries.values_mut() {
            if bp.bp_id == bp_id {
                bp.enabled = enabled;
                return true;
            }
        }
        false
    }

    /// Move every entry back to standby (connection reset).
    pub fn standby_all(&mut self) {
        for bp in self.entries.values_mut() {
            bp.standby = true;
        }
    }

    pub fn has_standby(&self) -> bool {
        self.entries.values().any(|bp| bp.standby)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
