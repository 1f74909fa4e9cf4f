//! The variable-inspection engine.
//!
//! Built from successive `frame` → `scope` → `lookup` round-trips on each
//! stop. Consecutive stops are compared for *shape equality* (scopes: same
//! length and kinds; properties: same name set and value types) so the
//! user's fold state survives stepping; retained subtrees carry stale values
//! until the next `lookup` refresh. Rendering diffs each node against its
//! previous-stop counterpart by path and marks changed values.

use indexmap::IndexMap;
use nb_protocol::{InlineProperty, ValueSummary};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

// ---------------------------------------------------------------------------
// Scope and property tree
// ---------------------------------------------------------------------------

/// Lexical scope classes reported in `frame` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Local,
    With,
    Closure,
    Catch,
}

impl ScopeKind {
    pub fn from_wire(kind: u8) -> Option<Self> {
        match kind {
            0 => Some(Self::Global),
            1 => Some(Self::Local),
            2 => Some(Self::With),
            3 => Some(Self::Closure),
            4 => Some(Self::Catch),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Global => "Global",
            Self::Local => "Local",
            Self::With => "With",
            Self::Closure => "Closure",
            Self::Catch => "Catch",
        }
    }

    /// Local and Closure scopes open by default; the rest start folded.
    fn default_expanded(self) -> bool {
        matches!(self, Self::Local | Self::Closure)
    }
}

/// One entry of a `frame` response's `scopes` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ScopeDescriptor {
    pub index: u32,
    #[serde(rename = "type")]
    pub kind: u8,
}

/// The slice of a value mirror the model keeps per property.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueRef {
    pub kind: String,
    /// Present for leaves; composites carry only a handle.
    pub value: Option<Value>,
    pub class_name: Option<String>,
    pub handle: Option<u64>,
}

impl From<ValueSummary> for ValueRef {
    fn from(v: ValueSummary) -> Self {
        Self {
            kind: v.kind,
            value: v.value,
            class_name: v.class_name,
            handle: v.handle,
        }
    }
}

impl ValueRef {
    fn is_leaf(&self) -> bool {
        self.value.is_some()
    }

    fn label(&self) -> String {
        match &self.value {
            Some(v) => value_text(v),
            None => match &self.class_name {
                Some(c) => format!("<{c}>"),
                None => format!("<{}>", self.kind),
            },
        }
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fold state of a composite property: whether the user opened it and the
/// children fetched by `lookup`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fold {
    pub expanded: bool,
    pub properties: IndexMap<String, Property>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub value: ValueRef,
    /// `Some` for composites, `None` for leaves.
    pub children: Option<Fold>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub kind: ScopeKind,
    pub expanded: bool,
    /// True until this scope's `scope` response arrives.
    pub standby: bool,
    pub properties: IndexMap<String, Property>,
}

/// Path of a node in the tree: scope index plus property names from the
/// scope root down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarPath {
    pub scope: usize,
    pub names: Vec<String>,
}

/// Result of toggling a rendered line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldAction {
    /// Fold state changed (or nothing did); re-render only.
    Redraw,
    /// A composite was opened whose children are unknown: issue a `lookup`
    /// for this handle.
    Lookup(u64),
    /// The line does not map to a node.
    OutOfRange,
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct VarModel {
    scopes: Vec<Scope>,
    prev_scopes: Vec<Scope>,
    /// Handles the user expanded, by path; re-keyed on every stop because
    /// handles are only valid between two resumes.
    lookups: HashMap<u64, VarPath>,
    dirty: bool,
}

impl VarModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    /// True while any scope still awaits its `scope` response.
    pub fn is_standby(&self) -> bool {
        self.scopes.iter().any(|s| s.standby)
    }

    /// Shape equality against the current scope array: same length and a
    /// matching kind at each index.
    fn shape_equal(&self, descriptors: &[ScopeDescriptor]) -> bool {
        self.scopes.len() == descriptors.len()
            && descriptors.iter().all(|d| {
                self.scopes
                    .get(d.index as usize)
                    .is_some_and(|s| ScopeKind::from_wire(d.kind) == Some(s.kind))
            })
    }

    /// Install the scope array for a new stop. When the shape matches the
    /// previous stop, the old tree is kept as the comparison baseline and
    /// per-scope fold flags are restored; otherwise the baseline is
    /// discarded.
    pub fn set_scopes(&mut self, descriptors: &[ScopeDescriptor]) {
        if self.shape_equal(descriptors) {
            self.prev_scopes = std::mem::take(&mut self.scopes);
        } else {
            self.prev_scopes.clear();
        }

        let mut slots: Vec<Option<Scope>> = (0..descriptors.len()).map(|_| None).collect();
        for d in descriptors {
            let kind = ScopeKind::from_wire(d.kind).unwrap_or_else(|| {
                warn!(kind = d.kind, "unknown scope kind, treating as Global");
                ScopeKind::Global
            });
            if let Some(slot) = slots.get_mut(d.index as usize) {
                *slot = Some(Scope {
                    kind,
                    expanded: kind.default_expanded(),
                    standby: true,
                    properties: IndexMap::new(),
                });
            }
        }
        self.scopes = slots
            .into_iter()
            .map(|s| {
                s.unwrap_or(Scope {
                    kind: ScopeKind::Global,
                    expanded: false,
                    standby: true,
                    properties: IndexMap::new(),
                })
            })
            .collect();

        if !self.prev_scopes.is_empty() {
            for (scope, prev) in self.scopes.iter_mut().zip(&self.prev_scopes) {
                scope.expanded = prev.expanded;
            }
        }
        self.dirty = true;
    }

    /// Recovery path for a failed `scope` response: put the previous tree
    /// back so a half-built one is never rendered.
    pub fn restore_prev_scopes(&mut self) {
        self.scopes = self.prev_scopes.clone();
        self.dirty = true;
    }

    /// Install a scope's properties from its `scope` response. When the
    /// property shape matches the previous stop, fold flags and fetched
    /// children are inherited (stale until re-looked-up); on a shape break
    /// the previous subtree is discarded entirely, so nothing compares or
    /// stays expanded.
    pub fn set_scope_properties(&mut self, index: usize, props: Vec<InlineProperty>) {
        let new_props = build_properties(props);
        let Some(scope) = self.scopes.get_mut(index) else {
            warn!(index, "scope response for unknown index");
            return;
        };
        scope.properties = new_props;
        if let Some(prev) = self.prev_scopes.get_mut(index) {
            if shape_equal_properties(&scope.properties, &prev.properties) {
                inherit_folds(&mut scope.properties, &prev.properties);
            } else {
                prev.properties.clear();
            }
        }
        scope.standby = false;
        self.dirty = true;
    }

    /// Handles to re-fetch for this stop: every retained expansion path is
    /// re-resolved against the new tree and its current ref collected,
    /// deduplicated by handle.
    pub fn lookup_list(&mut self) -> Vec<u64> {
        let prev = std::mem::take(&mut self.lookups);
        let mut handles = Vec::new();
        for (_, path) in prev {
            let handle = self.node(&path).and_then(|n| n.value.handle);
            let Some(handle) = handle else { continue };
            if self.lookups.insert(handle, path).is_none() {
                handles.push(handle);
            }
        }
        handles.sort_unstable();
        handles
    }

    /// Install the children of an expanded composite from a `lookup`
    /// response. Returns false when the handle is not one we asked for.
    pub fn set_properties_for_handle(&mut self, handle: u64, props: Vec<InlineProperty>) -> bool {
        let Some(path) = self.lookups.get(&handle).cloned() else {
            return false;
        };
        let Some(node) = node_mut(&mut self.scopes, &path) else {
            return false;
        };
        let fold = node.children.get_or_insert_with(Fold::default);
        let old = std::mem::replace(&mut fold.properties, build_properties(props));
        if shape_equal_properties(&fold.properties, &old) {
            inherit_folds(&mut fold.properties, &old);
        }
        self.dirty = true;
        true
    }

    /// Toggle the fold at a rendered line (1-based).
    pub fn toggle_fold(&mut self, line: u32) -> FoldAction {
        if line == 0 {
            return FoldAction::OutOfRange;
        }
        let Some(target) = self.visible_lines().into_iter().nth(line as usize - 1) else {
            return FoldAction::OutOfRange;
        };
        match target {
            LineTarget::ScopeRoot(index) => {
                if let Some(scope) = self.scopes.get_mut(index) {
                    scope.expanded = !scope.expanded;
                    self.dirty = true;
                }
                FoldAction::Redraw
            }
            LineTarget::Node(path) => {
                let Some(node) = node_mut(&mut self.scopes, &path) else {
                    return FoldAction::OutOfRange;
                };
                let Some(fold) = node.children.as_mut() else {
                    // Leaf: nothing to fold, no lookup needed.
                    return FoldAction::Redraw;
                };
                fold.expanded = !fold.expanded;
                self.dirty = true;
                if fold.expanded && fold.properties.is_empty() {
                    if let Some(handle) = node.value.handle {
                        self.lookups.insert(handle, path);
                        return FoldAction::Lookup(handle);
                    }
                }
                FoldAction::Redraw
            }
        }
    }

    /// Render the tree. Each line is `<tgl> <name> ={<marker>} <value>`,
    /// indented one space per depth; the marker is `*` when the value
    /// changed against the previous stop and `=` otherwise (including when
    /// there is no prior to compare).
    pub fn render(&mut self) -> String {
        let mut out = String::new();
        for (index, scope) in self.scopes.iter().enumerate() {
            let tgl = if scope.expanded { "[-]" } else { "[+]" };
            out.push_str(tgl);
            out.push(' ');
            out.push_str(scope.kind.label());
            out.push('\n');
            if scope.expanded {
                let prev = self.prev_scopes.get(index).map(|s| &s.properties);
                render_properties(&mut out, &scope.properties, prev, 1);
            }
        }
        self.dirty = false;
        out
    }

    /// Drop all state (connection loss).
    pub fn reset(&mut self) {
        self.scopes.clear();
        self.prev_scopes.clear();
        self.lookups.clear();
        self.dirty = true;
    }

    // -- path resolution --

    fn node(&self, path: &VarPath) -> Option<&Property> {
        let scope = self.scopes.get(path.scope)?;
        let mut names = path.names.iter();
        let mut cur = scope.properties.get(names.next()?)?;
        for name in names {
            cur = cur.children.as_ref()?.properties.get(name)?;
        }
        Some(cur)
    }

    /// The rendered view, as `(line -> tree node)` targets, in render order.
    fn visible_lines(&self) -> Vec<LineTarget> {
        let mut lines = Vec::new();
        for (index, scope) in self.scopes.iter().enumerate() {
            lines.push(LineTarget::ScopeRoot(index));
            if scope.expanded {
                collect_lines(&mut lines, index, &scope.properties, &[]);
            }
        }
        lines
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LineTarget {
    ScopeRoot(usize),
    Node(VarPath),
}

fn collect_lines(
    lines: &mut Vec<LineTarget>,
    scope: usize,
    props: &IndexMap<String, Property>,
    prefix: &[String],
) {
    for (name, prop) in props {
        let mut names = prefix.to_vec();
        names.push(name.clone());
        lines.push(LineTarget::Node(VarPath {
            scope,
            names: names.clone(),
        }));
        if let Some(fold) = &prop.children {
            if fold.expanded {
                collect_lines(lines, scope, &fold.properties, &names);
            }
        }
    }
}

fn node_mut<'a>(scopes: &'a mut [Scope], path: &VarPath) -> Option<&'a mut Property> {
    let scope = scopes.get_mut(path.scope)?;
    let mut names = path.names.iter();
    let mut cur = scope.properties.get_mut(names.next()?)?;
    for name in names {
        cur = cur.children.as_mut()?.properties.get_mut(name)?;
    }
    Some(cur)
}

fn build_properties(props: Vec<InlineProperty>) -> IndexMap<String, Property> {
    let mut map = IndexMap::with_capacity(props.len());
    for p in props {
        let value = ValueRef::from(p.value);
        let children = if value.is_leaf() {
            None
        } else {
            Some(Fold::default())
        };
        map.insert(
            p.name.clone(),
            Property {
                name: p.name,
                value,
                children,
            },
        );
    }
    map
}

/// Same name set and the same value type for each name. Values are ignored.
fn shape_equal_properties(a: &IndexMap<String, Property>, b: &IndexMap<String, Property>) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(name, prop)| b.get(name).is_some_and(|p| p.value.kind == prop.value.kind))
}

/// Copy fold flags and fetched children from the previous stop's
/// shape-equal property map. The copied children carry stale values; the
/// caller refreshes them through `lookup_list`.
fn inherit_folds(new: &mut IndexMap<String, Property>, prev: &IndexMap<String, Property>) {
    for (name, prop) in new.iter_mut() {
        let Some(prev_prop) = prev.get(name) else {
            continue;
        };
        if let (Some(fold), Some(prev_fold)) = (prop.children.as_mut(), prev_prop.children.as_ref())
        {
            fold.expanded = prev_fold.expanded;
            fold.properties = prev_fold.properties.clone();
        }
    }
}

fn marker(cur: &Property, prev: Option<&Property>) -> char {
    let Some(prev) = prev else {
        return '=';
    };
    if cur.value.kind != prev.value.kind {
        return '*';
    }
    if cur.value.is_leaf() {
        let changed = match (&cur.value.value, &prev.value.value) {
            (Some(a), Some(b)) => value_text(a) != value_text(b),
            _ => true,
        };
        if changed {
            return '*';
        }
    }
    '='
}

fn render_properties(
    out: &mut String,
    props: &IndexMap<String, Property>,
    prev: Option<&IndexMap<String, Property>>,
    depth: usize,
) {
    for (name, prop) in props {
        let prev_prop = prev.and_then(|m| m.get(name));
        let tgl = match &prop.children {
            Some(fold) if fold.expanded => "[-]",
            Some(_) => "[+]",
            None => "   ",
        };
        let mark = marker(prop, prev_prop);
        out.push_str(&" ".repeat(depth));
        out.push_str(&format!("{tgl} {} ={{{mark}}} {}\n", prop.name, prop.value.label()));
        if let Some(fold) = &prop.children {
            if fold.expanded {
                let prev_children = prev_prop
                    .and_then(|p| p.children.as_ref())
                    .map(|f| &f.properties);
                render_properties(out, &fold.properties, prev_children, depth + 1);
            }
        }
    }
}
