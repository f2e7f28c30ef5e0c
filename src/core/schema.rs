//! Box registry: declarations of a return's line items and their validation.
//!
//! A [`SchemaDef`] is plain data (it can come from JSON). Turning it into a
//! [`RegimeSchema`] checks that every reference resolves, the dependency graph
//! is acyclic and declaration order is a valid evaluation order. The engine
//! relies on those guarantees and only ever sees validated schemas.

use super::expr::{BoxId, Expr};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Identifier of a tax regime (one return form), e.g. `"vat"`.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct RegimeId(String);

impl RegimeId {
    pub fn new(id: impl Into<String>) -> Self {
        RegimeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RegimeId {
    fn from(s: &str) -> Self {
        RegimeId(s.to_string())
    }
}

impl Borrow<str> for RegimeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// What the number in a box measures. Presentation metadata only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    #[default]
    Vnd,
    Count,
    Percent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoxKind {
    /// Declared figure supplied by the caller
    Raw {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        #[schemars(with = "Option<f64>")]
        default: Option<Decimal>,
    },
    /// Computed figure. No formula means the box is a bifurcation target.
    Derived {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        formula: Option<Expr>,
    },
}

/// One numbered line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BoxDef {
    pub id: BoxId,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default)]
    pub unit: Unit,
    #[serde(flatten)]
    pub kind: BoxKind,
    /// Caveat shown next to the box, e.g. a provisional mapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl BoxDef {
    pub fn raw(id: &str, label: &str) -> Self {
        BoxDef {
            id: BoxId::from(id),
            label: label.to_string(),
            section: None,
            unit: Unit::Vnd,
            kind: BoxKind::Raw { default: None },
            note: None,
        }
    }

    /// Raw box that falls back to zero when not supplied.
    pub fn optional(id: &str, label: &str) -> Self {
        BoxDef::raw(id, label).default_to(Decimal::ZERO)
    }

    pub fn derived(id: &str, label: &str, formula: Expr) -> Self {
        BoxDef {
            kind: BoxKind::Derived {
                formula: Some(formula),
            },
            ..BoxDef::raw(id, label)
        }
    }

    /// Derived box filled in by a [`Bifurcation`].
    pub fn split(id: &str, label: &str) -> Self {
        BoxDef {
            kind: BoxKind::Derived { formula: None },
            ..BoxDef::raw(id, label)
        }
    }

    pub fn default_to(mut self, value: Decimal) -> Self {
        self.kind = BoxKind::Raw {
            default: Some(value),
        };
        self
    }

    pub fn section(mut self, section: &str) -> Self {
        self.section = Some(section.to_string());
        self
    }

    pub fn unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    pub fn note(mut self, note: &str) -> Self {
        self.note = Some(note.to_string());
        self
    }

    pub fn is_raw(&self) -> bool {
        matches!(self.kind, BoxKind::Raw { .. })
    }

    pub fn formula(&self) -> Option<&Expr> {
        match &self.kind {
            BoxKind::Derived { formula } => formula.as_ref(),
            BoxKind::Raw { .. } => None,
        }
    }
}

/// One signed base split into two mutually exclusive non-negative boxes:
/// `positive = max(base, 0)`, `negative = max(-base, 0)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Bifurcation {
    pub base: Expr,
    pub positive: BoxId,
    pub negative: BoxId,
}

impl Bifurcation {
    pub fn new(base: Expr, positive: &str, negative: &str) -> Self {
        Bifurcation {
            base,
            positive: BoxId::from(positive),
            negative: BoxId::from(negative),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CheckOp {
    Le,
    Ge,
    Eq,
}

impl fmt::Display for CheckOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckOp::Le => "<=",
            CheckOp::Ge => ">=",
            CheckOp::Eq => "==",
        })
    }
}

/// Constraint between computed boxes that a filing must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Check {
    pub lhs: Expr,
    pub op: CheckOp,
    pub rhs: Expr,
    pub message: String,
}

impl Check {
    pub fn holds(&self, lhs: Decimal, rhs: Decimal) -> bool {
        match self.op {
            CheckOp::Le => lhs <= rhs,
            CheckOp::Ge => lhs >= rhs,
            CheckOp::Eq => lhs == rhs,
        }
    }
}

/// A supplementary schedule whose `source` box feeds the RAW `target` box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScheduleLink {
    pub schedule: RegimeId,
    pub source: BoxId,
    pub target: BoxId,
}

/// Unvalidated regime definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SchemaDef {
    pub regime: RegimeId,
    #[serde(default)]
    pub title: String,
    pub boxes: Vec<BoxDef>,
    #[serde(default)]
    pub bifurcations: Vec<Bifurcation>,
    /// RAW box that receives the prior period's carry-forward value
    #[serde(default)]
    pub carry_in: Option<BoxId>,
    /// Box exported to the next period
    #[serde(default)]
    pub carry_out: Option<BoxId>,
    #[serde(default)]
    pub checks: Vec<Check>,
    #[serde(default)]
    pub schedules: Vec<ScheduleLink>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("regime id must not be empty")]
    EmptyRegime,
    #[error("{regime}: box [{id}] declared more than once")]
    DuplicateBox { regime: RegimeId, id: BoxId },
    #[error("{regime}: {context} references undeclared box [{id}]")]
    UnknownBox {
        regime: RegimeId,
        context: String,
        id: BoxId,
    },
    #[error("{regime}: dependency cycle {path}")]
    Cycle { regime: RegimeId, path: String },
    #[error("{regime}: box [{from}] references [{to}] which is declared later")]
    ForwardReference {
        regime: RegimeId,
        from: BoxId,
        to: BoxId,
    },
    #[error("{regime}: invalid bifurcation [{positive}]/[{negative}]: {reason}")]
    InvalidBifurcation {
        regime: RegimeId,
        positive: BoxId,
        negative: BoxId,
        reason: String,
    },
    #[error("{regime}: derived box [{id}] has no formula and is not a bifurcation target")]
    MissingFormula { regime: RegimeId, id: BoxId },
    #[error("{regime}: invalid carry box [{id}]: {reason}")]
    InvalidCarry {
        regime: RegimeId,
        id: BoxId,
        reason: String,
    },
    #[error("{regime}: invalid schedule link from {schedule}: {reason}")]
    InvalidSchedule {
        regime: RegimeId,
        schedule: RegimeId,
        reason: String,
    },
    #[error("regime {0} is already registered")]
    AlreadyRegistered(RegimeId),
    #[error("regime {0} is not registered")]
    NotRegistered(RegimeId),
}

/// A validated, immutable regime schema.
#[derive(Debug, Clone)]
pub struct RegimeSchema {
    def: SchemaDef,
    index: HashMap<BoxId, usize>,
    split_of: HashMap<BoxId, usize>,
}

impl RegimeSchema {
    pub fn regime(&self) -> &RegimeId {
        &self.def.regime
    }

    pub fn title(&self) -> &str {
        &self.def.title
    }

    /// Boxes in declaration (and evaluation) order.
    pub fn boxes(&self) -> &[BoxDef] {
        &self.def.boxes
    }

    pub fn bifurcations(&self) -> &[Bifurcation] {
        &self.def.bifurcations
    }

    pub fn checks(&self) -> &[Check] {
        &self.def.checks
    }

    pub fn schedules(&self) -> &[ScheduleLink] {
        &self.def.schedules
    }

    pub fn carry_in(&self) -> Option<&BoxId> {
        self.def.carry_in.as_ref()
    }

    pub fn carry_out(&self) -> Option<&BoxId> {
        self.def.carry_out.as_ref()
    }

    pub fn get(&self, id: &str) -> Option<&BoxDef> {
        self.index.get(id).map(|&i| &self.def.boxes[i])
    }

    /// The bifurcation that fills `id`, if any.
    pub fn bifurcation_for(&self, id: &str) -> Option<&Bifurcation> {
        self.split_of.get(id).map(|&i| &self.def.bifurcations[i])
    }

    pub fn definition(&self) -> &SchemaDef {
        &self.def
    }
}

impl TryFrom<SchemaDef> for RegimeSchema {
    type Error = SchemaError;

    fn try_from(def: SchemaDef) -> Result<Self, SchemaError> {
        validate(def)
    }
}

fn validate(def: SchemaDef) -> Result<RegimeSchema, SchemaError> {
    if def.regime.as_str().trim().is_empty() {
        return Err(SchemaError::EmptyRegime);
    }
    let regime = def.regime.clone();

    let mut index = HashMap::with_capacity(def.boxes.len());
    for (i, b) in def.boxes.iter().enumerate() {
        if index.insert(b.id.clone(), i).is_some() {
            return Err(SchemaError::DuplicateBox {
                regime: regime.clone(),
                id: b.id.clone(),
            });
        }
    }

    let known = |context: &dyn Fn() -> String, id: &BoxId| -> Result<usize, SchemaError> {
        index
            .get(id)
            .copied()
            .ok_or_else(|| SchemaError::UnknownBox {
                regime: regime.clone(),
                context: context(),
                id: id.clone(),
            })
    };

    let mut split_of: HashMap<BoxId, usize> = HashMap::new();
    for (n, bif) in def.bifurcations.iter().enumerate() {
        let invalid = |reason: &str| SchemaError::InvalidBifurcation {
            regime: regime.clone(),
            positive: bif.positive.clone(),
            negative: bif.negative.clone(),
            reason: reason.to_string(),
        };
        let ctx = || format!("bifurcation [{}]/[{}]", bif.positive, bif.negative);
        if bif.positive == bif.negative {
            return Err(invalid("targets must be two distinct boxes"));
        }
        for target in [&bif.positive, &bif.negative] {
            let b = &def.boxes[known(&ctx, target)?];
            if !matches!(b.kind, BoxKind::Derived { formula: None }) {
                return Err(invalid(&format!(
                    "[{target}] must be a derived box without its own formula"
                )));
            }
            if split_of.insert(target.clone(), n).is_some() {
                return Err(invalid(&format!("[{target}] is already a bifurcation target")));
            }
        }
        for r in bif.base.refs() {
            known(&ctx, r)?;
        }
    }

    // deps[i]: boxes read to compute box i
    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); def.boxes.len()];
    for (i, b) in def.boxes.iter().enumerate() {
        let ctx = || format!("formula of [{}]", b.id);
        let refs = match &b.kind {
            BoxKind::Raw { .. } => continue,
            BoxKind::Derived { formula: Some(f) } => f.refs(),
            BoxKind::Derived { formula: None } => match split_of.get(&b.id) {
                Some(&n) => def.bifurcations[n].base.refs(),
                None => {
                    return Err(SchemaError::MissingFormula {
                        regime: regime.clone(),
                        id: b.id.clone(),
                    })
                }
            },
        };
        for r in refs {
            deps[i].push(known(&ctx, r)?);
        }
    }

    if let Some(cycle) = find_cycle(&deps) {
        let path = cycle
            .iter()
            .map(|&i| format!("[{}]", def.boxes[i].id))
            .collect::<Vec<_>>()
            .join(" -> ");
        return Err(SchemaError::Cycle { regime: regime.clone(), path });
    }

    // Both targets of a bifurcation are produced together, at the earlier one.
    let produced_at = |i: usize| -> usize {
        match split_of.get(&def.boxes[i].id) {
            Some(&n) => {
                let bif = &def.bifurcations[n];
                index[&bif.positive].min(index[&bif.negative])
            }
            None => i,
        }
    };
    for (i, ds) in deps.iter().enumerate() {
        let at = produced_at(i);
        if let Some(&later) = ds.iter().find(|&&d| produced_at(d) >= at) {
            return Err(SchemaError::ForwardReference {
                regime: regime.clone(),
                from: def.boxes[i].id.clone(),
                to: def.boxes[later].id.clone(),
            });
        }
    }

    if let Some(id) = &def.carry_in {
        let ctx = || "carry-in".to_string();
        if !def.boxes[known(&ctx, id)?].is_raw() {
            return Err(SchemaError::InvalidCarry {
                regime: regime.clone(),
                id: id.clone(),
                reason: "carry-in box must be a raw box".to_string(),
            });
        }
    }
    if let Some(id) = &def.carry_out {
        known(&|| "carry-out".to_string(), id)?;
        if def.carry_in.as_ref() == Some(id) {
            return Err(SchemaError::InvalidCarry {
                regime: regime.clone(),
                id: id.clone(),
                reason: "carry-out box cannot also be the carry-in box".to_string(),
            });
        }
    }

    for (n, check) in def.checks.iter().enumerate() {
        let ctx = || format!("check #{} ({})", n + 1, check.message);
        for r in check.lhs.refs().into_iter().chain(check.rhs.refs()) {
            known(&ctx, r)?;
        }
    }

    let mut fed: HashSet<&BoxId> = HashSet::new();
    for link in &def.schedules {
        let invalid = |reason: String| SchemaError::InvalidSchedule {
            regime: regime.clone(),
            schedule: link.schedule.clone(),
            reason,
        };
        if link.schedule == regime {
            return Err(invalid("a regime cannot be its own schedule".to_string()));
        }
        let target = &def.boxes[known(&|| format!("schedule {}", link.schedule), &link.target)?];
        if !target.is_raw() {
            return Err(invalid(format!("target [{}] must be a raw box", target.id)));
        }
        if def.carry_in.as_ref() == Some(&target.id) || !fed.insert(&target.id) {
            return Err(invalid(format!("target [{}] already has a source", target.id)));
        }
    }

    log::debug!(
        "validated schema {}: {} boxes, {} bifurcations",
        regime,
        def.boxes.len(),
        def.bifurcations.len()
    );

    Ok(RegimeSchema {
        def,
        index,
        split_of,
    })
}

/// Returns the nodes of one cycle (first node repeated at the end), if any.
fn find_cycle(deps: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    fn visit(
        node: usize,
        deps: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::Active;
        stack.push(node);
        for &d in &deps[node] {
            match marks[d] {
                Mark::Active => {
                    let start = stack.iter().position(|&n| n == d).unwrap_or(0);
                    let mut path = stack[start..].to_vec();
                    path.push(d);
                    return Some(path);
                }
                Mark::New => {
                    if let Some(path) = visit(d, deps, marks, stack) {
                        return Some(path);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; deps.len()];
    let mut stack = Vec::new();
    (0..deps.len()).find_map(|n| {
        if marks[n] == Mark::New {
            visit(n, deps, &mut marks, &mut stack)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expr::bx;

    fn def(boxes: Vec<BoxDef>, bifurcations: Vec<Bifurcation>) -> SchemaDef {
        SchemaDef {
            regime: RegimeId::from("test"),
            title: "Test".to_string(),
            boxes,
            bifurcations,
            carry_in: None,
            carry_out: None,
            checks: Vec::new(),
            schedules: Vec::new(),
        }
    }

    fn validate_err(d: SchemaDef) -> SchemaError {
        RegimeSchema::try_from(d).unwrap_err()
    }

    #[test]
    fn valid_linear_schema() {
        let schema = RegimeSchema::try_from(def(
            vec![
                BoxDef::raw("a", "A"),
                BoxDef::optional("b", "B"),
                BoxDef::derived("c", "C", bx("a") + bx("b")),
            ],
            vec![],
        ))
        .unwrap();
        assert_eq!(schema.boxes().len(), 3);
        assert!(schema.get("b").unwrap().is_raw());
        assert!(schema.get("zzz").is_none());
    }

    #[test]
    fn duplicate_box_rejected() {
        let err = validate_err(def(
            vec![BoxDef::raw("a", "A"), BoxDef::raw("a", "A again")],
            vec![],
        ));
        assert!(matches!(err, SchemaError::DuplicateBox { ref id, .. } if id.as_str() == "a"));
    }

    #[test]
    fn unknown_reference_rejected() {
        let err = validate_err(def(
            vec![
                BoxDef::raw("a", "A"),
                BoxDef::derived("c", "C", bx("a") + bx("nope")),
            ],
            vec![],
        ));
        assert_eq!(
            err,
            SchemaError::UnknownBox {
                regime: RegimeId::from("test"),
                context: "formula of [c]".to_string(),
                id: BoxId::from("nope"),
            }
        );
    }

    #[test]
    fn cycle_rejected_with_path() {
        let err = validate_err(def(
            vec![
                BoxDef::raw("a", "A"),
                BoxDef::derived("x", "X", bx("a") + bx("y")),
                BoxDef::derived("y", "Y", bx("x")),
            ],
            vec![],
        ));
        match err {
            SchemaError::Cycle { path, .. } => assert_eq!(path, "[x] -> [y] -> [x]"),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let err = validate_err(def(
            vec![BoxDef::derived("x", "X", bx("x") + bx("x"))],
            vec![],
        ));
        assert!(matches!(err, SchemaError::Cycle { .. }));
    }

    #[test]
    fn forward_reference_rejected() {
        let err = validate_err(def(
            vec![
                BoxDef::derived("c", "C", bx("a")),
                BoxDef::raw("a", "A"),
            ],
            vec![],
        ));
        assert_eq!(
            err,
            SchemaError::ForwardReference {
                regime: RegimeId::from("test"),
                from: BoxId::from("c"),
                to: BoxId::from("a"),
            }
        );
    }

    #[test]
    fn bifurcation_targets_must_be_formula_less_derived_boxes() {
        let err = validate_err(def(
            vec![
                BoxDef::raw("a", "A"),
                BoxDef::raw("p", "P"),
                BoxDef::split("n", "N"),
            ],
            vec![Bifurcation::new(bx("a"), "p", "n")],
        ));
        assert!(matches!(err, SchemaError::InvalidBifurcation { .. }));

        let err = validate_err(def(
            vec![
                BoxDef::raw("a", "A"),
                BoxDef::derived("p", "P", bx("a")),
                BoxDef::split("n", "N"),
            ],
            vec![Bifurcation::new(bx("a"), "p", "n")],
        ));
        assert!(matches!(err, SchemaError::InvalidBifurcation { .. }));
    }

    #[test]
    fn bifurcation_target_cannot_be_shared() {
        let err = validate_err(def(
            vec![
                BoxDef::raw("a", "A"),
                BoxDef::split("p", "P"),
                BoxDef::split("n", "N"),
                BoxDef::split("m", "M"),
            ],
            vec![
                Bifurcation::new(bx("a"), "p", "n"),
                Bifurcation::new(bx("a"), "p", "m"),
            ],
        ));
        assert!(matches!(err, SchemaError::InvalidBifurcation { .. }));
    }

    #[test]
    fn split_box_without_bifurcation_rejected() {
        let err = validate_err(def(
            vec![BoxDef::raw("a", "A"), BoxDef::split("p", "P")],
            vec![],
        ));
        assert!(matches!(err, SchemaError::MissingFormula { .. }));
    }

    #[test]
    fn bifurcation_base_must_precede_targets() {
        let err = validate_err(def(
            vec![
                BoxDef::split("p", "P"),
                BoxDef::split("n", "N"),
                BoxDef::raw("a", "A"),
            ],
            vec![Bifurcation::new(bx("a"), "p", "n")],
        ));
        assert!(matches!(err, SchemaError::ForwardReference { .. }));
    }

    #[test]
    fn box_between_targets_may_read_the_later_target() {
        let schema = RegimeSchema::try_from(def(
            vec![
                BoxDef::raw("a", "A"),
                BoxDef::split("p", "P"),
                BoxDef::derived("mid", "Mid", bx("n")),
                BoxDef::split("n", "N"),
            ],
            vec![Bifurcation::new(bx("a"), "p", "n")],
        ));
        assert!(schema.is_ok());
    }

    #[test]
    fn carry_in_must_be_raw() {
        let mut d = def(
            vec![
                BoxDef::raw("a", "A"),
                BoxDef::derived("c", "C", bx("a")),
            ],
            vec![],
        );
        d.carry_in = Some(BoxId::from("c"));
        assert!(matches!(validate_err(d), SchemaError::InvalidCarry { .. }));
    }

    #[test]
    fn carry_out_must_exist() {
        let mut d = def(vec![BoxDef::raw("a", "A")], vec![]);
        d.carry_out = Some(BoxId::from("z"));
        assert!(matches!(validate_err(d), SchemaError::UnknownBox { .. }));
    }

    #[test]
    fn schedule_target_must_be_raw() {
        let mut d = def(
            vec![
                BoxDef::raw("a", "A"),
                BoxDef::derived("c", "C", bx("a")),
            ],
            vec![],
        );
        d.schedules.push(ScheduleLink {
            schedule: RegimeId::from("sub"),
            source: BoxId::from("19"),
            target: BoxId::from("c"),
        });
        assert!(matches!(validate_err(d), SchemaError::InvalidSchedule { .. }));
    }

    #[test]
    fn schema_def_json_round_trip() {
        let d = def(
            vec![
                BoxDef::optional("a", "A").section("I"),
                BoxDef::derived("c", "C", bx("a")).note("alias"),
            ],
            vec![],
        );
        let json = serde_json::to_string(&d).unwrap();
        let back: SchemaDef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
