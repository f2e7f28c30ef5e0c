//! Evaluation engine: a pure function from (schema, raw inputs, prior carry)
//! to the value of every box.

use super::expr::{BoxId, Fault};
use super::schema::{BoxKind, CheckOp, RegimeId, RegimeSchema, Unit};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// Declared figures for one period, keyed by RAW box id.
pub type RawInput = BTreeMap<BoxId, Decimal>;

/// A computed box with its static metadata for the rendering layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BoxLine {
    pub id: BoxId,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default)]
    pub unit: Unit,
    #[schemars(with = "f64")]
    pub value: Decimal,
}

/// Every box of one evaluated return, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BoxValues {
    pub regime: RegimeId,
    pub lines: Vec<BoxLine>,
    /// Value of the schema's designated carry-forward box
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub carry_forward: Option<Decimal>,
}

impl BoxValues {
    pub fn get(&self, id: &str) -> Option<Decimal> {
        self.lines
            .iter()
            .find(|l| l.id.as_str() == id)
            .map(|l| l.value)
    }

    pub fn to_map(&self) -> BTreeMap<BoxId, Decimal> {
        self.lines.iter().map(|l| (l.id.clone(), l.value)).collect()
    }

    /// Hex SHA-256 over the normalized box values.
    ///
    /// `1.0` and `1` hash the same; labels do not take part.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.regime.as_str().as_bytes());
        for line in &self.lines {
            hasher.update(b"\n");
            hasher.update(line.id.as_str().as_bytes());
            hasher.update(b"=");
            hasher.update(line.value.normalize().to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("{regime}: no value supplied for box [{box_id}] ({label})")]
    MissingInput {
        regime: RegimeId,
        box_id: BoxId,
        label: String,
    },
    #[error("{regime}: [{box_id}] is not a raw input box of this return")]
    UnknownInput { regime: RegimeId, box_id: BoxId },
    #[error("{regime}: carry-in box [{box_id}] supplied as {supplied} but the prior period carried {carried}")]
    CarryConflict {
        regime: RegimeId,
        box_id: BoxId,
        supplied: Decimal,
        carried: Decimal,
    },
    #[error("{regime}: prior carry {carried} given but the return has no carry-in box")]
    UnexpectedCarry { regime: RegimeId, carried: Decimal },
    #[error("{regime}: box [{box_id}] could not be computed: {reason}")]
    Computation {
        regime: RegimeId,
        box_id: BoxId,
        reason: String,
    },
    #[error("{regime}: {message} ({lhs} {op} {rhs} does not hold)")]
    CheckFailed {
        regime: RegimeId,
        message: String,
        lhs: Decimal,
        op: CheckOp,
        rhs: Decimal,
    },
    #[error("{regime}: box [{box_id}] overflows, check the magnitude of the amounts supplied")]
    Overflow { regime: RegimeId, box_id: BoxId },
    #[error("regime {0} is not registered")]
    UnknownRegime(RegimeId),
    #[error("{regime}: {schedule} is not a schedule of this return")]
    UnlinkedSchedule { regime: RegimeId, schedule: RegimeId },
    #[error("{regime}: box [{box_id}] supplied as {supplied} but schedule {schedule} computes {fed}")]
    ScheduleConflict {
        regime: RegimeId,
        schedule: RegimeId,
        box_id: BoxId,
        supplied: Decimal,
        fed: Decimal,
    },
}

impl EvalError {
    /// Engine defects as opposed to problems with the supplied data.
    pub fn is_defect(&self) -> bool {
        matches!(self, EvalError::Computation { .. })
    }
}

fn computation(schema: &RegimeSchema, box_id: &BoxId, reason: String) -> EvalError {
    let err = EvalError::Computation {
        regime: schema.regime().clone(),
        box_id: box_id.clone(),
        reason,
    };
    log::error!("{err}");
    err
}

/// Overflow comes from oversized amounts in the inputs; other faults mean the
/// schema or the engine is broken.
fn fault_error(schema: &RegimeSchema, box_id: &BoxId, fault: Fault) -> EvalError {
    let reason = match fault {
        Fault::Overflow => {
            return EvalError::Overflow {
                regime: schema.regime().clone(),
                box_id: box_id.clone(),
            }
        }
        Fault::Unresolved(id) => format!("dependency [{id}] has no value"),
        Fault::Empty => "empty max/min".to_string(),
    };
    computation(schema, box_id, reason)
}

/// Split a signed base into `(max(base, 0), max(-base, 0))`.
pub fn bifurcate(base: Decimal) -> (Decimal, Decimal) {
    if base.is_zero() {
        (Decimal::ZERO, Decimal::ZERO)
    } else if base.is_sign_negative() {
        (Decimal::ZERO, -base)
    } else {
        (base, Decimal::ZERO)
    }
}

/// Evaluate `schema` against `raw` with the prior period's carry value.
///
/// Raw boxes are resolved first (supplied value, else declared default, else
/// [`EvalError::MissingInput`]). The prior carry is injected into the carry-in
/// box. Derived boxes are then computed in declaration order; each
/// bifurcation computes its base once and assigns both targets.
pub fn evaluate(
    schema: &RegimeSchema,
    raw: &RawInput,
    prior_carry: Decimal,
) -> Result<BoxValues, EvalError> {
    let regime = schema.regime();

    for id in raw.keys() {
        if !schema.get(id.as_str()).is_some_and(|b| b.is_raw()) {
            return Err(EvalError::UnknownInput {
                regime: regime.clone(),
                box_id: id.clone(),
            });
        }
    }

    let mut values: HashMap<BoxId, Decimal> = HashMap::with_capacity(schema.boxes().len());

    match schema.carry_in() {
        Some(id) => {
            if let Some(&supplied) = raw.get(id) {
                if supplied != prior_carry {
                    return Err(EvalError::CarryConflict {
                        regime: regime.clone(),
                        box_id: id.clone(),
                        supplied,
                        carried: prior_carry,
                    });
                }
            }
            values.insert(id.clone(), prior_carry);
        }
        None if !prior_carry.is_zero() => {
            return Err(EvalError::UnexpectedCarry {
                regime: regime.clone(),
                carried: prior_carry,
            })
        }
        None => {}
    }

    for b in schema.boxes() {
        if let BoxKind::Raw { default } = &b.kind {
            if values.contains_key(&b.id) {
                continue;
            }
            let value = raw.get(&b.id).copied().or(*default).ok_or_else(|| {
                EvalError::MissingInput {
                    regime: regime.clone(),
                    box_id: b.id.clone(),
                    label: b.label.clone(),
                }
            })?;
            values.insert(b.id.clone(), value);
        }
    }

    for b in schema.boxes() {
        let BoxKind::Derived { formula } = &b.kind else {
            continue;
        };
        match formula {
            Some(f) => {
                let value = f
                    .eval(&|id: &BoxId| values.get(id).copied())
                    .map_err(|f| fault_error(schema, &b.id, f))?;
                values.insert(b.id.clone(), value);
            }
            None => {
                // already produced together with its partner
                if values.contains_key(&b.id) {
                    continue;
                }
                let bif = schema.bifurcation_for(b.id.as_str()).ok_or_else(|| {
                    computation(schema, &b.id, "no bifurcation fills this box".to_string())
                })?;
                let base = bif
                    .base
                    .eval(&|id: &BoxId| values.get(id).copied())
                    .map_err(|f| fault_error(schema, &b.id, f))?;
                let (positive, negative) = bifurcate(base);
                log::trace!(
                    "{regime}: base {base} -> [{}]={positive}, [{}]={negative}",
                    bif.positive,
                    bif.negative
                );
                values.insert(bif.positive.clone(), positive);
                values.insert(bif.negative.clone(), negative);
            }
        }
    }

    for check in schema.checks() {
        let lookup = |id: &BoxId| values.get(id).copied();
        let side = |e: &super::expr::Expr| {
            e.eval(&lookup).map_err(|f| {
                let at = e
                    .refs()
                    .first()
                    .map(|id| (*id).clone())
                    .unwrap_or_else(|| BoxId::from("?"));
                fault_error(schema, &at, f)
            })
        };
        let (lhs, rhs) = (side(&check.lhs)?, side(&check.rhs)?);
        if !check.holds(lhs, rhs) {
            return Err(EvalError::CheckFailed {
                regime: regime.clone(),
                message: check.message.clone(),
                lhs,
                op: check.op,
                rhs,
            });
        }
    }

    let lines = schema
        .boxes()
        .iter()
        .map(|b| {
            let value = values.get(&b.id).copied().ok_or_else(|| {
                computation(schema, &b.id, "box was never produced".to_string())
            })?;
            Ok(BoxLine {
                id: b.id.clone(),
                label: b.label.clone(),
                section: b.section.clone(),
                unit: b.unit,
                value,
            })
        })
        .collect::<Result<Vec<_>, EvalError>>()?;

    let carry_forward = schema.carry_out().and_then(|id| values.get(id).copied());

    log::debug!(
        "evaluated {regime}: {} boxes, prior carry {prior_carry}, carry forward {:?}",
        lines.len(),
        carry_forward
    );

    Ok(BoxValues {
        regime: regime.clone(),
        lines,
        carry_forward,
    })
}
