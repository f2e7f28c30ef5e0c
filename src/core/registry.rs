use super::engine::{self, BoxValues, EvalError, RawInput};
use super::regimes;
use super::schema::{RegimeId, RegimeSchema, ScheduleLink, SchemaDef, SchemaError};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A return evaluated together with its supplementary schedules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Filing {
    pub main: BoxValues,
    #[serde(default)]
    pub schedules: Vec<BoxValues>,
}

/// Registered regime schemas, looked up by id.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<RegimeId, Arc<RegimeSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the VAT, PIT, CIT and CIT-03-1A schemas.
    pub fn with_builtin() -> Result<Self, SchemaError> {
        let mut registry = Self::new();
        for def in regimes::builtin() {
            registry.register(def)?;
        }
        Ok(registry)
    }

    /// Validate and add a regime. Linked schedules must already be registered.
    pub fn register(&mut self, def: SchemaDef) -> Result<(), SchemaError> {
        if self.schemas.contains_key(&def.regime) {
            return Err(SchemaError::AlreadyRegistered(def.regime));
        }
        self.insert(def)
    }

    /// Swap the schema of an already registered regime, e.g. a new form year.
    pub fn replace(&mut self, def: SchemaDef) -> Result<(), SchemaError> {
        if !self.schemas.contains_key(&def.regime) {
            return Err(SchemaError::NotRegistered(def.regime));
        }
        self.insert(def)
    }

    fn insert(&mut self, def: SchemaDef) -> Result<(), SchemaError> {
        let schema = RegimeSchema::try_from(def)?;
        for link in schema.schedules() {
            let schedule = self.schemas.get(&link.schedule).ok_or_else(|| {
                SchemaError::InvalidSchedule {
                    regime: schema.regime().clone(),
                    schedule: link.schedule.clone(),
                    reason: "schedule regime is not registered".to_string(),
                }
            })?;
            check_link(schema.regime(), link, schedule)?;
        }
        // a replaced schedule must still satisfy the returns that link it
        for parent in self.schemas.values() {
            if parent.regime() == schema.regime() {
                continue;
            }
            for link in parent.schedules() {
                if &link.schedule == schema.regime() {
                    check_link(parent.regime(), link, &schema)?;
                }
            }
        }
        log::info!(
            "registered regime {} ({} boxes)",
            schema.regime(),
            schema.boxes().len()
        );
        self.schemas
            .insert(schema.regime().clone(), Arc::new(schema));
        Ok(())
    }

    pub fn get(&self, regime: &str) -> Option<Arc<RegimeSchema>> {
        self.schemas.get(regime).cloned()
    }

    pub fn require(&self, regime: &str) -> Result<Arc<RegimeSchema>, EvalError> {
        self.get(regime)
            .ok_or_else(|| EvalError::UnknownRegime(RegimeId::from(regime)))
    }

    /// Registered regime ids, sorted.
    pub fn regimes(&self) -> Vec<&RegimeId> {
        let mut ids: Vec<_> = self.schemas.keys().collect();
        ids.sort();
        ids
    }

    pub fn evaluate(
        &self,
        regime: &str,
        raw: &RawInput,
        prior_carry: Decimal,
    ) -> Result<BoxValues, EvalError> {
        let schema = self.require(regime)?;
        engine::evaluate(&schema, raw, prior_carry)
    }

    /// Evaluate each supplied schedule, feed its linked box into the main
    /// return's raw inputs, then evaluate the main return.
    ///
    /// A schedule that is linked but not supplied leaves the target box to
    /// the caller's raw inputs.
    pub fn evaluate_with_schedules(
        &self,
        regime: &str,
        raw: &RawInput,
        schedule_inputs: &BTreeMap<RegimeId, RawInput>,
        prior_carry: Decimal,
    ) -> Result<Filing, EvalError> {
        let schema = self.require(regime)?;

        if let Some(unlinked) = schedule_inputs
            .keys()
            .find(|id| !schema.schedules().iter().any(|l| &l.schedule == *id))
        {
            return Err(EvalError::UnlinkedSchedule {
                regime: schema.regime().clone(),
                schedule: unlinked.clone(),
            });
        }

        let mut raw = raw.clone();
        let mut schedules = Vec::new();
        for link in schema.schedules() {
            let Some(inputs) = schedule_inputs.get(&link.schedule) else {
                continue;
            };
            let values = self.evaluate(link.schedule.as_str(), inputs, Decimal::ZERO)?;
            let fed = values.get(link.source.as_str()).ok_or_else(|| EvalError::Computation {
                regime: link.schedule.clone(),
                box_id: link.source.clone(),
                reason: "linked source box missing from schedule result".to_string(),
            })?;
            match raw.get(&link.target) {
                Some(&supplied) if supplied != fed => {
                    return Err(EvalError::ScheduleConflict {
                        regime: schema.regime().clone(),
                        schedule: link.schedule.clone(),
                        box_id: link.target.clone(),
                        supplied,
                        fed,
                    })
                }
                _ => {
                    raw.insert(link.target.clone(), fed);
                }
            }
            log::debug!(
                "{} [{}] = {} fed from {} [{}]",
                schema.regime(),
                link.target,
                fed,
                link.schedule,
                link.source
            );
            schedules.push(values);
        }

        let main = engine::evaluate(&schema, &raw, prior_carry)?;
        Ok(Filing { main, schedules })
    }
}

/// `link` of `regime` must name a declared box of `schedule`, which may not
/// link schedules of its own.
fn check_link(
    regime: &RegimeId,
    link: &ScheduleLink,
    schedule: &RegimeSchema,
) -> Result<(), SchemaError> {
    let invalid = |reason: String| SchemaError::InvalidSchedule {
        regime: regime.clone(),
        schedule: link.schedule.clone(),
        reason,
    };
    if schedule.get(link.source.as_str()).is_none() {
        return Err(invalid(format!(
            "source box [{}] is not declared by the schedule",
            link.source
        )));
    }
    if !schedule.schedules().is_empty() {
        return Err(invalid("schedules cannot link schedules of their own".to_string()));
    }
    Ok(())
}
