//! Period chains: the ordered filing periods of one taxpayer under one regime.
//!
//! The designated carry-forward box of a locked period becomes the carry-in
//! box of the next period. Each chain is guarded by its own mutex; writers
//! that find the chain busy fail with [`ChainError::Conflict`] instead of
//! waiting.

use super::engine::{self, BoxValues, EvalError, RawInput};
use super::expr::BoxId;
use super::label::{Granularity, PeriodLabel};
use super::registry::SchemaRegistry;
use super::schema::{RegimeId, RegimeSchema};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};

/// `<taxpayer>/<regime>/<label>`, unique because labels are unique per chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeriodId {
    taxpayer_id: String,
    regime: RegimeId,
    label: PeriodLabel,
}

impl PeriodId {
    pub fn new(taxpayer_id: &str, regime: &RegimeId, label: PeriodLabel) -> Self {
        PeriodId {
            taxpayer_id: taxpayer_id.to_string(),
            regime: regime.clone(),
            label,
        }
    }

    pub fn taxpayer_id(&self) -> &str {
        &self.taxpayer_id
    }

    pub fn regime(&self) -> &RegimeId {
        &self.regime
    }

    pub fn label(&self) -> PeriodLabel {
        self.label
    }

    fn chain_key(&self) -> ChainKey {
        (self.taxpayer_id.clone(), self.regime.clone())
    }
}

impl fmt::Display for PeriodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.taxpayer_id, self.regime, self.label)
    }
}

impl FromStr for PeriodId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid period id '{s}', expected <taxpayer>/<regime>/<label>");
        let (taxpayer, rest) = s.split_once('/').ok_or_else(invalid)?;
        let (regime, label) = rest.rsplit_once('/').ok_or_else(invalid)?;
        if taxpayer.is_empty() || regime.is_empty() {
            return Err(invalid());
        }
        let label = label.parse().map_err(|e| format!("{e}"))?;
        Ok(PeriodId::new(taxpayer, &RegimeId::from(regime), label))
    }
}

impl TryFrom<String> for PeriodId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeriodId> for String {
    fn from(id: PeriodId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeriodStatus {
    Open,
    Locked,
    Amended,
}

impl PeriodStatus {
    /// Raw inputs may change in this state
    pub fn is_editable(&self) -> bool {
        !matches!(self, PeriodStatus::Locked)
    }
}

impl fmt::Display for PeriodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeriodStatus::Open => "OPEN",
            PeriodStatus::Locked => "LOCKED",
            PeriodStatus::Amended => "AMENDED",
        };
        f.write_str(s)
    }
}

/// One filing period of a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaxPeriod {
    #[schemars(with = "String")]
    pub id: PeriodId,
    pub taxpayer_id: String,
    pub regime: RegimeId,
    #[schemars(with = "String")]
    pub label: PeriodLabel,
    pub status: PeriodStatus,
    #[schemars(with = "BTreeMap<BoxId, f64>")]
    pub raw_inputs: RawInput,
    #[serde(default)]
    pub computed_snapshot: Option<BoxValues>,
    /// Hex SHA-256 of `computed_snapshot`
    #[serde(default)]
    pub snapshot_digest: Option<String>,
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub carry_forward_value: Option<Decimal>,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub prior: Option<PeriodId>,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub next: Option<PeriodId>,
    /// An earlier period was amended; must be closed again before it is trusted
    #[serde(default)]
    pub stale: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub amendments: u32,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ChainError {
    #[error("chain {taxpayer_id}/{regime} is being modified by another writer, retry")]
    Conflict {
        taxpayer_id: String,
        regime: RegimeId,
    },
    #[error("cannot reopen {id}: its carry was consumed by locked period {successor}, reopen with cascade to amend both")]
    Amendment { id: PeriodId, successor: PeriodId },
    #[error("prior period {prior} is {status}, close it first")]
    PriorNotLocked {
        prior: PeriodId,
        status: PeriodStatus,
    },
    #[error("prior period {0} is stale after an amendment, close it again first")]
    PriorStale(PeriodId),
    #[error("period {0} not found")]
    NotFound(PeriodId),
    #[error("period {0} is locked, reopen it to amend")]
    Locked(PeriodId),
    #[error("period {id} is {status}, only locked periods can be reopened")]
    NotLocked { id: PeriodId, status: PeriodStatus },
    #[error("period {0} already exists")]
    DuplicateLabel(PeriodId),
    #[error("period {label} does not follow the latest period {latest}")]
    OutOfOrder {
        label: PeriodLabel,
        latest: PeriodLabel,
    },
    #[error("period {label} is not {expected} like the rest of the chain")]
    GranularityMismatch {
        label: PeriodLabel,
        expected: Granularity,
    },
    #[error("carry-in box [{box_id}] is managed by the chain: supplied {supplied}, carried {carried}")]
    CarryBoxReadOnly {
        box_id: BoxId,
        supplied: Decimal,
        carried: Decimal,
    },
    #[error("regime {0} is not registered")]
    UnknownRegime(RegimeId),
    #[error("invalid taxpayer id '{0}'")]
    InvalidTaxpayer(String),
    #[error("locked period {0} re-evaluates to a different snapshot")]
    SnapshotMismatch(PeriodId),
    #[error("period {id} is inconsistent: {reason}")]
    Corrupt { id: PeriodId, reason: String },
    #[error(transparent)]
    Eval(#[from] EvalError),
}

impl ChainError {
    /// Another writer held the chain; the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::Conflict { .. })
    }
}

type ChainKey = (String, RegimeId);

/// Periods of one chain ordered by label.
#[derive(Debug, Default)]
struct Chain {
    periods: Vec<TaxPeriod>,
}

impl Chain {
    fn position(&self, id: &PeriodId) -> Result<usize, ChainError> {
        self.periods
            .iter()
            .position(|p| &p.id == id)
            .ok_or_else(|| ChainError::NotFound(id.clone()))
    }

    /// Carry the period at `idx` starts from, requiring a trusted prior.
    fn prior_carry(&self, idx: usize) -> Result<Decimal, ChainError> {
        let Some(prior) = idx.checked_sub(1).map(|i| &self.periods[i]) else {
            return Ok(Decimal::ZERO);
        };
        if prior.status != PeriodStatus::Locked {
            return Err(ChainError::PriorNotLocked {
                prior: prior.id.clone(),
                status: prior.status,
            });
        }
        if prior.stale {
            return Err(ChainError::PriorStale(prior.id.clone()));
        }
        Ok(prior.carry_forward_value.unwrap_or(Decimal::ZERO))
    }
}

/// Set the carry-in box of `raw` to `carried`. A different supplied value is
/// rejected; the carry-in box only ever holds the prior period's carry.
fn inject_carry(
    schema: &RegimeSchema,
    raw: &mut RawInput,
    carried: Decimal,
) -> Result<(), ChainError> {
    let Some(carry_in) = schema.carry_in() else {
        return Ok(());
    };
    if let Some(&supplied) = raw.get(carry_in) {
        if supplied != carried {
            return Err(ChainError::CarryBoxReadOnly {
                box_id: carry_in.clone(),
                supplied,
                carried,
            });
        }
    }
    raw.insert(carry_in.clone(), carried);
    Ok(())
}

fn check_inputs(schema: &RegimeSchema, raw: &RawInput) -> Result<(), ChainError> {
    match raw
        .keys()
        .find(|id| !schema.get(id.as_str()).is_some_and(|b| b.is_raw()))
    {
        Some(id) => Err(EvalError::UnknownInput {
            regime: schema.regime().clone(),
            box_id: id.clone(),
        }
        .into()),
        None => Ok(()),
    }
}

fn validate_taxpayer(taxpayer_id: &str) -> Result<(), ChainError> {
    if taxpayer_id.is_empty()
        || taxpayer_id.contains('/')
        || taxpayer_id.chars().any(char::is_whitespace)
    {
        return Err(ChainError::InvalidTaxpayer(taxpayer_id.to_string()));
    }
    Ok(())
}

/// Owns every period chain and serializes writers per chain.
pub struct PeriodChainManager {
    registry: Arc<SchemaRegistry>,
    chains: RwLock<HashMap<ChainKey, Arc<Mutex<Chain>>>>,
}

impl PeriodChainManager {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        PeriodChainManager {
            registry,
            chains: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild chains from persisted periods, checking labels, links and
    /// snapshot digests.
    pub fn from_periods(
        registry: Arc<SchemaRegistry>,
        periods: Vec<TaxPeriod>,
    ) -> Result<Self, ChainError> {
        let mut grouped: HashMap<ChainKey, Vec<TaxPeriod>> = HashMap::new();
        for period in periods {
            if registry.get(period.regime.as_str()).is_none() {
                return Err(ChainError::UnknownRegime(period.regime));
            }
            let expected = PeriodId::new(&period.taxpayer_id, &period.regime, period.label);
            if period.id != expected {
                return Err(ChainError::Corrupt {
                    reason: format!("id does not match {expected}"),
                    id: period.id,
                });
            }
            grouped
                .entry(period.id.chain_key())
                .or_default()
                .push(period);
        }

        let mut chains = HashMap::with_capacity(grouped.len());
        for (key, mut periods) in grouped {
            let schema = registry
                .get(key.1.as_str())
                .ok_or_else(|| ChainError::UnknownRegime(key.1.clone()))?;
            periods.sort_by(|a, b| a.label.cmp(&b.label));
            for (idx, period) in periods.iter().enumerate() {
                let corrupt = |reason: &str| ChainError::Corrupt {
                    id: period.id.clone(),
                    reason: reason.to_string(),
                };
                let prior = idx.checked_sub(1).map(|i| &periods[i]);
                let next = periods.get(idx + 1);
                if let Some(prior) = prior {
                    if prior.label == period.label {
                        return Err(ChainError::DuplicateLabel(period.id.clone()));
                    }
                    if prior.label.granularity() != period.label.granularity() {
                        return Err(ChainError::GranularityMismatch {
                            label: period.label,
                            expected: prior.label.granularity(),
                        });
                    }
                }
                if period.prior.as_ref() != prior.map(|p| &p.id) {
                    return Err(corrupt("prior link does not match the chain"));
                }
                if period.next.as_ref() != next.map(|p| &p.id) {
                    return Err(corrupt("next link does not match the chain"));
                }
                if period.status == PeriodStatus::Locked {
                    let snapshot = period
                        .computed_snapshot
                        .as_ref()
                        .ok_or_else(|| corrupt("locked without a snapshot"))?;
                    if period.snapshot_digest.as_deref() != Some(snapshot.digest().as_str()) {
                        return Err(ChainError::SnapshotMismatch(period.id.clone()));
                    }
                    if period.carry_forward_value != snapshot.carry_forward {
                        return Err(corrupt("carry forward differs from the snapshot"));
                    }
                }
                let Some(carry_in) = schema.carry_in() else {
                    continue;
                };
                match prior {
                    Some(prior) if prior.status == PeriodStatus::Locked => {
                        let carried = prior.carry_forward_value.unwrap_or(Decimal::ZERO);
                        if period.raw_inputs.get(carry_in) != Some(&carried) {
                            return Err(corrupt("carry-in differs from the prior carry forward"));
                        }
                    }
                    Some(_) if period.status == PeriodStatus::Locked => {
                        return Err(corrupt("locked on top of a prior that is not locked"));
                    }
                    _ => {}
                }
            }
            log::debug!("loaded chain {}/{}: {} periods", key.0, key.1, periods.len());
            chains.insert(key, Arc::new(Mutex::new(Chain { periods })));
        }

        Ok(PeriodChainManager {
            registry,
            chains: RwLock::new(chains),
        })
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    fn schema(&self, regime: &str) -> Result<Arc<RegimeSchema>, ChainError> {
        self.registry
            .get(regime)
            .ok_or_else(|| ChainError::UnknownRegime(RegimeId::from(regime)))
    }

    fn chain(&self, key: &ChainKey) -> Option<Arc<Mutex<Chain>>> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn chain_or_insert(&self, key: ChainKey) -> Arc<Mutex<Chain>> {
        self.chains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .clone()
    }

    /// Take the chain for writing without waiting.
    fn acquire<'a>(
        chain: &'a Mutex<Chain>,
        key: &ChainKey,
    ) -> Result<MutexGuard<'a, Chain>, ChainError> {
        chain.try_lock().map_err(|e| {
            let reason = match e {
                TryLockError::WouldBlock => "held",
                TryLockError::Poisoned(_) => "poisoned",
            };
            log::warn!("chain {}/{} is {reason}", key.0, key.1);
            ChainError::Conflict {
                taxpayer_id: key.0.clone(),
                regime: key.1.clone(),
            }
        })
    }

    /// Open a new period at the end of the chain, carrying in the latest
    /// period's carry-forward value.
    pub fn create_period(
        &self,
        taxpayer_id: &str,
        regime: &str,
        label: PeriodLabel,
        raw: RawInput,
    ) -> Result<PeriodId, ChainError> {
        validate_taxpayer(taxpayer_id)?;
        let schema = self.schema(regime)?;
        check_inputs(&schema, &raw)?;

        let id = PeriodId::new(taxpayer_id, schema.regime(), label);
        let key = id.chain_key();
        let chain = self.chain_or_insert(key.clone());
        let mut chain = Self::acquire(&chain, &key)?;

        let carried = match chain.periods.last() {
            None => Decimal::ZERO,
            Some(latest) => {
                if chain.periods.iter().any(|p| p.label == label) {
                    return Err(ChainError::DuplicateLabel(id));
                }
                if latest.label.granularity() != label.granularity() {
                    return Err(ChainError::GranularityMismatch {
                        label,
                        expected: latest.label.granularity(),
                    });
                }
                if label.start_date() <= latest.label.end_date() {
                    return Err(ChainError::OutOfOrder {
                        label,
                        latest: latest.label,
                    });
                }
                if latest.label.next() != Some(label) {
                    log::warn!("{id}: gap after latest period {}", latest.label);
                }
                chain.prior_carry(chain.periods.len())?
            }
        };

        let mut raw = raw;
        inject_carry(&schema, &mut raw, carried)?;

        let prior = chain.periods.last().map(|p| p.id.clone());
        if let Some(latest) = chain.periods.last_mut() {
            latest.next = Some(id.clone());
        }
        chain.periods.push(TaxPeriod {
            id: id.clone(),
            taxpayer_id: taxpayer_id.to_string(),
            regime: schema.regime().clone(),
            label,
            status: PeriodStatus::Open,
            raw_inputs: raw,
            computed_snapshot: None,
            snapshot_digest: None,
            carry_forward_value: None,
            prior,
            next: None,
            stale: false,
            created_at: Utc::now(),
            locked_at: None,
            amendments: 0,
        });
        log::info!("{id}: opened with carry {carried}");
        Ok(id)
    }

    /// Replace the raw inputs of an editable period. The carry-in box stays
    /// at the carried value.
    pub fn update_inputs(&self, id: &PeriodId, raw: RawInput) -> Result<(), ChainError> {
        let schema = self.schema(id.regime().as_str())?;
        check_inputs(&schema, &raw)?;
        let key = id.chain_key();
        let chain = self
            .chain(&key)
            .ok_or_else(|| ChainError::NotFound(id.clone()))?;
        let mut chain = Self::acquire(&chain, &key)?;
        let idx = chain.position(id)?;

        let period = &chain.periods[idx];
        if !period.status.is_editable() {
            return Err(ChainError::Locked(id.clone()));
        }
        let carried = schema
            .carry_in()
            .and_then(|c| period.raw_inputs.get(c).copied())
            .unwrap_or(Decimal::ZERO);

        let mut raw = raw;
        inject_carry(&schema, &mut raw, carried)?;
        chain.periods[idx].raw_inputs = raw;
        log::debug!("{id}: inputs updated");
        Ok(())
    }

    /// Evaluate and lock a period.
    ///
    /// The prior period must be locked and not stale. Closing a locked period
    /// again succeeds only if it re-evaluates to the stored snapshot.
    pub fn close_period(&self, id: &PeriodId) -> Result<TaxPeriod, ChainError> {
        let schema = self.schema(id.regime().as_str())?;
        let key = id.chain_key();
        let chain = self
            .chain(&key)
            .ok_or_else(|| ChainError::NotFound(id.clone()))?;
        let mut chain = Self::acquire(&chain, &key)?;
        let idx = chain.position(id)?;
        let carried = chain.prior_carry(idx)?;

        let period = &chain.periods[idx];
        let mut raw = period.raw_inputs.clone();
        if let Some(carry_in) = schema.carry_in() {
            raw.insert(carry_in.clone(), carried);
        }
        let values = engine::evaluate(&schema, &raw, carried)?;
        let digest = values.digest();

        if period.status == PeriodStatus::Locked {
            return if period.snapshot_digest.as_deref() == Some(digest.as_str()) {
                log::debug!("{id}: already locked with the same snapshot");
                Ok(period.clone())
            } else {
                Err(ChainError::SnapshotMismatch(id.clone()))
            };
        }

        let carry_forward = values.carry_forward;
        let period = &mut chain.periods[idx];
        period.raw_inputs = raw;
        period.computed_snapshot = Some(values);
        period.snapshot_digest = Some(digest);
        period.carry_forward_value = carry_forward;
        period.status = PeriodStatus::Locked;
        period.stale = false;
        period.locked_at = Some(Utc::now());
        let locked = period.clone();

        // an editable successor always shows the carry it will start from
        if let (Some(next), Some(carry_in)) = (chain.periods.get_mut(idx + 1), schema.carry_in()) {
            if next.status.is_editable() {
                next.raw_inputs
                    .insert(carry_in.clone(), carry_forward.unwrap_or(Decimal::ZERO));
            }
        }

        log::info!(
            "{id}: locked, carry forward {}",
            carry_forward.map_or_else(|| "-".to_string(), |c| c.to_string())
        );
        Ok(locked)
    }

    /// Move a locked period back to AMENDED.
    ///
    /// A locked successor has consumed the old carry; without `cascade` this
    /// fails with [`ChainError::Amendment`]. Otherwise every later period is
    /// marked stale and locked ones are amended too. Regimes without a
    /// carry-in box reopen the one period and leave the rest of the chain.
    pub fn reopen_period(&self, id: &PeriodId, cascade: bool) -> Result<(), ChainError> {
        let schema = self.schema(id.regime().as_str())?;
        let key = id.chain_key();
        let chain = self
            .chain(&key)
            .ok_or_else(|| ChainError::NotFound(id.clone()))?;
        let mut chain = Self::acquire(&chain, &key)?;
        let idx = chain.position(id)?;

        let period = &chain.periods[idx];
        if period.status != PeriodStatus::Locked {
            return Err(ChainError::NotLocked {
                id: id.clone(),
                status: period.status,
            });
        }
        let carries = schema.carry_in().is_some();
        if let Some(successor) = chain.periods.get(idx + 1) {
            if carries && successor.status == PeriodStatus::Locked && !cascade {
                return Err(ChainError::Amendment {
                    id: id.clone(),
                    successor: successor.id.clone(),
                });
            }
        }

        let period = &mut chain.periods[idx];
        period.status = PeriodStatus::Amended;
        period.amendments += 1;
        if !carries {
            log::info!("{id}: reopened for amendment");
            return Ok(());
        }
        for downstream in &mut chain.periods[idx + 1..] {
            downstream.stale = true;
            if downstream.status == PeriodStatus::Locked {
                downstream.status = PeriodStatus::Amended;
                downstream.amendments += 1;
                log::warn!("{}: amended by cascade from {id}", downstream.id);
            }
        }
        log::info!("{id}: reopened for amendment");
        Ok(())
    }

    /// Periods of a chain from earliest to latest. Empty for an unknown chain.
    pub fn get_chain(&self, taxpayer_id: &str, regime: &str) -> Vec<TaxPeriod> {
        let key = (taxpayer_id.to_string(), RegimeId::from(regime));
        self.chain(&key)
            .map(|chain| {
                chain
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .periods
                    .clone()
            })
            .unwrap_or_default()
    }

    pub fn get_period(&self, id: &PeriodId) -> Option<TaxPeriod> {
        let chain = self.chain(&id.chain_key())?;
        let chain = chain.lock().unwrap_or_else(PoisonError::into_inner);
        chain.periods.iter().find(|p| &p.id == id).cloned()
    }

    /// Every period of every chain, ordered by taxpayer, regime and label.
    pub fn periods(&self) -> Vec<TaxPeriod> {
        let mut keys: Vec<ChainKey> = self
            .chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys.iter()
            .flat_map(|(taxpayer, regime)| self.get_chain(taxpayer, regime.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::regimes::{cit, vat};
    use rust_decimal_macros::dec;

    const TAXPAYER: &str = "0101234567";

    fn manager() -> PeriodChainManager {
        PeriodChainManager::new(Arc::new(SchemaRegistry::with_builtin().unwrap()))
    }

    fn label(s: &str) -> PeriodLabel {
        s.parse().unwrap()
    }

    fn inputs(pairs: &[(&str, Decimal)]) -> RawInput {
        pairs.iter().map(|(k, v)| (BoxId::from(*k), *v)).collect()
    }

    /// VAT quarter whose input VAT exceeds output VAT by `credit`.
    fn vat_credit(credit: Decimal) -> RawInput {
        inputs(&[
            ("23", dec!(0)),
            ("24", dec!(0)),
            ("25", credit),
            ("26", dec!(0)),
            ("27", dec!(0)),
            ("28", dec!(0)),
            ("29", dec!(0)),
            ("31", dec!(0)),
            ("32", dec!(0)),
        ])
    }

    /// VAT quarter with `output` VAT payable before credits.
    fn vat_output(output: Decimal) -> RawInput {
        inputs(&[
            ("23", dec!(0)),
            ("24", dec!(0)),
            ("25", dec!(0)),
            ("26", dec!(0)),
            ("27", dec!(0)),
            ("28", dec!(0)),
            ("29", dec!(0)),
            ("31", output * dec!(10)),
            ("32", output),
        ])
    }

    fn open_and_close(m: &PeriodChainManager, l: &str, raw: RawInput) -> TaxPeriod {
        let id = m.create_period(TAXPAYER, vat::REGIME, label(l), raw).unwrap();
        m.close_period(&id).unwrap()
    }

    #[test]
    fn first_period_starts_from_zero() {
        let m = manager();
        let id = m
            .create_period(TAXPAYER, vat::REGIME, label("2024-Q1"), vat_credit(dec!(5)))
            .unwrap();
        let period = m.get_period(&id).unwrap();
        assert_eq!(period.status, PeriodStatus::Open);
        assert_eq!(period.raw_inputs.get("22"), Some(&dec!(0)));
        assert_eq!(period.prior, None);
        assert_eq!(id.to_string(), "0101234567/vat/2024-Q1");
    }

    #[test]
    fn carry_forward_flows_into_next_period() {
        let m = manager();
        let p1 = open_and_close(&m, "2024-Q1", vat_credit(dec!(7000000)));
        assert_eq!(p1.carry_forward_value, Some(dec!(7000000)));
        assert_eq!(p1.status, PeriodStatus::Locked);
        assert!(p1.snapshot_digest.is_some());

        let p2 = m
            .create_period(TAXPAYER, vat::REGIME, label("2024-Q2"), vat_output(dec!(2000000)))
            .unwrap();
        let period = m.get_period(&p2).unwrap();
        assert_eq!(period.raw_inputs.get("22"), Some(&dec!(7000000)));
        assert_eq!(period.prior, Some(p1.id.clone()));
        assert_eq!(m.get_period(&p1.id).unwrap().next, Some(p2.clone()));

        let closed = m.close_period(&p2).unwrap();
        let snapshot = closed.computed_snapshot.unwrap();
        assert_eq!(snapshot.get("22"), Some(dec!(7000000)));
        assert_eq!(snapshot.get("40"), Some(dec!(0)));
        assert_eq!(snapshot.get("41"), Some(dec!(5000000)));
        assert_eq!(closed.carry_forward_value, Some(dec!(5000000)));
    }

    #[test]
    fn cannot_build_on_open_period() {
        let m = manager();
        m.create_period(TAXPAYER, vat::REGIME, label("2024-Q1"), vat_credit(dec!(1)))
            .unwrap();
        let err = m
            .create_period(TAXPAYER, vat::REGIME, label("2024-Q2"), RawInput::new())
            .unwrap_err();
        assert!(matches!(err, ChainError::PriorNotLocked { status: PeriodStatus::Open, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn supplied_carry_must_match() {
        let m = manager();
        open_and_close(&m, "2024-Q1", vat_credit(dec!(100)));
        let mut raw = vat_output(dec!(1));
        raw.insert(BoxId::from("22"), dec!(99));
        let err = m
            .create_period(TAXPAYER, vat::REGIME, label("2024-Q2"), raw.clone())
            .unwrap_err();
        assert_eq!(
            err,
            ChainError::CarryBoxReadOnly {
                box_id: BoxId::from("22"),
                supplied: dec!(99),
                carried: dec!(100),
            }
        );

        raw.insert(BoxId::from("22"), dec!(100));
        assert!(m
            .create_period(TAXPAYER, vat::REGIME, label("2024-Q2"), raw)
            .is_ok());
    }

    #[test]
    fn labels_must_advance_with_one_granularity() {
        let m = manager();
        open_and_close(&m, "2024-Q2", vat_credit(dec!(1)));
        let create = |l: &str| m.create_period(TAXPAYER, vat::REGIME, label(l), RawInput::new());

        assert!(matches!(create("2024-Q2"), Err(ChainError::DuplicateLabel(_))));
        assert!(matches!(create("2024-Q1"), Err(ChainError::OutOfOrder { .. })));
        assert!(matches!(
            create("2024-09"),
            Err(ChainError::GranularityMismatch { expected: Granularity::Quarter, .. })
        ));
        // a gap is allowed
        assert!(create("2024-Q4").is_ok());
    }

    #[test]
    fn unknown_regime_and_bad_inputs() {
        let m = manager();
        assert_eq!(
            m.create_period(TAXPAYER, "gst", label("2024"), RawInput::new()),
            Err(ChainError::UnknownRegime(RegimeId::from("gst")))
        );
        assert!(matches!(
            m.create_period(TAXPAYER, vat::REGIME, label("2024-Q1"), inputs(&[("40", dec!(1))])),
            Err(ChainError::Eval(EvalError::UnknownInput { .. }))
        ));
        assert!(matches!(
            m.create_period("01 02", vat::REGIME, label("2024-Q1"), RawInput::new()),
            Err(ChainError::InvalidTaxpayer(_))
        ));
    }

    #[test]
    fn close_reports_missing_input() {
        let m = manager();
        let id = m
            .create_period(TAXPAYER, vat::REGIME, label("2024-Q1"), RawInput::new())
            .unwrap();
        let err = m.close_period(&id).unwrap_err();
        assert!(matches!(err, ChainError::Eval(EvalError::MissingInput { .. })));
        assert_eq!(m.get_period(&id).unwrap().status, PeriodStatus::Open);
    }

    #[test]
    fn close_is_idempotent() {
        let m = manager();
        let first = open_and_close(&m, "2024-Q1", vat_credit(dec!(10)));
        let again = m.close_period(&first.id).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn locked_period_is_read_only() {
        let m = manager();
        let p1 = open_and_close(&m, "2024-Q1", vat_credit(dec!(10)));
        assert_eq!(
            m.update_inputs(&p1.id, vat_credit(dec!(20))),
            Err(ChainError::Locked(p1.id.clone()))
        );
    }

    #[test]
    fn reopen_without_successor() {
        let m = manager();
        let p1 = open_and_close(&m, "2024-Q1", vat_credit(dec!(10)));
        m.reopen_period(&p1.id, false).unwrap();
        let period = m.get_period(&p1.id).unwrap();
        assert_eq!(period.status, PeriodStatus::Amended);
        assert_eq!(period.amendments, 1);
        assert!(matches!(
            m.reopen_period(&p1.id, false),
            Err(ChainError::NotLocked { status: PeriodStatus::Amended, .. })
        ));

        m.update_inputs(&p1.id, vat_credit(dec!(30))).unwrap();
        let relocked = m.close_period(&p1.id).unwrap();
        assert_eq!(relocked.carry_forward_value, Some(dec!(30)));
    }

    #[test]
    fn amendment_needs_cascade_when_successor_locked() {
        let m = manager();
        let p1 = open_and_close(&m, "2024-Q1", vat_credit(dec!(10000000)));
        let p2 = open_and_close(&m, "2024-Q2", vat_output(dec!(1000000)));
        let p3 = open_and_close(&m, "2024-Q3", vat_output(dec!(0)));
        assert_eq!(p3.carry_forward_value, Some(dec!(9000000)));

        assert_eq!(
            m.reopen_period(&p1.id, false),
            Err(ChainError::Amendment {
                id: p1.id.clone(),
                successor: p2.id.clone(),
            })
        );
        assert_eq!(m.get_period(&p1.id).unwrap().status, PeriodStatus::Locked);

        m.reopen_period(&p1.id, true).unwrap();
        let chain = m.get_chain(TAXPAYER, vat::REGIME);
        assert_eq!(chain.len(), 3);
        assert!(chain.iter().all(|p| p.status == PeriodStatus::Amended));
        assert!(!chain[0].stale);
        assert!(chain[1].stale && chain[2].stale);

        // downstream cannot close until its prior is trusted again
        assert!(matches!(
            m.close_period(&p2.id),
            Err(ChainError::PriorNotLocked { .. })
        ));

        m.update_inputs(&p1.id, vat_credit(dec!(4000000))).unwrap();
        m.close_period(&p1.id).unwrap();
        assert!(matches!(m.close_period(&p3.id), Err(ChainError::PriorNotLocked { .. })));

        let p2 = m.close_period(&p2.id).unwrap();
        assert!(!p2.stale);
        assert_eq!(p2.raw_inputs.get("22"), Some(&dec!(4000000)));
        assert_eq!(p2.carry_forward_value, Some(dec!(3000000)));

        let p3 = m.close_period(&p3.id).unwrap();
        assert_eq!(p3.raw_inputs.get("22"), Some(&dec!(3000000)));
        assert_eq!(p3.carry_forward_value, Some(dec!(3000000)));
        assert_eq!(p3.amendments, 1);
    }

    #[test]
    fn stale_latest_blocks_new_period() {
        let m = manager();
        let p1 = open_and_close(&m, "2024-Q1", vat_credit(dec!(10)));
        open_and_close(&m, "2024-Q2", vat_credit(dec!(0)));
        m.reopen_period(&p1.id, true).unwrap();
        m.close_period(&p1.id).unwrap();
        let err = m
            .create_period(TAXPAYER, vat::REGIME, label("2024-Q3"), RawInput::new())
            .unwrap_err();
        assert!(matches!(err, ChainError::PriorNotLocked { status: PeriodStatus::Amended, .. }));
    }

    #[test]
    fn busy_chain_is_a_retryable_conflict() {
        let m = manager();
        let id = m
            .create_period(TAXPAYER, vat::REGIME, label("2024-Q1"), vat_credit(dec!(1)))
            .unwrap();
        let chain = m.chain(&id.chain_key()).unwrap();
        let _held = chain.lock().unwrap();

        let err = m.close_period(&id).unwrap_err();
        assert!(err.is_retryable());
        let err = m
            .create_period(TAXPAYER, vat::REGIME, label("2024-Q2"), RawInput::new())
            .unwrap_err();
        assert!(matches!(err, ChainError::Conflict { .. }));

        // other chains are unaffected
        assert!(m
            .create_period("0309999999", vat::REGIME, label("2024-Q1"), RawInput::new())
            .is_ok());
    }

    #[test]
    fn concurrent_closers_never_diverge() {
        let m = Arc::new(manager());
        let id = m
            .create_period(TAXPAYER, vat::REGIME, label("2024-Q1"), vat_credit(dec!(1)))
            .unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                let id = id.clone();
                std::thread::spawn(move || m.close_period(&id))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.iter().any(|r| r.is_ok()));
        for r in &results {
            match r {
                Ok(p) => assert_eq!(p.carry_forward_value, Some(dec!(1))),
                Err(e) => assert!(e.is_retryable()),
            }
        }
    }

    #[test]
    fn chains_are_separate_per_regime() {
        let m = manager();
        open_and_close(&m, "2024-Q1", vat_credit(dec!(1)));
        let id = m
            .create_period(TAXPAYER, cit::REGIME, label("2024"), RawInput::new())
            .unwrap();
        assert_eq!(m.close_period(&id).unwrap().carry_forward_value, None);
        assert_eq!(m.get_chain(TAXPAYER, vat::REGIME).len(), 1);
        assert_eq!(m.get_chain(TAXPAYER, cit::REGIME).len(), 1);
        assert!(m.get_chain("nobody", vat::REGIME).is_empty());
        assert_eq!(m.periods().len(), 2);
    }

    #[test]
    fn rebuild_from_periods() {
        let registry = Arc::new(SchemaRegistry::with_builtin().unwrap());
        let m = PeriodChainManager::new(Arc::clone(&registry));
        open_and_close(&m, "2024-Q1", vat_credit(dec!(10)));
        m.create_period(TAXPAYER, vat::REGIME, label("2024-Q2"), RawInput::new())
            .unwrap();

        let periods = m.periods();
        let rebuilt = PeriodChainManager::from_periods(Arc::clone(&registry), periods.clone()).unwrap();
        assert_eq!(rebuilt.periods(), periods);

        let mut tampered = periods.clone();
        if let Some(s) = tampered[0].computed_snapshot.as_mut() {
            s.carry_forward = Some(dec!(11));
            s.lines.iter_mut().for_each(|l| {
                if l.id.as_str() == "43" {
                    l.value = dec!(11);
                }
            });
        }
        assert!(matches!(
            PeriodChainManager::from_periods(Arc::clone(&registry), tampered),
            Err(ChainError::SnapshotMismatch(_))
        ));

        let mut unlinked = periods.clone();
        unlinked[1].prior = None;
        assert!(matches!(
            PeriodChainManager::from_periods(Arc::clone(&registry), unlinked),
            Err(ChainError::Corrupt { .. })
        ));

        // stored carry forward must match the locked snapshot
        let mut carry = periods.clone();
        carry[0].carry_forward_value = Some(dec!(999));
        assert!(matches!(
            PeriodChainManager::from_periods(Arc::clone(&registry), carry),
            Err(ChainError::Corrupt { ref reason, .. }) if reason.contains("snapshot")
        ));

        // the successor's carry-in must be the prior's carry forward
        let mut carry_in = periods;
        carry_in[1].raw_inputs.insert(BoxId::from("22"), dec!(999));
        assert!(matches!(
            PeriodChainManager::from_periods(registry, carry_in),
            Err(ChainError::Corrupt { ref reason, .. }) if reason.contains("carry-in")
        ));
    }

    #[test]
    fn rebuild_rejects_locked_period_on_open_prior() {
        let registry = Arc::new(SchemaRegistry::with_builtin().unwrap());
        let m = PeriodChainManager::new(Arc::clone(&registry));
        let p1 = open_and_close(&m, "2024-Q1", vat_credit(dec!(10)));
        open_and_close(&m, "2024-Q2", vat_output(dec!(0)));

        let mut periods = m.periods();
        assert_eq!(periods[0].id, p1.id);
        periods[0].status = PeriodStatus::Amended;
        assert!(matches!(
            PeriodChainManager::from_periods(Arc::clone(&registry), periods),
            Err(ChainError::Corrupt { ref id, .. }) if id.label() == label("2024-Q2")
        ));

        // a reloaded chain carries the stored value, not a tampered one
        let reloaded = PeriodChainManager::from_periods(registry, m.periods()).unwrap();
        let p3 = reloaded
            .create_period(TAXPAYER, vat::REGIME, label("2024-Q3"), RawInput::new())
            .unwrap();
        assert_eq!(
            reloaded.get_period(&p3).unwrap().raw_inputs.get("22"),
            Some(&dec!(10))
        );
    }

    #[test]
    fn reopen_without_carry_box_leaves_later_years() {
        let m = manager();
        let y1 = m
            .create_period(TAXPAYER, cit::REGIME, label("2023"), RawInput::new())
            .unwrap();
        m.close_period(&y1).unwrap();
        let y2 = m
            .create_period(TAXPAYER, cit::REGIME, label("2024"), RawInput::new())
            .unwrap();
        m.close_period(&y2).unwrap();

        m.reopen_period(&y1, false).unwrap();
        assert_eq!(m.get_period(&y1).unwrap().status, PeriodStatus::Amended);
        let later = m.get_period(&y2).unwrap();
        assert_eq!(later.status, PeriodStatus::Locked);
        assert!(!later.stale);

        let registry = Arc::new(SchemaRegistry::with_builtin().unwrap());
        assert!(PeriodChainManager::from_periods(registry, m.periods()).is_ok());
    }

    #[test]
    fn period_id_round_trip() {
        let id: PeriodId = "0101234567/cit-03-1a/2024".parse().unwrap();
        assert_eq!(id.taxpayer_id(), "0101234567");
        assert_eq!(id.regime().as_str(), "cit-03-1a");
        assert_eq!(id.label(), label("2024"));
        assert!("nope".parse::<PeriodId>().is_err());
        assert!("a/vat/2024-Q9".parse::<PeriodId>().is_err());
    }
}
