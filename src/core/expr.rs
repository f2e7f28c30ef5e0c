use rust_decimal::{Decimal, RoundingStrategy};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Identifier of a numbered line item on a return, e.g. `"22"`, `"29a"`, `"C7"`.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct BoxId(String);

impl BoxId {
    pub fn new(id: impl Into<String>) -> Self {
        BoxId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BoxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BoxId {
    fn from(s: &str) -> Self {
        BoxId(s.to_string())
    }
}

impl From<String> for BoxId {
    fn from(s: String) -> Self {
        BoxId(s)
    }
}

impl Borrow<str> for BoxId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Formula over other boxes.
///
/// Arithmetic is exact: the only rounding is an explicit [`Expr::Round`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// Value of another box
    Ref(BoxId),
    /// Literal amount
    Const(#[schemars(with = "f64")] Decimal),
    Sum(Vec<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    /// Multiply by a fixed factor, e.g. a statutory rate of `0.20`
    Scale {
        expr: Box<Expr>,
        #[schemars(with = "f64")]
        factor: Decimal,
    },
    /// Round half away from zero to whole currency units
    Round(Box<Expr>),
    Max(Vec<Expr>),
    Min(Vec<Expr>),
}

/// Why an expression could not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Unresolved(BoxId),
    Overflow,
    Empty,
}

/// Shorthand for a box reference.
pub fn bx(id: &str) -> Expr {
    Expr::Ref(BoxId::from(id))
}

impl Expr {
    /// Sum of the named boxes.
    pub fn sum<'a>(ids: impl IntoIterator<Item = &'a str>) -> Expr {
        Expr::Sum(ids.into_iter().map(bx).collect())
    }

    pub fn scale(self, factor: Decimal) -> Expr {
        Expr::Scale {
            expr: Box::new(self),
            factor,
        }
    }

    pub fn round(self) -> Expr {
        Expr::Round(Box::new(self))
    }

    /// `max(self, 0)`
    pub fn floor_zero(self) -> Expr {
        Expr::Max(vec![self, Expr::Const(Decimal::ZERO)])
    }

    /// Every box this expression reads, in order of appearance.
    pub fn refs(&self) -> Vec<&BoxId> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a BoxId>) {
        match self {
            Expr::Ref(id) => out.push(id),
            Expr::Const(_) => {}
            Expr::Sum(items) | Expr::Max(items) | Expr::Min(items) => {
                items.iter().for_each(|e| e.collect_refs(out))
            }
            Expr::Sub(a, b) => {
                a.collect_refs(out);
                b.collect_refs(out);
            }
            Expr::Neg(e) | Expr::Round(e) | Expr::Scale { expr: e, .. } => e.collect_refs(out),
        }
    }

    /// Evaluate against already computed values.
    pub fn eval<F>(&self, lookup: &F) -> Result<Decimal, Fault>
    where
        F: Fn(&BoxId) -> Option<Decimal>,
    {
        match self {
            Expr::Ref(id) => lookup(id).ok_or_else(|| Fault::Unresolved(id.clone())),
            Expr::Const(c) => Ok(*c),
            Expr::Sum(items) => items.iter().try_fold(Decimal::ZERO, |acc, e| {
                acc.checked_add(e.eval(lookup)?).ok_or(Fault::Overflow)
            }),
            Expr::Sub(a, b) => a
                .eval(lookup)?
                .checked_sub(b.eval(lookup)?)
                .ok_or(Fault::Overflow),
            Expr::Neg(e) => Ok(-e.eval(lookup)?),
            Expr::Scale { expr, factor } => expr
                .eval(lookup)?
                .checked_mul(*factor)
                .ok_or(Fault::Overflow),
            Expr::Round(e) => {
                Ok(e.eval(lookup)?
                    .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
            }
            Expr::Max(items) => fold_extreme(items, lookup, Decimal::max),
            Expr::Min(items) => fold_extreme(items, lookup, Decimal::min),
        }
    }
}

fn fold_extreme<F>(
    items: &[Expr],
    lookup: &F,
    pick: fn(Decimal, Decimal) -> Decimal,
) -> Result<Decimal, Fault>
where
    F: Fn(&BoxId) -> Option<Decimal>,
{
    let mut values = items.iter().map(|e| e.eval(lookup));
    let first = values.next().ok_or(Fault::Empty)??;
    values.try_fold(first, |acc, v| Ok(pick(acc, v?)))
}

impl std::ops::Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        match self {
            Expr::Sum(mut items) => {
                items.push(rhs);
                Expr::Sum(items)
            }
            lhs => Expr::Sum(vec![lhs, rhs]),
        }
    }
}

impl std::ops::Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        Expr::Sub(Box::new(self), Box::new(rhs))
    }
}

impl std::ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Ref(id) => write!(f, "[{id}]"),
            Expr::Const(c) => write!(f, "{c}"),
            Expr::Sum(items) => write_list(f, items, " + "),
            Expr::Sub(a, b) => match **b {
                Expr::Sum(_) | Expr::Sub(..) => write!(f, "{a} - ({b})"),
                _ => write!(f, "{a} - {b}"),
            },
            Expr::Neg(e) => write!(f, "-({e})"),
            Expr::Scale { expr, factor } => match **expr {
                Expr::Ref(_) | Expr::Const(_) => write!(f, "{expr} x {factor}"),
                _ => write!(f, "({expr}) x {factor}"),
            },
            Expr::Round(e) => write!(f, "round({e})"),
            Expr::Max(items) => {
                f.write_str("max(")?;
                write_list(f, items, ", ")?;
                f.write_str(")")
            }
            Expr::Min(items) => {
                f.write_str("min(")?;
                write_list(f, items, ", ")?;
                f.write_str(")")
            }
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn values(pairs: &[(&str, Decimal)]) -> HashMap<BoxId, Decimal> {
        pairs.iter().map(|(k, v)| (BoxId::from(*k), *v)).collect()
    }

    #[test]
    fn operators_build_expected_tree() {
        let e = bx("36") - bx("22") + bx("37");
        assert_eq!(
            e,
            Expr::Sum(vec![
                Expr::Sub(Box::new(bx("36")), Box::new(bx("22"))),
                bx("37"),
            ])
        );
        assert_eq!(e.to_string(), "[36] - [22] + [37]");
    }

    #[test]
    fn refs_in_order_of_appearance() {
        let e = (bx("36") - bx("22") + bx("37") - bx("38")).floor_zero();
        let refs: Vec<&str> = e.refs().into_iter().map(BoxId::as_str).collect();
        assert_eq!(refs, ["36", "22", "37", "38"]);
    }

    #[test]
    fn eval_is_exact() {
        let v = values(&[("a", dec!(0.1)), ("b", dec!(0.2))]);
        let e = bx("a") + bx("b");
        assert_eq!(e.eval(&|id: &BoxId| v.get(id).copied()), Ok(dec!(0.3)));
    }

    #[test]
    fn round_is_half_away_from_zero() {
        let v = values(&[("a", dec!(2.5)), ("b", dec!(-2.5))]);
        let lookup = |id: &BoxId| v.get(id).copied();
        assert_eq!(bx("a").round().eval(&lookup), Ok(dec!(3)));
        assert_eq!(bx("b").round().eval(&lookup), Ok(dec!(-3)));
    }

    #[test]
    fn scale_then_round() {
        let v = values(&[("c4", dec!(1000003))]);
        let e = bx("c4").scale(dec!(0.20)).round();
        assert_eq!(e.eval(&|id: &BoxId| v.get(id).copied()), Ok(dec!(200001)));
    }

    #[test]
    fn floor_zero_clamps_negative() {
        let v = values(&[("x", dec!(-5))]);
        assert_eq!(
            bx("x").floor_zero().eval(&|id: &BoxId| v.get(id).copied()),
            Ok(Decimal::ZERO)
        );
    }

    #[test]
    fn unresolved_reference_is_reported() {
        let e = bx("a") + bx("missing");
        let v = values(&[("a", dec!(1))]);
        assert_eq!(
            e.eval(&|id: &BoxId| v.get(id).copied()),
            Err(Fault::Unresolved(BoxId::from("missing")))
        );
    }

    #[test]
    fn overflow_is_a_fault_not_a_panic() {
        let v = values(&[("a", Decimal::MAX)]);
        let e = bx("a") + bx("a");
        assert_eq!(e.eval(&|id: &BoxId| v.get(id).copied()), Err(Fault::Overflow));
    }

    #[test]
    fn serde_shape() {
        let e = bx("41") - bx("42");
        let json = serde_json::to_string(&e).unwrap();
        assert_eq!(json, r#"{"sub":[{"ref":"41"},{"ref":"42"}]}"#);
        let back: Expr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
