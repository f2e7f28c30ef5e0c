//! VAT return (form 01/GTGT), deduction method.
//!
//! [22] receives the prior period's [43]. The signed position
//! `[36] - [22] + [37] - [38] - [39]` splits into [40] (payable) and
//! [41] (not yet deducted); [43] = [41] - [42] is carried forward.

use crate::core::expr::{bx, BoxId, Expr};
use crate::core::schema::{Bifurcation, BoxDef, Check, CheckOp, RegimeId, SchemaDef};

pub const REGIME: &str = "vat";

const PURCHASES: &str = "B. Purchases";
const SALES: &str = "C. Sales";
const POSITION: &str = "D. Tax position";

pub fn schema() -> SchemaDef {
    SchemaDef {
        regime: RegimeId::from(REGIME),
        title: "VAT return 01/GTGT".to_string(),
        boxes: vec![
            BoxDef::raw("22", "VAT not yet deducted carried from previous period")
                .section("A. Carried forward"),
            BoxDef::raw("23", "Value of goods and services purchased").section(PURCHASES),
            BoxDef::raw("24", "Input VAT on goods and services purchased").section(PURCHASES),
            BoxDef::raw("25", "Total input VAT deductible this period").section(PURCHASES),
            BoxDef::raw("26", "Revenue not subject to VAT").section(SALES),
            BoxDef::raw("27", "Revenue subject to VAT at 0%").section(SALES),
            BoxDef::raw("28", "Revenue subject to VAT at 5%").section(SALES),
            BoxDef::raw("29", "Output VAT at 5%").section(SALES),
            BoxDef::optional("29a", "Revenue subject to VAT at 8%").section(SALES),
            BoxDef::optional("29b", "Output VAT at 8%").section(SALES),
            BoxDef::optional("30", "Revenue subject to VAT not declared or calculated")
                .section(SALES),
            BoxDef::raw("31", "Revenue subject to VAT at 10%").section(SALES),
            BoxDef::raw("32", "Output VAT at 10%").section(SALES),
            BoxDef::derived(
                "33",
                "Total revenue subject to VAT",
                Expr::sum(["27", "28", "29a", "31", "30"]),
            )
            .section(SALES),
            BoxDef::derived("34", "Total revenue", bx("26") + bx("33")).section(SALES),
            BoxDef::derived("35", "Total output VAT", Expr::sum(["29", "29b", "32"]))
                .section(SALES),
            BoxDef::derived("36", "VAT arising this period", bx("35") - bx("25"))
                .section(POSITION),
            BoxDef::optional("37", "Adjustment decreasing VAT of previous periods")
                .section(POSITION),
            BoxDef::optional("38", "Adjustment increasing VAT of previous periods")
                .section(POSITION),
            BoxDef::optional("39", "VAT paid in other provinces").section(POSITION),
            BoxDef::split("40", "VAT payable this period").section(POSITION),
            BoxDef::split("41", "VAT not yet fully deducted this period").section(POSITION),
            BoxDef::optional("42", "VAT requested for refund").section(POSITION),
            BoxDef::derived("43", "VAT carried forward to next period", bx("41") - bx("42"))
                .section(POSITION),
        ],
        bifurcations: vec![Bifurcation::new(position(), "40", "41")],
        carry_in: Some(BoxId::from("22")),
        carry_out: Some(BoxId::from("43")),
        checks: vec![Check {
            lhs: bx("42"),
            op: CheckOp::Le,
            rhs: bx("41"),
            message: "refund requested [42] exceeds VAT not yet deducted [41]".to_string(),
        }],
        schedules: Vec::new(),
    }
}

fn position() -> Expr {
    bx("36") - bx("22") + bx("37") - bx("38") - bx("39")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::{evaluate, EvalError, RawInput};
    use crate::core::schema::RegimeSchema;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn vat() -> RegimeSchema {
        RegimeSchema::try_from(schema()).unwrap()
    }

    /// Every required raw box at zero, then the given overrides.
    fn inputs(overrides: &[(&str, Decimal)]) -> RawInput {
        let mut raw: RawInput = ["23", "24", "25", "26", "27", "28", "29", "31", "32"]
            .into_iter()
            .map(|id| (BoxId::from(id), Decimal::ZERO))
            .collect();
        for (id, v) in overrides {
            raw.insert(BoxId::from(*id), *v);
        }
        raw
    }

    #[test]
    fn payable_period() {
        let raw = inputs(&[
            ("25", dec!(1000000)),
            ("31", dec!(20000000)),
            ("32", dec!(2000000)),
        ]);
        let v = evaluate(&vat(), &raw, dec!(0)).unwrap();
        assert_eq!(v.get("33"), Some(dec!(20000000)));
        assert_eq!(v.get("34"), Some(dec!(20000000)));
        assert_eq!(v.get("35"), Some(dec!(2000000)));
        assert_eq!(v.get("36"), Some(dec!(1000000)));
        assert_eq!(v.get("40"), Some(dec!(1000000)));
        assert_eq!(v.get("41"), Some(dec!(0)));
        assert_eq!(v.get("43"), Some(dec!(0)));
        assert_eq!(v.carry_forward, Some(dec!(0)));
    }

    #[test]
    fn credit_period_carries_forward() {
        let raw = inputs(&[
            ("24", dec!(5000000)),
            ("25", dec!(5000000)),
            ("31", dec!(20000000)),
            ("32", dec!(2000000)),
            ("42", dec!(1000000)),
        ]);
        let v = evaluate(&vat(), &raw, dec!(500000)).unwrap();
        // 2m - 5m - 0.5m = -3.5m
        assert_eq!(v.get("36"), Some(dec!(-3000000)));
        assert_eq!(v.get("40"), Some(dec!(0)));
        assert_eq!(v.get("41"), Some(dec!(3500000)));
        assert_eq!(v.get("43"), Some(dec!(2500000)));
        assert_eq!(v.carry_forward, Some(dec!(2500000)));
    }

    #[test]
    fn total_revenue_is_sum_of_buckets() {
        let raw = inputs(&[
            ("26", dec!(1)),
            ("27", dec!(10)),
            ("28", dec!(100)),
            ("29a", dec!(1000)),
            ("30", dec!(10000)),
            ("31", dec!(100000)),
        ]);
        let v = evaluate(&vat(), &raw, dec!(0)).unwrap();
        assert_eq!(v.get("33"), Some(dec!(111110)));
        assert_eq!(v.get("34"), Some(dec!(111111)));
    }

    #[test]
    fn signed_adjustments_move_the_position() {
        let raw = inputs(&[
            ("32", dec!(1000)),
            ("37", dec!(-200)),
            ("38", dec!(300)),
            ("39", dec!(100)),
        ]);
        let v = evaluate(&vat(), &raw, dec!(0)).unwrap();
        // 1000 - 0 + (-200) - 300 - 100
        assert_eq!(v.get("40"), Some(dec!(400)));
        assert_eq!(v.get("41"), Some(dec!(0)));
    }

    #[test]
    fn refund_above_credit_rejected() {
        let raw = inputs(&[("25", dec!(100)), ("42", dec!(101))]);
        let err = evaluate(&vat(), &raw, dec!(0)).unwrap_err();
        assert!(matches!(err, EvalError::CheckFailed { .. }));
    }

    #[test]
    fn missing_required_box() {
        let mut raw = inputs(&[]);
        raw.remove("25");
        let err = evaluate(&vat(), &raw, dec!(0)).unwrap_err();
        assert!(matches!(err, EvalError::MissingInput { ref box_id, .. } if box_id.as_str() == "25"));
    }
}
