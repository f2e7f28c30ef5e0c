//! CIT finalization return (form 03/TNDN).
//!
//! [A1] is fed by [19] of the 03-1A income statement schedule when one is
//! supplied. The difference between tax payable [G1] and tax provisionally
//! paid [G2] splits into [G4] (still payable) and [G5] (overpaid).

use super::cit_03_1a;
use crate::core::expr::{bx, BoxId, Expr};
use crate::core::schema::{Bifurcation, BoxDef, RegimeId, ScheduleLink, SchemaDef};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub const REGIME: &str = "cit";

/// Standard CIT rate.
pub const STANDARD_RATE: Decimal = dec!(0.20);

const PROFIT: &str = "A. Accounting profit";
const ADJUSTMENTS: &str = "B. Adjustments";
const TAX: &str = "C. Tax payable";
const SETTLEMENT: &str = "G. Settlement";

pub fn schema() -> SchemaDef {
    SchemaDef {
        regime: RegimeId::from(REGIME),
        title: "CIT finalization return 03/TNDN".to_string(),
        boxes: vec![
            BoxDef::optional("A1", "Accounting profit before tax").section(PROFIT),
            BoxDef::optional("B1", "Adjustments increasing taxable income").section(ADJUSTMENTS),
            BoxDef::optional("B8", "Adjustments decreasing taxable income").section(ADJUSTMENTS),
            BoxDef::derived(
                "B12",
                "Total taxable income from business",
                bx("A1") + bx("B1") - bx("B8"),
            )
            .section(ADJUSTMENTS),
            BoxDef::optional("B14", "Taxable income from real estate transfer")
                .section(ADJUSTMENTS),
            BoxDef::derived(
                "B13",
                "Taxable income from production and business activities",
                bx("B12") - bx("B14"),
            )
            .section(ADJUSTMENTS),
            BoxDef::derived("C1", "Taxable income", bx("B13")).section(TAX),
            BoxDef::optional("C2", "Exempt income").section(TAX),
            BoxDef::optional("C3", "Losses carried forward").section(TAX),
            BoxDef::derived(
                "C4",
                "Assessable income",
                (bx("C1") - bx("C2") - bx("C3")).floor_zero(),
            )
            .section(TAX),
            BoxDef::derived(
                "C7",
                "CIT at the standard rate",
                bx("C4").scale(STANDARD_RATE).round(),
            )
            .section(TAX),
            BoxDef::optional("C8", "CIT difference at other rates").section(TAX),
            BoxDef::optional("C9", "Additional CIT").section(TAX),
            BoxDef::derived("C10", "CIT arising", Expr::sum(["C7", "C8", "C9"])).section(TAX),
            BoxDef::optional("C11", "CIT exempted or reduced").section(TAX),
            BoxDef::optional("C12", "CIT paid abroad and deducted").section(TAX),
            BoxDef::derived(
                "C13",
                "CIT payable from production and business",
                bx("C10") - bx("C11") - bx("C12"),
            )
            .section(TAX),
            BoxDef::optional("C14", "CIT payable on real estate transfer").section(TAX),
            BoxDef::derived("C16", "Total CIT payable", bx("C13") + bx("C14")).section(TAX),
            BoxDef::derived("G1", "CIT payable for the year", bx("C16")).section(SETTLEMENT),
            BoxDef::optional("G2", "CIT provisionally paid during the year")
                .section(SETTLEMENT),
            BoxDef::derived("G3", "Difference", bx("G1") - bx("G2")).section(SETTLEMENT),
            BoxDef::split("G4", "CIT still payable").section(SETTLEMENT),
            BoxDef::split("G5", "CIT overpaid").section(SETTLEMENT),
        ],
        bifurcations: vec![Bifurcation::new(bx("G3"), "G4", "G5")],
        carry_in: None,
        carry_out: None,
        checks: Vec::new(),
        schedules: vec![ScheduleLink {
            schedule: RegimeId::from(cit_03_1a::REGIME),
            source: BoxId::from(cit_03_1a::PROFIT_BEFORE_TAX),
            target: BoxId::from("A1"),
        }],
    }
}
