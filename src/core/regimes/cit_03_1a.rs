//! Income statement schedule 03-1A attached to the CIT return.

use crate::core::expr::{bx, Expr};
use crate::core::schema::{BoxDef, RegimeId, SchemaDef};

pub const REGIME: &str = "cit-03-1a";

/// Box carried into [A1] of the CIT return.
pub const PROFIT_BEFORE_TAX: &str = "19";

pub fn schema() -> SchemaDef {
    SchemaDef {
        regime: RegimeId::from(REGIME),
        title: "CIT schedule 03-1A: business results".to_string(),
        boxes: vec![
            BoxDef::optional("01", "Revenue from sales and services"),
            BoxDef::optional("02", "of which: export revenue"),
            BoxDef::optional("04", "Trade discounts"),
            BoxDef::optional("05", "Sales allowances"),
            BoxDef::optional("06", "Sales returns"),
            BoxDef::optional("07", "Special consumption, export and direct VAT payable"),
            BoxDef::derived(
                "03",
                "Revenue deductions",
                Expr::sum(["04", "05", "06", "07"]),
            ),
            BoxDef::optional("08", "Financial income"),
            BoxDef::optional("10", "Cost of goods sold"),
            BoxDef::optional("11", "Selling expenses"),
            BoxDef::optional("12", "General and administrative expenses"),
            BoxDef::derived(
                "09",
                "Cost of sales, selling and administrative expenses",
                Expr::sum(["10", "11", "12"]),
            ),
            BoxDef::optional("13", "Financial expenses"),
            BoxDef::optional("14", "of which: interest expense"),
            BoxDef::derived(
                "15",
                "Net operating profit",
                bx("01") - bx("03") + bx("08") - bx("09") - bx("13"),
            ),
            BoxDef::optional("16", "Other income"),
            BoxDef::optional("17", "Other expenses"),
            BoxDef::derived("18", "Other profit", bx("16") - bx("17")),
            BoxDef::derived(
                PROFIT_BEFORE_TAX,
                "Total accounting profit before tax",
                bx("15") + bx("18"),
            ),
        ],
        bifurcations: Vec::new(),
        carry_in: None,
        carry_out: None,
        checks: Vec::new(),
        schedules: Vec::new(),
    }
}
