//! PIT withholding return (form 05/KK-TNCN).

use crate::core::expr::bx;
use crate::core::schema::{BoxDef, RegimeId, SchemaDef, Unit};

pub const REGIME: &str = "pit";

const HEADCOUNT: &str = "A. Employees";
const INCOME: &str = "B. Taxable income";
const TAX: &str = "C. Tax";

pub fn schema() -> SchemaDef {
    SchemaDef {
        regime: RegimeId::from(REGIME),
        title: "PIT withholding return 05/KK-TNCN".to_string(),
        boxes: vec![
            BoxDef::optional("21", "Total number of employees")
                .section(HEADCOUNT)
                .unit(Unit::Count),
            BoxDef::optional("22", "Resident employees with labour contracts")
                .section(HEADCOUNT)
                .unit(Unit::Count),
            BoxDef::optional("23", "Individuals subject to withholding")
                .section(HEADCOUNT)
                .unit(Unit::Count),
            BoxDef::raw("24", "Taxable income paid to residents").section(INCOME),
            BoxDef::raw("25", "Taxable income paid to non-residents").section(INCOME),
            BoxDef::derived("26", "Total taxable income paid", bx("24") + bx("25"))
                .section(INCOME),
            BoxDef::raw("27", "Income of residents subject to withholding").section(INCOME),
            BoxDef::raw("28", "Income of non-residents subject to withholding").section(INCOME),
            BoxDef::derived(
                "29",
                "Total income subject to withholding",
                bx("27") + bx("28"),
            )
            .section(INCOME),
            BoxDef::raw("30", "Tax withheld from residents").section(TAX),
            BoxDef::raw("31", "Tax withheld from non-residents").section(TAX),
            BoxDef::derived("32", "Total tax withheld", bx("30") + bx("31")).section(TAX),
            BoxDef::derived("33", "Tax payable", bx("32"))
                .section(TAX)
                .note("provisional: equals tax withheld [32] until the payable rule is confirmed"),
        ],
        bifurcations: Vec::new(),
        carry_in: None,
        carry_out: None,
        checks: Vec::new(),
        schedules: Vec::new(),
    }
}
