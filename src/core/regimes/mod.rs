pub mod cit;
pub mod cit_03_1a;
pub mod pit;
pub mod vat;

use super::schema::SchemaDef;

/// Built-in regimes. Schedules come before the returns that link them.
pub fn builtin() -> Vec<SchemaDef> {
    vec![
        vat::schema(),
        pit::schema(),
        cit_03_1a::schema(),
        cit::schema(),
    ]
}
