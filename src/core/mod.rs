pub mod engine;
pub mod error;
pub mod expr;
pub mod input;
pub mod label;
pub mod period;
pub mod regimes;
pub mod registry;
pub mod schema;
pub mod store;

// Flat public surface for domain types and functions.
#[allow(unused_imports)]
pub use engine::{bifurcate, evaluate, BoxLine, BoxValues, EvalError, RawInput};
pub use error::{Error, Result};
pub use expr::{bx, BoxId, Expr};
pub use input::{read_raw_input, read_schema_defs, schema_files, CsvField, InputRow};
pub use label::{Granularity, PeriodLabel};
#[allow(unused_imports)]
pub use period::{ChainError, PeriodChainManager, PeriodId, PeriodStatus, TaxPeriod};
#[allow(unused_imports)]
pub use registry::{Filing, SchemaRegistry};
#[allow(unused_imports)]
pub use schema::{
    Bifurcation, BoxDef, BoxKind, Check, CheckOp, RegimeId, RegimeSchema, ScheduleLink, SchemaDef,
    SchemaError, Unit,
};
#[allow(unused_imports)]
pub use store::{PeriodStore, StoreDocument, StoreError};
