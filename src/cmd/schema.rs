//! Schema command - print expected input formats

use super::print_json;
use crate::core::{Error, InputRow, SchemaDef, SchemaRegistry, StoreDocument};
use clap::Args;
use schemars::schema_for;

#[derive(Args, Debug)]
pub struct SchemaCommand {
    /// Output format
    #[arg(value_enum, default_value = "json-schema")]
    format: SchemaFormat,

    /// Regime for regime-def. All registered regimes if not specified.
    #[arg(short, long)]
    regime: Option<String>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum SchemaFormat {
    /// JSON Schema for regime definition files
    JsonSchema,
    /// JSON Schema for the period store file
    StoreSchema,
    /// CSV header row with column names
    CsvHeader,
    /// CSV column descriptions
    CsvFields,
    /// Definition of a registered regime, a template for custom regimes
    RegimeDef,
}

impl SchemaCommand {
    pub fn exec(&self, registry: &SchemaRegistry) -> anyhow::Result<()> {
        match self.format {
            SchemaFormat::JsonSchema => print_json(&schema_for!(SchemaDef)),
            SchemaFormat::StoreSchema => print_json(&schema_for!(StoreDocument)),
            SchemaFormat::CsvHeader => {
                println!("{}", InputRow::csv_header().join(","));
                Ok(())
            }
            SchemaFormat::CsvFields => {
                self.print_csv_fields();
                Ok(())
            }
            SchemaFormat::RegimeDef => self.print_regime_defs(registry),
        }
    }

    fn print_csv_fields(&self) {
        println!("CSV Input Format");
        println!("================");
        println!();
        for field in InputRow::csv_schema() {
            let req = if field.required { "required" } else { "optional" };
            let example = field.example.map(|e| format!(" (e.g. {e})")).unwrap_or_default();
            println!("{:8} ({:8})  {}{}", field.name, req, field.description, example);
        }
        println!();
        println!("One row per raw box. Unlisted boxes use their declared default.");
        println!("JSON input is an object of box id to amount: {{\"25\": 1000000}}");
    }

    fn print_regime_defs(&self, registry: &SchemaRegistry) -> anyhow::Result<()> {
        match &self.regime {
            Some(regime) => {
                let schema = registry.require(regime).map_err(Error::from)?;
                print_json(schema.definition())
            }
            None => {
                let defs: Vec<SchemaDef> = registry
                    .regimes()
                    .into_iter()
                    .filter_map(|id| registry.get(id.as_str()))
                    .map(|s| s.definition().clone())
                    .collect();
                print_json(&defs)
            }
        }
    }
}
