//! Evaluate command - derive every box of one return from raw inputs

use super::{format_vnd, parse_schedule, print_json, print_values, write_values_csv};
use crate::core::{read_raw_input, Error, RawInput, RegimeId, SchemaRegistry};
use clap::Args;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct EvaluateCommand {
    /// Regime to evaluate (vat, pit, cit, cit-03-1a or a loaded one)
    #[arg(short, long)]
    regime: String,

    /// CSV or JSON file of raw box values. Reads from stdin if not specified.
    #[arg(short, long, default_value = "-")]
    inputs: PathBuf,

    /// Carry-forward value of the prior period
    #[arg(long, default_value_t = Decimal::ZERO, allow_negative_numbers = true)]
    carry: Decimal,

    /// Supplementary schedule inputs, e.g. cit-03-1a=schedule.csv
    #[arg(long = "schedule", value_parser = parse_schedule)]
    schedules: Vec<(RegimeId, PathBuf)>,

    /// Output as JSON instead of formatted tables
    #[arg(long, conflicts_with = "csv")]
    json: bool,

    /// Output as CSV
    #[arg(long)]
    csv: bool,
}

impl EvaluateCommand {
    pub fn exec(&self, registry: &SchemaRegistry) -> anyhow::Result<()> {
        let raw = read_raw_input(&self.inputs)?;
        let mut schedules: BTreeMap<RegimeId, RawInput> = BTreeMap::new();
        for (regime, path) in &self.schedules {
            if schedules.insert(regime.clone(), read_raw_input(path)?).is_some() {
                anyhow::bail!("schedule {regime} given more than once");
            }
        }

        let filing = registry
            .evaluate_with_schedules(&self.regime, &raw, &schedules, self.carry)
            .map_err(Error::from)?;

        if self.json {
            return print_json(&filing);
        }
        if self.csv {
            return write_values_csv(filing.schedules.iter().chain([&filing.main]));
        }

        let title = |regime: &RegimeId| match registry.get(regime.as_str()) {
            Some(s) if !s.title().is_empty() => s.title().to_string(),
            _ => regime.to_string(),
        };
        for schedule in &filing.schedules {
            print_values(&title(&schedule.regime), schedule);
        }
        print_values(&title(&filing.main.regime), &filing.main);

        let schema = registry.require(&self.regime).map_err(Error::from)?;

        println!();
        if let (Some(id), Some(carry)) = (schema.carry_out(), filing.main.carry_forward) {
            println!("Carry forward [{}]: {}", id, format_vnd(carry));
        }
        println!("Snapshot digest: {}", filing.main.digest());
        Ok(())
    }
}
