//! Period command - manage period chains in a JSON store

use super::{format_vnd, print_json, print_values};
use crate::core::{
    read_raw_input, Error, PeriodChainManager, PeriodId, PeriodLabel, PeriodStore, RawInput,
    SchemaRegistry, TaxPeriod,
};
use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

#[derive(Args, Debug)]
pub struct PeriodCommand {
    /// JSON file holding every period chain
    #[arg(long, global = true, env = "VNTAX_STORE", default_value = "vntax-periods.json")]
    store: PathBuf,

    #[command(subcommand)]
    action: PeriodAction,
}

#[derive(Subcommand, Debug)]
enum PeriodAction {
    /// Open the next period of a chain, carrying in the latest period's carry
    Create {
        /// Taxpayer id (tax code)
        #[arg(short, long)]
        taxpayer: String,
        #[arg(short, long)]
        regime: String,
        /// Period label: 2024, 2024-Q1 or 2024-01
        #[arg(short, long)]
        label: PeriodLabel,
        /// CSV or JSON file of raw box values
        #[arg(short, long)]
        inputs: Option<PathBuf>,
    },
    /// Replace the raw inputs of an open or amended period
    Edit {
        /// <taxpayer>/<regime>/<label>
        id: PeriodId,
        #[arg(short, long)]
        inputs: PathBuf,
    },
    /// Evaluate and lock a period
    Close {
        id: PeriodId,
        #[arg(long)]
        json: bool,
    },
    /// Reopen a locked period for amendment
    Reopen {
        id: PeriodId,
        /// Also amend locked later periods that consumed its carry
        #[arg(long)]
        cascade: bool,
    },
    /// List the periods of a chain
    Chain {
        #[arg(short, long)]
        taxpayer: String,
        #[arg(short, long)]
        regime: String,
        #[arg(long)]
        json: bool,
    },
    /// Show one period with its computed boxes
    Show {
        id: PeriodId,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Tabled)]
struct PeriodRow {
    #[tabled(rename = "Period")]
    label: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Carry In")]
    carry_in: String,
    #[tabled(rename = "Carry Forward")]
    carry_forward: String,
    #[tabled(rename = "Locked")]
    locked_at: String,
    #[tabled(rename = "Amendments")]
    amendments: u32,
    #[tabled(rename = "Digest")]
    digest: String,
}

impl PeriodCommand {
    pub fn exec(&self, registry: Arc<SchemaRegistry>) -> anyhow::Result<()> {
        let store = PeriodStore::new(&self.store);
        let manager = store.open(registry).map_err(Error::from)?;

        match &self.action {
            PeriodAction::Create {
                taxpayer,
                regime,
                label,
                inputs,
            } => {
                let raw = match inputs {
                    Some(path) => read_raw_input(path)?,
                    None => RawInput::new(),
                };
                let id = manager
                    .create_period(taxpayer, regime, *label, raw)
                    .map_err(Error::from)?;
                store.persist(&manager).map_err(Error::from)?;
                println!("created {id}");
            }
            PeriodAction::Edit { id, inputs } => {
                let raw = read_raw_input(inputs)?;
                manager.update_inputs(id, raw).map_err(Error::from)?;
                store.persist(&manager).map_err(Error::from)?;
                println!("updated {id}");
            }
            PeriodAction::Close { id, json } => {
                let period = manager.close_period(id).map_err(Error::from)?;
                store.persist(&manager).map_err(Error::from)?;
                if *json {
                    print_json(&period)?;
                } else {
                    self.print_period(&manager, &period);
                }
            }
            PeriodAction::Reopen { id, cascade } => {
                manager.reopen_period(id, *cascade).map_err(Error::from)?;
                store.persist(&manager).map_err(Error::from)?;
                println!("reopened {id}");
                for p in manager
                    .get_chain(id.taxpayer_id(), id.regime().as_str())
                    .iter()
                    .filter(|p| p.stale)
                {
                    println!("  {} is stale ({}), close it again", p.id, p.status);
                }
            }
            PeriodAction::Chain {
                taxpayer,
                regime,
                json,
            } => {
                let chain = manager.get_chain(taxpayer, regime);
                if *json {
                    print_json(&chain)?;
                } else {
                    self.print_chain(&manager, &chain);
                }
            }
            PeriodAction::Show { id, json } => {
                let period = manager
                    .get_period(id)
                    .ok_or_else(|| Error::from(crate::core::ChainError::NotFound(id.clone())))?;
                if *json {
                    print_json(&period)?;
                } else {
                    self.print_period(&manager, &period);
                }
            }
        }
        Ok(())
    }

    fn carry_in(manager: &PeriodChainManager, period: &TaxPeriod) -> String {
        manager
            .registry()
            .get(period.regime.as_str())
            .and_then(|s| s.carry_in().and_then(|id| period.raw_inputs.get(id)).copied())
            .map(format_vnd)
            .unwrap_or_default()
    }

    fn print_chain(&self, manager: &PeriodChainManager, chain: &[TaxPeriod]) {
        if chain.is_empty() {
            println!("No periods found");
            return;
        }
        let rows: Vec<PeriodRow> = chain
            .iter()
            .map(|p| PeriodRow {
                label: p.label.to_string(),
                status: if p.stale {
                    format!("{} (stale)", p.status)
                } else {
                    p.status.to_string()
                },
                carry_in: Self::carry_in(manager, p),
                carry_forward: p.carry_forward_value.map(format_vnd).unwrap_or_default(),
                locked_at: p
                    .locked_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default(),
                amendments: p.amendments,
                digest: p
                    .snapshot_digest
                    .as_deref()
                    .map(|d| d.chars().take(12).collect::<String>())
                    .unwrap_or_default(),
            })
            .collect();

        println!();
        println!("PERIODS {}/{}", chain[0].taxpayer_id, chain[0].regime);
        println!();
        let table = Table::new(rows)
            .with(Style::rounded())
            .with(Modify::new(Columns::new(2..4)).with(Alignment::right()))
            .to_string();
        println!("{}", table);
    }

    fn print_period(&self, manager: &PeriodChainManager, period: &TaxPeriod) {
        println!("{} {}", period.id, period.status);
        if period.stale {
            println!("stale: an earlier period was amended, close this period again");
        }
        let carry_in = Self::carry_in(manager, period);
        if !carry_in.is_empty() {
            println!("carry in: {carry_in}");
        }
        match &period.computed_snapshot {
            Some(snapshot) => {
                print_values(&period.regime.to_string(), snapshot);
                if let Some(carry) = period.carry_forward_value {
                    println!("carry forward: {}", format_vnd(carry));
                }
            }
            None => println!("not evaluated yet, {} raw values", period.raw_inputs.len()),
        }
    }
}
