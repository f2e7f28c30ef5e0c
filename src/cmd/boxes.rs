//! Boxes command - show the box layout of a regime

use super::{format_vnd, print_json};
use crate::core::{BoxDef, BoxKind, Error, RegimeSchema, SchemaRegistry};
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

#[derive(Args, Debug)]
pub struct BoxesCommand {
    /// Regime to describe. Lists registered regimes if not specified.
    #[arg(short, long)]
    regime: Option<String>,

    /// Output the regime definition as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Tabled)]
struct BoxRow {
    #[tabled(rename = "Box")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Description")]
    label: String,
    #[tabled(rename = "Formula")]
    formula: String,
}

#[derive(Debug, Tabled)]
struct RegimeRow {
    #[tabled(rename = "Regime")]
    id: String,
    #[tabled(rename = "Title")]
    title: String,
    #[tabled(rename = "Boxes")]
    boxes: usize,
    #[tabled(rename = "Carry")]
    carry: String,
}

impl BoxesCommand {
    pub fn exec(&self, registry: &SchemaRegistry) -> anyhow::Result<()> {
        let Some(regime) = &self.regime else {
            self.print_regimes(registry);
            return Ok(());
        };
        let schema = registry.require(regime).map_err(Error::from)?;
        if self.json {
            return print_json(schema.definition());
        }
        self.print_layout(&schema);
        Ok(())
    }

    fn print_regimes(&self, registry: &SchemaRegistry) {
        let rows: Vec<RegimeRow> = registry
            .regimes()
            .into_iter()
            .filter_map(|id| registry.get(id.as_str()))
            .map(|s| RegimeRow {
                id: s.regime().to_string(),
                title: s.title().to_string(),
                boxes: s.boxes().len(),
                carry: match (s.carry_in(), s.carry_out()) {
                    (Some(i), Some(o)) => format!("[{o}] -> [{i}]"),
                    _ => String::new(),
                },
            })
            .collect();
        println!("{}", Table::new(rows).with(Style::rounded()));
    }

    fn print_layout(&self, schema: &RegimeSchema) {
        let rows: Vec<BoxRow> = schema
            .boxes()
            .iter()
            .map(|b| BoxRow {
                id: b.id.to_string(),
                kind: kind(schema, b),
                label: match &b.note {
                    Some(note) => format!("{} ({note})", b.label),
                    None => b.label.clone(),
                },
                formula: formula(schema, b),
            })
            .collect();

        println!();
        println!("{} ({})", schema.title(), schema.regime());
        println!();
        println!("{}", Table::new(rows).with(Style::rounded()));

        for check in schema.checks() {
            println!("check: {} {} {} ({})", check.lhs, check.op, check.rhs, check.message);
        }
        for link in schema.schedules() {
            println!(
                "schedule: {} [{}] feeds [{}]",
                link.schedule, link.source, link.target
            );
        }
    }
}

fn kind(schema: &RegimeSchema, b: &BoxDef) -> String {
    let mut kind = match &b.kind {
        BoxKind::Raw { default: None } => "raw".to_string(),
        BoxKind::Raw {
            default: Some(default),
        } => format!("raw (default {})", format_vnd(*default)),
        BoxKind::Derived { formula: Some(_) } => "derived".to_string(),
        BoxKind::Derived { formula: None } => "split".to_string(),
    };
    if schema.carry_in() == Some(&b.id) {
        kind.push_str(", carry in");
    }
    if schema.carry_out() == Some(&b.id) {
        kind.push_str(", carry out");
    }
    kind
}

fn formula(schema: &RegimeSchema, b: &BoxDef) -> String {
    if let Some(f) = b.formula() {
        return f.to_string();
    }
    match schema.bifurcation_for(b.id.as_str()) {
        Some(bif) if bif.positive == b.id => format!("max({}, 0)", bif.base),
        Some(bif) => format!("max(-({}), 0)", bif.base),
        None => String::new(),
    }
}
