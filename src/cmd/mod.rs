pub mod boxes;
pub mod evaluate;
pub mod period;
pub mod schema;
pub mod validate;

use crate::core::{
    read_schema_defs, schema_files, BoxValues, Error, RegimeId, SchemaRegistry, Unit,
};
use anyhow::Context;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

/// Built-in regimes plus every definition found in `schemas`. A definition
/// for an already registered regime replaces it.
pub fn load_registry(schemas: Option<&Path>) -> anyhow::Result<SchemaRegistry> {
    let mut registry = SchemaRegistry::with_builtin().map_err(Error::from)?;
    let Some(dir) = schemas else {
        return Ok(registry);
    };
    for file in schema_files(dir)? {
        for def in read_schema_defs(&file)? {
            let result = if registry.get(def.regime.as_str()).is_some() {
                log::info!("{}: replacing regime {}", file.display(), def.regime);
                registry.replace(def)
            } else {
                registry.register(def)
            };
            result
                .map_err(Error::from)
                .with_context(|| format!("loading {}", file.display()))?;
        }
    }
    Ok(registry)
}

/// Parse `<regime>=<file>`.
pub fn parse_schedule(s: &str) -> Result<(RegimeId, PathBuf), String> {
    match s.split_once('=') {
        Some((regime, path)) if !regime.is_empty() && !path.is_empty() => {
            Ok((RegimeId::from(regime), PathBuf::from(path)))
        }
        _ => Err(format!("expected <regime>=<file>, got '{s}'")),
    }
}

/// Whole VND with thousands separators; fractions are kept as given.
pub fn format_vnd(amount: Decimal) -> String {
    let s = amount.normalize().abs().to_string();
    let (int, frac) = match s.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (s.as_str(), None),
    };
    let mut out = String::with_capacity(s.len() + int.len() / 3 + 1);
    if amount.is_sign_negative() && !amount.is_zero() {
        out.push('-');
    }
    for (i, c) in int.chars().enumerate() {
        if i > 0 && (int.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    if let Some(frac) = frac {
        out.push('.');
        out.push_str(frac);
    }
    out
}

pub fn format_amount(amount: Decimal, unit: Unit) -> String {
    match unit {
        Unit::Vnd => format_vnd(amount),
        Unit::Count => amount.normalize().to_string(),
        Unit::Percent => format!("{}%", amount.normalize()),
    }
}

/// Row for box value tables and CSV output
#[derive(Debug, Clone, Tabled, Serialize)]
pub struct ValueRow {
    #[tabled(skip)]
    pub regime: String,

    #[tabled(rename = "Section")]
    pub section: String,

    #[tabled(rename = "Box")]
    #[serde(rename = "box")]
    pub box_id: String,

    #[tabled(rename = "Description")]
    pub label: String,

    #[tabled(rename = "Value")]
    #[serde(skip)]
    pub display: String,

    #[tabled(skip)]
    pub value: String,
}

pub fn value_rows(values: &BoxValues) -> Vec<ValueRow> {
    values
        .lines
        .iter()
        .map(|l| ValueRow {
            regime: values.regime.to_string(),
            section: l.section.clone().unwrap_or_default(),
            box_id: l.id.to_string(),
            label: l.label.clone(),
            display: format_amount(l.value, l.unit),
            value: l.value.normalize().to_string(),
        })
        .collect()
}

pub fn print_values(title: &str, values: &BoxValues) {
    println!();
    println!("{}", title.to_uppercase());
    println!();
    let table = Table::new(value_rows(values))
        .with(Style::rounded())
        .with(Modify::new(Columns::last()).with(Alignment::right()))
        .to_string();
    println!("{}", table);
}

pub fn write_values_csv<'a>(values: impl IntoIterator<Item = &'a BoxValues>) -> anyhow::Result<()> {
    let mut wtr = csv::Writer::from_writer(io::stdout());
    for v in values {
        for row in value_rows(v) {
            wtr.serialize(row)?;
        }
    }
    wtr.flush()?;
    Ok(())
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn vnd_grouping() {
        assert_eq!(format_vnd(dec!(0)), "0");
        assert_eq!(format_vnd(dec!(999)), "999");
        assert_eq!(format_vnd(dec!(1000)), "1,000");
        assert_eq!(format_vnd(dec!(20000000)), "20,000,000");
        assert_eq!(format_vnd(dec!(-5000000)), "-5,000,000");
        assert_eq!(format_vnd(dec!(1234567.50)), "1,234,567.5");
        assert_eq!(format_vnd(dec!(-0)), "0");
    }

    #[test]
    fn schedule_argument() {
        let (regime, path) = parse_schedule("cit-03-1a=tests/data/cit_03_1a.csv").unwrap();
        assert_eq!(regime.as_str(), "cit-03-1a");
        assert_eq!(path, PathBuf::from("tests/data/cit_03_1a.csv"));
        assert!(parse_schedule("cit-03-1a").is_err());
        assert!(parse_schedule("=x.csv").is_err());
    }

    #[test]
    fn builtin_registry_without_schema_dir() {
        let registry = load_registry(None).unwrap();
        assert_eq!(registry.regimes().len(), 4);
    }

    #[test]
    fn schema_dir_adds_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("excise.json"),
            r#"{"regime": "excise", "boxes": [{"id": "1", "label": "Base", "kind": "raw"}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("pit.json"),
            r#"{"regime": "pit", "boxes": [{"id": "21", "label": "Headcount", "kind": "raw"}]}"#,
        )
        .unwrap();
        let registry = load_registry(Some(dir.path())).unwrap();
        assert_eq!(registry.regimes().len(), 5);
        assert_eq!(registry.get("pit").unwrap().boxes().len(), 1);
    }

    #[test]
    fn broken_schema_dir_is_a_defect() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bad.json"),
            r#"{"regime": "bad", "boxes": [{"id": "1", "label": "A", "kind": "derived", "formula": {"ref": "2"}}]}"#,
        )
        .unwrap();
        let err = load_registry(Some(dir.path())).unwrap_err();
        assert!(err.downcast_ref::<Error>().is_some_and(Error::is_defect));
    }
}
