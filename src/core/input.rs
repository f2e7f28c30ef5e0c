//! Readers for raw box inputs and external schema definitions.
//!
//! Raw inputs come either as CSV with one `box,value` row per declared box
//! or as a JSON object `{"25": 1000000, "31": "20000000"}`. `-` reads stdin
//! and sniffs the format from the first character.

use super::engine::RawInput;
use super::expr::BoxId;
use super::schema::SchemaDef;
use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use vntax_derive::CsvSchema;

/// Column of a CSV input file, generated by `#[derive(CsvSchema)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvField {
    pub name: &'static str,
    pub required: bool,
    pub description: &'static str,
    pub example: Option<&'static str>,
}

/// One declared box in a CSV input file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, CsvSchema)]
pub struct InputRow {
    /// Box id as printed on the form, e.g. 25, 29a, C7
    #[serde(rename = "box")]
    #[csv(example = "25")]
    pub box_id: String,
    /// Declared amount in whole VND, negative for decreasing adjustments
    #[csv(example = "1000000")]
    pub value: Decimal,
    /// Free text, ignored by the engine
    #[serde(default)]
    #[csv(example = "input VAT per purchase ledger")]
    pub note: Option<String>,
}

fn insert(raw: &mut RawInput, box_id: &str, value: Decimal) -> anyhow::Result<()> {
    let id = box_id.trim();
    if id.is_empty() {
        anyhow::bail!("empty box id");
    }
    if raw.insert(BoxId::from(id), value).is_some() {
        anyhow::bail!("box [{id}] given more than once");
    }
    Ok(())
}

pub fn read_csv<R: Read>(reader: R) -> anyhow::Result<RawInput> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let mut raw = RawInput::new();
    for (line, row) in rdr.deserialize::<InputRow>().enumerate() {
        // header is line 1
        let row = row.with_context(|| format!("invalid CSV row at line {}", line + 2))?;
        insert(&mut raw, &row.box_id, row.value)
            .with_context(|| format!("line {}", line + 2))?;
    }
    Ok(raw)
}

pub fn read_json<R: Read>(reader: R) -> anyhow::Result<RawInput> {
    let values: BTreeMap<String, Decimal> =
        serde_json::from_reader(reader).context("expected a JSON object of box id to amount")?;
    let mut raw = RawInput::new();
    for (id, value) in values {
        insert(&mut raw, &id, value)?;
    }
    Ok(raw)
}

/// Read raw inputs from a file (CSV unless the extension is `.json`), or
/// from stdin with `-`.
pub fn read_raw_input(path: &Path) -> anyhow::Result<RawInput> {
    if path.as_os_str() == "-" {
        return read_stdin();
    }
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let reader = BufReader::new(file);
    let raw = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => read_json(reader),
        _ => read_csv(reader),
    }
    .with_context(|| format!("reading {}", path.display()))?;
    log::debug!("read {} box values from {}", raw.len(), path.display());
    Ok(raw)
}

fn read_stdin() -> anyhow::Result<RawInput> {
    let mut buffer = Vec::new();
    io::stdin().lock().read_to_end(&mut buffer)?;

    match buffer.iter().find(|b| !b.is_ascii_whitespace()) {
        None => anyhow::bail!("No input received. Provide a file or pipe data to stdin."),
        Some(b'{') => read_json(io::Cursor::new(buffer)),
        Some(_) => read_csv(io::Cursor::new(buffer)),
    }
}

/// A schema file holds one definition or an array of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum SchemaFile {
    One(Box<SchemaDef>),
    Many(Vec<SchemaDef>),
}

pub fn read_schema_defs(path: &Path) -> anyhow::Result<Vec<SchemaDef>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let parsed: SchemaFile = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("invalid schema definition in {}", path.display()))?;
    Ok(match parsed {
        SchemaFile::One(def) => vec![*def],
        SchemaFile::Many(defs) => defs,
    })
}

/// `*.json` files of a directory in file name order.
pub fn schema_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = fs::read_dir(dir)
        .with_context(|| format!("cannot read schema directory {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    files.retain(|p| p.extension().is_some_and(|e| e == "json"));
    files.sort();
    Ok(files)
}
