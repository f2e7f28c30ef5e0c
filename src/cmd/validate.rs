//! Validate command - check regime definition files without registering them

use crate::core::{read_schema_defs, SchemaRegistry};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ValidateCommand {
    /// Regime definition files (JSON, one definition or an array)
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Output as JSON instead of formatted text
    #[arg(long)]
    json: bool,
}

/// Outcome for one definition
#[derive(Debug, Clone, Serialize)]
struct ValidationResult {
    file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    regime: Option<String>,
    boxes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ValidationOutput {
    valid: usize,
    issue_count: usize,
    results: Vec<ValidationResult>,
}

impl ValidateCommand {
    pub fn exec(&self, registry: &SchemaRegistry) -> anyhow::Result<()> {
        // definitions are checked against a scratch copy, in file order, so a
        // schedule defined in an earlier file can be linked by a later one
        let mut scratch = registry.clone();
        let mut results = Vec::new();

        for path in &self.files {
            let file = path.display().to_string();
            let defs = match read_schema_defs(path) {
                Ok(defs) => defs,
                Err(e) => {
                    results.push(ValidationResult {
                        file,
                        regime: None,
                        boxes: 0,
                        error: Some(format!("{e:#}")),
                    });
                    continue;
                }
            };
            for def in defs {
                let regime = def.regime.to_string();
                let boxes = def.boxes.len();
                let outcome = if scratch.get(&regime).is_some() {
                    scratch.replace(def)
                } else {
                    scratch.register(def)
                };
                results.push(ValidationResult {
                    file: file.clone(),
                    regime: Some(regime),
                    boxes,
                    error: outcome.err().map(|e| e.to_string()),
                });
            }
        }

        let issue_count = results.iter().filter(|r| r.error.is_some()).count();
        if self.json {
            let output = ValidationOutput {
                valid: results.len() - issue_count,
                issue_count,
                results,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            self.print_text(&results, issue_count);
        }

        // Exit with code 1 if issues found
        if issue_count > 0 {
            std::process::exit(1);
        }
        Ok(())
    }

    fn print_text(&self, results: &[ValidationResult], issue_count: usize) {
        println!();
        println!("VALIDATION RESULTS");
        println!();
        for r in results {
            let regime = r.regime.as_deref().unwrap_or("-");
            match &r.error {
                None => println!("\u{2713} {} {} ({} boxes)", r.file, regime, r.boxes),
                Some(e) => {
                    println!("\u{26A0} {} {}", r.file, regime);
                    println!("     {}", e);
                }
            }
        }
        println!();
        if issue_count == 0 {
            println!("\u{2713} No issues found.");
        } else {
            println!("\u{26A0} {} issue(s) found.", issue_count);
        }
    }
}
