//! Reading task sources from files or stdin.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use braid_core::domain::SourceUnit;
use tokio::io::AsyncReadExt;

const UNIT_SEPARATOR: &str = "---";

/// Splits a document into source units on `---` lines.
///
/// Each unit's origin is `name:line`, the line where the unit starts.
pub fn split_units(text: &str, name: &str) -> Vec<SourceUnit> {
    let mut units = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut start = 1;

    for (index, line) in text.lines().enumerate() {
        if line.trim() == UNIT_SEPARATOR {
            push_unit(&mut units, &current, name, start);
            current.clear();
            start = index + 2;
        } else {
            current.push(line);
        }
    }
    push_unit(&mut units, &current, name, start);
    units
}

fn push_unit(units: &mut Vec<SourceUnit>, lines: &[&str], name: &str, start: usize) {
    // 区切りだけの空ユニットは無視（classifier に EmptyUnit を出させない）
    if lines.iter().all(|l| l.trim().is_empty()) {
        return;
    }
    units.push(SourceUnit::new(lines.join("\n"), format!("{name}:{start}")));
}

async fn read_one(path: &Path) -> Result<(String, String)> {
    if path == Path::new("-") {
        let mut text = String::new();
        tokio::io::stdin()
            .read_to_string(&mut text)
            .await
            .context("failed to read sources from stdin")?;
        return Ok((text, "stdin".to_string()));
    }
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read source file {}", path.display()))?;
    Ok((text, path.display().to_string()))
}

pub async fn read_sources(paths: &[PathBuf]) -> Result<Vec<SourceUnit>> {
    let mut units = Vec::new();
    for path in paths {
        let (text, name) = read_one(path).await?;
        units.extend(split_units(&text, &name));
    }
    Ok(units)
}
