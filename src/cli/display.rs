//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::{GroupRow, ValidationResult};

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No groups found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
    }

    let mut output = String::new();
    let header: Vec<String> = headers.iter().map(|h| h.to_uppercase()).collect();
    for line in std::iter::once(header).chain(rows) {
        let cells: Vec<String> = line
            .iter()
            .enumerate()
            .map(|(col, cell)| match widths.get(col) {
                Some(width) => format!("{:width$}", cell, width = *width),
                None => cell.clone(),
            })
            .collect();
        output.push_str(cells.join("   ").trim_end());
        output.push('\n');
    }
    output
}

pub fn format_group_list(groups: &[GroupRow]) -> String {
    let rows = groups
        .iter()
        .map(|g| {
            vec![
                g.name.clone(),
                format!("{:?}", g.kind).to_lowercase(),
                g.target.clone(),
                g.state.clone(),
            ]
        })
        .collect();
    format_table(&["name", "kind", "target", "state"], rows)
}

pub fn format_validation_result(result: &ValidationResult, path: &str) -> String {
    if result.valid {
        format!(
            "✓ {} is valid\n  Groups: {}\n\n{}",
            path,
            result.groups.len(),
            format_group_list(&result.groups)
        )
    } else {
        format!(
            "✗ {} is invalid\n  Error: {}\n",
            path,
            result.error.as_deref().unwrap_or("unknown")
        )
    }
}
