use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

/// Left-aligned columns separated by two spaces, with a dashed rule under
/// the header. Cells beyond the header count are printed unpadded.
pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let widths: Vec<usize> = (0..headers.len())
        .map(|col| {
            rows.iter()
                .filter_map(|row| row.get(col))
                .map(|cell| cell.chars().count())
                .fold(headers[col].chars().count(), usize::max)
        })
        .collect();

    let header: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    let rule: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    println!("{}", table_line(&header, &widths));
    println!("{}", table_line(&rule, &widths));
    for row in &rows {
        println!("{}", table_line(row, &widths));
    }
}

fn table_line(cells: &[String], widths: &[usize]) -> String {
    let mut line = String::new();
    for (col, cell) in cells.iter().enumerate() {
        if col > 0 {
            line.push_str("  ");
        }
        line.push_str(cell);
        let pad = widths.get(col).map_or(0, |w| w.saturating_sub(cell.chars().count()));
        line.extend(std::iter::repeat(' ').take(pad));
    }
    line.trim_end().to_string()
}

/// `2026-01-31 14:02` in UTC, or `-`.
pub fn fmt_time(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".into())
}
