//! Plain-text tables for benchmark results, as CSV or markdown.

use crate::error::{Result, TelemetryError};
use crate::stats::StatStream;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

/// One table cell. Floats print with 4 decimals, ints right aligned in 4.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Int(i64),
    Float(f64),
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Text(s) => f.write_str(s),
            Cell::Int(v) => write!(f, "{:4}", v),
            Cell::Float(v) => write!(f, "{:.4}", v),
        }
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Text(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::Text(s)
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Cell::Int(v)
    }
}

impl From<u64> for Cell {
    fn from(v: u64) -> Self {
        Cell::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Float(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableFormat {
    #[default]
    Csv,
    Markdown,
}

impl FromStr for TableFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(TableFormat::Csv),
            "md" | "markdown" => Ok(TableFormat::Markdown),
            other => Err(TelemetryError::config(format!("unknown table format {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
    widths: Vec<usize>,
}

fn pad_right_aligned(out: &mut String, text: &str, width: usize) {
    let missing = width.saturating_sub(text.chars().count());
    out.extend(std::iter::repeat(' ').take(missing));
    out.push_str(text);
}

impl Table {
    /// Fails with an uneven-table error when a row's length differs from the
    /// header's.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Result<Self> {
        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(TelemetryError::report(format!(
                    "Row ({}) has not the correct number of columns {} != {}",
                    i,
                    row.len(),
                    columns.len()
                )));
            }
        }

        // 列宽 = 最长的格式化内容 + 两侧各一个空格
        let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count() + 2).collect();
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.to_string().chars().count() + 2);
            }
        }

        Ok(Self {
            columns,
            rows,
            widths,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    fn render_row(&self, out: &mut String, cells: impl Iterator<Item = String>, format: TableFormat) {
        if format == TableFormat::Markdown {
            out.push('|');
        }
        let last = self.widths.len().saturating_sub(1);
        for (i, (text, &width)) in cells.zip(&self.widths).enumerate() {
            pad_right_aligned(out, &format!(" {} ", text), width);
            match format {
                TableFormat::Markdown => out.push('|'),
                TableFormat::Csv if i < last => out.push(','),
                TableFormat::Csv => {}
            }
        }
        out.push('\n');
    }

    pub fn render(&self, format: TableFormat, header: bool) -> String {
        let mut out = String::new();
        if header {
            self.render_row(&mut out, self.columns.iter().cloned(), format);
            if format == TableFormat::Markdown {
                out.push('|');
                for &width in &self.widths {
                    out.push_str(&"-".repeat(width.saturating_sub(1)));
                    out.push_str(":|");
                }
                out.push('\n');
            }
        }
        for row in &self.rows {
            self.render_row(&mut out, row.iter().map(|c| c.to_string()), format);
        }
        out
    }

    pub fn write_to<W: Write>(&self, writer: &mut W, format: TableFormat, header: bool) -> Result<()> {
        writer.write_all(self.render(format, header).as_bytes())?;
        Ok(())
    }

    /// Appends to `path`, writing the header only when the file is new.
    pub fn append_to(&self, path: impl AsRef<Path>, format: TableFormat) -> Result<()> {
        let path = path.as_ref();
        let header = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        self.write_to(&mut file, format, header)?;
        log::debug!("Appended {} rows to {:?}", self.rows.len(), path);
        Ok(())
    }
}

/// Builds the `Name, Average, SD, Min, Max, Total, Count` table.
pub fn stat_stream_table(names: &[&str], stats: &[StatStream]) -> Result<Table> {
    let columns = ["Name", "Average", "SD", "Min", "Max", "Total", "Count"]
        .iter()
        .map(|c| c.to_string())
        .collect();
    let rows = names
        .iter()
        .zip(stats)
        .map(|(name, s)| {
            vec![
                Cell::from(*name),
                Cell::from(s.avg()),
                Cell::from(s.sd()),
                Cell::from(s.min()),
                Cell::from(s.max()),
                Cell::from(s.total()),
                Cell::from(s.count()),
            ]
        })
        .collect();
    Table::new(columns, rows)
}

/// Writes the table to `writer` and, when given, appends it to `path`.
pub fn print_table<W: Write>(
    table: &Table,
    writer: &mut W,
    format: TableFormat,
    path: Option<&Path>,
) -> Result<()> {
    table.write_to(writer, format, true)?;
    if let Some(path) = path {
        table.append_to(path, format)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::new(
            vec!["A".into(), "B".into(), "C".into()],
            vec![
                vec!["qwerty".into(), Cell::Float(1.23456789), Cell::Int(7)],
                vec!["q".into(), Cell::Float(10.5), Cell::Int(12345)],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_uneven_rows_are_rejected() {
        let err = Table::new(vec!["A".into(), "B".into()], vec![vec![Cell::Int(1)]]).unwrap_err();
        assert!(matches!(err, TelemetryError::Report { .. }));
    }

    #[test]
    fn test_csv() {
        let expected = concat!(
            "      A ,       B ,     C \n",
            " qwerty ,  1.2346 ,     7 \n",
            "      q , 10.5000 , 12345 \n",
        );
        assert_eq!(sample().render(TableFormat::Csv, true), expected);
        assert_eq!(
            sample().render(TableFormat::Csv, false).lines().count(),
            2
        );
    }

    #[test]
    fn test_markdown() {
        let expected = concat!(
            "|      A |       B |     C |\n",
            "|-------:|--------:|------:|\n",
            "| qwerty |  1.2346 |     7 |\n",
            "|      q | 10.5000 | 12345 |\n",
        );
        assert_eq!(sample().render(TableFormat::Markdown, true), expected);
    }

    #[test]
    fn test_append_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        let table = sample();
        table.append_to(&path, TableFormat::Csv).unwrap();
        table.append_to(&path, TableFormat::Csv).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches(" A ,").count(), 1);
        assert_eq!(content.lines().count(), 5);
    }

    #[test]
    fn test_stat_stream_table() {
        let mut s = StatStream::new();
        s.update(1.0);
        s.update(3.0);
        let table = stat_stream_table(&["rate"], &[s]).unwrap();
        assert_eq!(table.columns().len(), 7);
        assert_eq!(table.rows()[0][1], Cell::Float(2.0));
        assert_eq!(table.rows()[0][6], Cell::Int(2));
    }
}
