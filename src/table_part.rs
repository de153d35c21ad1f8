//! table_part.rs — column-major payload model and cell XML emission.

use anyhow::{Result, bail};
use quick_xml::Writer;
use quick_xml::events::BytesText;
use std::io::Write;

/// A single scalar cell value.
///
/// `Empty` never produces a cell element; inside an overwrite it clears
/// whatever was at the target coordinate.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Number(f64),
    Bool(bool),
    Text(String),
    Empty,
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Number(v)
    }
}
impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Cell::Number(v as f64)
    }
}
impl From<i32> for Cell {
    fn from(v: i32) -> Self {
        Cell::Number(v.into())
    }
}
impl From<bool> for Cell {
    fn from(v: bool) -> Self {
        Cell::Bool(v)
    }
}
impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::Text(v.to_owned())
    }
}
impl From<String> for Cell {
    fn from(v: String) -> Self {
        Cell::Text(v)
    }
}
impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(v: Option<T>) -> Self {
        v.map_or(Cell::Empty, Into::into)
    }
}

/// A named column of row-aligned scalars.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub cells: Vec<Cell>,
}

/// The tabular payload: an ordered sequence of named columns.
///
/// All columns must hold the same number of cells; a header-only table
/// (columns with zero cells) is valid.
#[derive(Debug, Clone, Default)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column<N, I, C>(mut self, name: N, cells: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = C>,
        C: Into<Cell>,
    {
        self.push_column(name, cells);
        self
    }

    pub fn push_column<N, I, C>(&mut self, name: N, cells: I)
    where
        N: Into<String>,
        I: IntoIterator<Item = C>,
        C: Into<Cell>,
    {
        self.columns.push(Column {
            name: name.into(),
            cells: cells.into_iter().map(Into::into).collect(),
        });
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Number of data rows (the header row is not counted).
    pub fn height(&self) -> usize {
        self.columns.first().map_or(0, |c| c.cells.len())
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            bail!("payload has no columns");
        }
        let height = self.height();
        for col in &self.columns {
            if col.cells.len() != height {
                bail!(
                    "column '{}' has {} rows, expected {}",
                    col.name,
                    col.cells.len(),
                    height
                );
            }
        }
        Ok(())
    }

    /// Materializes the rows to write, honoring the header and index flags.
    pub(crate) fn to_rows(&self, write: &WriteOptions) -> Vec<Vec<Cell>> {
        let mut rows = Vec::with_capacity(self.height() + 1);
        if write.header {
            let mut head = Vec::with_capacity(self.width() + 1);
            if write.index {
                head.push(Cell::Empty);
            }
            head.extend(self.columns.iter().map(|c| Cell::Text(c.name.clone())));
            rows.push(head);
        }
        for r in 0..self.height() {
            let mut row = Vec::with_capacity(self.width() + 1);
            if write.index {
                row.push(Cell::Number(r as f64));
            }
            row.extend(self.columns.iter().map(|c| c.cells[r].clone()));
            rows.push(row);
        }
        rows
    }
}

/// Formatting flags for a single write.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Emit the column names as the first row of the block.
    pub header: bool,
    /// Emit a leading 0-based row-index column with a blank header cell.
    pub index: bool,
    /// Accepted for call-site compatibility and ignored; the built-in
    /// writer is always used.
    pub engine: Option<String>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            header: true,
            index: false,
            engine: None,
        }
    }
}

/// Positioning and targeting options for one append call.
#[derive(Debug, Clone)]
pub struct AppendOptions {
    /// Target sheet, created if absent.
    pub sheet_name: String,
    /// 0-based row of the block's top edge. `None` resolves to one past
    /// the last occupied row of the target sheet; `Some(0)` overwrites
    /// from the top.
    pub start_row: Option<u32>,
    /// 0-based column of the block's left edge. Never auto-detected.
    pub start_col: u32,
    /// Discard the sheet's prior content before writing.
    pub truncate_sheet: bool,
    pub write: WriteOptions,
}

impl Default for AppendOptions {
    fn default() -> Self {
        Self {
            sheet_name: "Sheet1".to_owned(),
            start_row: None,
            start_col: 0,
            truncate_sheet: false,
            write: WriteOptions::default(),
        }
    }
}

/// 0-based column index to Excel letters (0 -> "A", 26 -> "AA").
pub(crate) fn col_letters(mut idx: u32) -> String {
    let mut s = String::new();
    loop {
        let rem = idx % 26;
        s.insert(0, (b'A' + rem as u8) as char);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    s
}

/// Excel column letters to their 0-based index ("A" -> 0, "AA" -> 26).
pub(crate) fn letters_to_col(s: &str) -> u32 {
    s.bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .fold(0u32, |acc, b| {
            acc * 26 + (b.to_ascii_uppercase() - b'A' + 1) as u32
        })
        .saturating_sub(1)
}

fn write_cell<W: Write>(w: &mut Writer<W>, coord: &str, cell: &Cell) -> std::io::Result<()> {
    match cell {
        Cell::Empty => Ok(()),
        Cell::Number(n) => {
            w.create_element("c")
                .with_attribute(("r", coord))
                .write_inner_content(|w2| {
                    w2.create_element("v")
                        .write_text_content(BytesText::new(&n.to_string()))?;
                    Ok(())
                })?;
            Ok(())
        }
        Cell::Bool(b) => {
            w.create_element("c")
                .with_attribute(("r", coord))
                .with_attribute(("t", "b"))
                .write_inner_content(|w2| {
                    w2.create_element("v")
                        .write_text_content(BytesText::new(if *b { "1" } else { "0" }))?;
                    Ok(())
                })?;
            Ok(())
        }
        Cell::Text(s) => {
            w.create_element("c")
                .with_attribute(("r", coord))
                .with_attribute(("t", "inlineStr"))
                .write_inner_content(|w2| {
                    w2.create_element("is").write_inner_content(|w3| {
                        w3.create_element("t")
                            .write_text_content(BytesText::new(s))?;
                        Ok(())
                    })?;
                    Ok(())
                })?;
            Ok(())
        }
    }
}

/// XML for one cell element, or `None` for an empty cell.
pub(crate) fn cell_xml(coord: &str, cell: &Cell) -> Result<Option<Vec<u8>>> {
    if matches!(cell, Cell::Empty) {
        return Ok(None);
    }
    let mut writer = Writer::new(Vec::new());
    write_cell(&mut writer, coord, cell)?;
    Ok(Some(writer.into_inner()))
}

/// XML for a whole new `<row>` element starting at `start_col`.
pub(crate) fn row_xml(row: u32, start_col: u32, cells: &[Cell]) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    writer
        .create_element("row")
        .with_attribute(("r", row.to_string().as_str()))
        .write_inner_content(|w| {
            for (j, cell) in cells.iter().enumerate() {
                let coord = format!("{}{}", col_letters(start_col + j as u32), row);
                write_cell(w, &coord, cell)?;
            }
            Ok(())
        })?;
    Ok(writer.into_inner())
}
