use crate::table_part::{col_letters, letters_to_col};
use crate::{
    AppendOptions, Cell, Table, WriteOptions, XlsxWorkbook, append_table, attr_value, sheet_names,
};
use anyhow::Result;
use quick_xml::{Reader, events::Event};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

fn people() -> Table {
    Table::new()
        .with_column("Name", ["Alice", "Bob", "Cleo"])
        .with_column("Age", [22.0, 35.0, 58.0])
}

fn scores() -> Table {
    Table::new().with_column("Score", [1.0, 2.0])
}

fn on_sheet(name: &str) -> AppendOptions {
    AppendOptions {
        sheet_name: name.to_owned(),
        ..AppendOptions::default()
    }
}

/// "B3" -> 0-based (row, col).
fn parse_coord(r: &str) -> (u32, u32) {
    let split = r.find(|c: char| c.is_ascii_digit()).unwrap_or(r.len());
    let col = letters_to_col(&r[..split]);
    let row = r[split..].parse::<u32>().unwrap_or(1) - 1;
    (row, col)
}

/// Reads every non-empty cell of a sheet back as raw value text, keyed by
/// 0-based (row, col).
fn read_cells(path: &Path, sheet: &str) -> Result<BTreeMap<(u32, u32), String>> {
    let mut wb = XlsxWorkbook::open(path)?;
    wb.select_sheet(sheet)?;

    let mut reader = Reader::from_reader(wb.sheet_xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut cells = BTreeMap::new();
    let mut coord: Option<(u32, u32)> = None;
    let mut in_value = false;
    loop {
        match reader.read_event()? {
            Event::Start(ref e) | Event::Empty(ref e) if e.name().as_ref() == b"c" => {
                coord = attr_value(e, b"r").map(|r| parse_coord(&r));
            }
            Event::Start(ref e) if matches!(e.name().as_ref(), b"v" | b"t") => in_value = true,
            Event::End(ref e) if matches!(e.name().as_ref(), b"v" | b"t") => in_value = false,
            Event::Text(t) if in_value => {
                if let Some(c) = coord {
                    let decoded = t.decode()?;
                    cells.insert(c, quick_xml::escape::unescape(&decoded)?.into_owned());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(cells)
}

#[test]
fn creates_workbook_on_missing_path() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fresh.xlsx");

    append_table(&path, &people(), &AppendOptions::default())?;

    assert_eq!(sheet_names(&path)?, vec!["Sheet1"]);
    let cells = read_cells(&path, "Sheet1")?;
    assert_eq!(cells[&(0, 0)], "Name");
    assert_eq!(cells[&(0, 1)], "Age");
    assert_eq!(cells[&(1, 0)], "Alice");
    assert_eq!(cells[&(3, 1)], "58");
    assert_eq!(cells.len(), 8);
    Ok(())
}

#[test]
fn custom_sheet_name_on_fresh_workbook() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fresh.xlsx");

    append_table(&path, &scores(), &on_sheet("Data"))?;

    assert_eq!(sheet_names(&path)?, vec!["Data"]);
    assert_eq!(read_cells(&path, "Data")?[&(0, 0)], "Score");
    Ok(())
}

#[test]
fn appends_below_existing_rows() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("grow.xlsx");

    append_table(&path, &people(), &AppendOptions::default())?;
    append_table(&path, &people(), &AppendOptions::default())?;

    let cells = read_cells(&path, "Sheet1")?;
    // first block untouched
    assert_eq!(cells[&(0, 0)], "Name");
    assert_eq!(cells[&(1, 0)], "Alice");
    // second block starts right after the 4 occupied rows
    assert_eq!(cells[&(4, 0)], "Name");
    assert_eq!(cells[&(5, 0)], "Alice");
    assert_eq!(cells[&(7, 1)], "58");
    assert_eq!(cells.len(), 16);
    Ok(())
}

#[test]
fn explicit_start_row_zero_overwrites_from_top() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("overwrite.xlsx");

    append_table(&path, &people(), &AppendOptions::default())?;

    let flags = Table::new().with_column("Flag", [true]);
    append_table(
        &path,
        &flags,
        &AppendOptions {
            start_row: Some(0),
            ..AppendOptions::default()
        },
    )?;

    let cells = read_cells(&path, "Sheet1")?;
    assert_eq!(cells[&(0, 0)], "Flag");
    assert_eq!(cells[&(1, 0)], "1");
    // outside the 2x1 rectangle nothing moved
    assert_eq!(cells[&(0, 1)], "Age");
    assert_eq!(cells[&(1, 1)], "22");
    assert_eq!(cells[&(2, 0)], "Bob");
    Ok(())
}

#[test]
fn truncate_discards_prior_content() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("trunc.xlsx");

    append_table(&path, &people(), &AppendOptions::default())?;
    append_table(
        &path,
        &scores(),
        &AppendOptions {
            truncate_sheet: true,
            ..AppendOptions::default()
        },
    )?;

    let cells = read_cells(&path, "Sheet1")?;
    assert_eq!(cells[&(0, 0)], "Score");
    assert_eq!(cells[&(1, 0)], "1");
    assert_eq!(cells[&(2, 0)], "2");
    assert_eq!(cells.len(), 3);
    assert_eq!(sheet_names(&path)?, vec!["Sheet1"]);
    Ok(())
}

#[test]
fn other_sheets_are_preserved() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("multi.xlsx");

    append_table(&path, &people(), &AppendOptions::default())?;
    append_table(&path, &scores(), &on_sheet("Summary"))?;

    assert_eq!(sheet_names(&path)?, vec!["Sheet1", "Summary"]);
    let sheet1 = read_cells(&path, "Sheet1")?;
    assert_eq!(sheet1[&(0, 0)], "Name");
    assert_eq!(sheet1[&(3, 1)], "58");
    assert_eq!(sheet1.len(), 8);
    let summary = read_cells(&path, "Summary")?;
    assert_eq!(summary[&(0, 0)], "Score");
    assert_eq!(summary.len(), 3);
    Ok(())
}

#[test]
fn side_by_side_blocks_do_not_clobber_each_other() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("wide.xlsx");

    let cities = Table::new()
        .with_column("City", ["Oslo", "Lima", "Pune"])
        .with_column("Pop", [0.7, 10.0, 7.4]);

    append_table(
        &path,
        &people(),
        &AppendOptions {
            start_row: Some(0),
            ..AppendOptions::default()
        },
    )?;
    append_table(
        &path,
        &cities,
        &AppendOptions {
            start_row: Some(0),
            start_col: 3,
            ..AppendOptions::default()
        },
    )?;

    let cells = read_cells(&path, "Sheet1")?;
    // left block intact
    assert_eq!(cells[&(0, 0)], "Name");
    assert_eq!(cells[&(3, 1)], "58");
    // right block in place
    assert_eq!(cells[&(0, 3)], "City");
    assert_eq!(cells[&(1, 3)], "Oslo");
    assert_eq!(cells[&(3, 4)], "7.4");
    // the gap column stayed empty
    assert!(!cells.keys().any(|&(_, c)| c == 2));
    assert_eq!(cells.len(), 16);
    Ok(())
}

#[test]
fn block_can_overlap_and_extend_past_existing_rows() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("mixed.xlsx");

    append_table(&path, &people(), &AppendOptions::default())?;
    append_table(
        &path,
        &scores(),
        &AppendOptions {
            start_row: Some(3),
            ..AppendOptions::default()
        },
    )?;

    let cells = read_cells(&path, "Sheet1")?;
    // row 3 existed and got its first column replaced
    assert_eq!(cells[&(3, 0)], "Score");
    assert_eq!(cells[&(3, 1)], "58");
    // rows 4 and 5 are new
    assert_eq!(cells[&(4, 0)], "1");
    assert_eq!(cells[&(5, 0)], "2");
    Ok(())
}

#[test]
fn writes_typed_cells() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("typed.xlsx");

    let table = Table::new()
        .with_column("Label", [Cell::Text("x".into()), Cell::Empty])
        .with_column("Flag", [Cell::Bool(true), Cell::Bool(false)])
        .with_column("Qty", [Cell::Number(1.5), Cell::Number(2.0)]);
    append_table(&path, &table, &AppendOptions::default())?;

    let cells = read_cells(&path, "Sheet1")?;
    assert_eq!(cells[&(1, 0)], "x");
    assert_eq!(cells[&(1, 1)], "1");
    assert_eq!(cells[&(1, 2)], "1.5");
    assert!(!cells.contains_key(&(2, 0)));
    assert_eq!(cells[&(2, 1)], "0");
    assert_eq!(cells[&(2, 2)], "2");
    Ok(())
}

#[test]
fn empty_cell_clears_existing_value() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("clear.xlsx");

    append_table(&path, &people(), &AppendOptions::default())?;

    let blank = Table::new().with_column("Age", [Cell::Empty]);
    append_table(
        &path,
        &blank,
        &AppendOptions {
            start_row: Some(1),
            start_col: 1,
            write: WriteOptions {
                header: false,
                ..WriteOptions::default()
            },
            ..AppendOptions::default()
        },
    )?;

    let cells = read_cells(&path, "Sheet1")?;
    assert!(!cells.contains_key(&(1, 1)));
    assert_eq!(cells[&(1, 0)], "Alice");
    assert_eq!(cells[&(2, 1)], "35");
    Ok(())
}

#[test]
fn writes_index_column() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("indexed.xlsx");

    append_table(
        &path,
        &people(),
        &AppendOptions {
            write: WriteOptions {
                index: true,
                ..WriteOptions::default()
            },
            ..AppendOptions::default()
        },
    )?;

    let cells = read_cells(&path, "Sheet1")?;
    // index header cell stays blank
    assert!(!cells.contains_key(&(0, 0)));
    assert_eq!(cells[&(0, 1)], "Name");
    assert_eq!(cells[&(1, 0)], "0");
    assert_eq!(cells[&(3, 0)], "2");
    assert_eq!(cells[&(1, 1)], "Alice");
    Ok(())
}

#[test]
fn suppresses_header() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("headless.xlsx");

    append_table(
        &path,
        &people(),
        &AppendOptions {
            write: WriteOptions {
                header: false,
                ..WriteOptions::default()
            },
            ..AppendOptions::default()
        },
    )?;

    let cells = read_cells(&path, "Sheet1")?;
    assert_eq!(cells[&(0, 0)], "Alice");
    assert_eq!(cells.len(), 6);
    Ok(())
}

#[test]
fn engine_option_is_ignored() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let plain = dir.path().join("plain.xlsx");
    let with_engine = dir.path().join("engine.xlsx");

    append_table(&plain, &people(), &AppendOptions::default())?;
    append_table(
        &with_engine,
        &people(),
        &AppendOptions {
            write: WriteOptions {
                engine: Some("openpyxl".to_owned()),
                ..WriteOptions::default()
            },
            ..AppendOptions::default()
        },
    )?;

    assert_eq!(
        read_cells(&plain, "Sheet1")?,
        read_cells(&with_engine, "Sheet1")?
    );
    Ok(())
}

#[test]
fn rejects_empty_payload() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("never.xlsx");

    let err = append_table(&path, &Table::new(), &AppendOptions::default());
    assert!(err.is_err());
    assert!(!path.exists());
    Ok(())
}

#[test]
fn rejects_ragged_columns() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("never.xlsx");

    let ragged = Table::new()
        .with_column("A", [1.0, 2.0])
        .with_column("B", [1.0]);
    assert!(append_table(&path, &ragged, &AppendOptions::default()).is_err());
    assert!(!path.exists());
    Ok(())
}

#[test]
fn fails_fast_on_non_workbook_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("bogus.xlsx");
    fs::write(&path, b"this is not a workbook")?;

    assert!(append_table(&path, &people(), &AppendOptions::default()).is_err());
    assert_eq!(fs::read(&path)?, b"this is not a workbook");
    Ok(())
}

#[test]
fn column_letter_mapping() {
    assert_eq!(col_letters(0), "A");
    assert_eq!(col_letters(25), "Z");
    assert_eq!(col_letters(26), "AA");
    assert_eq!(col_letters(51), "AZ");
    assert_eq!(col_letters(52), "BA");
    assert_eq!(col_letters(701), "ZZ");
    assert_eq!(col_letters(702), "AAA");
    for idx in [0, 25, 26, 51, 700, 16383] {
        assert_eq!(letters_to_col(&col_letters(idx)), idx);
    }
}
