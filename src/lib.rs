//! In-place append of tabular data to xlsx workbooks.
//!
//! [`append_table`] opens (or creates) a workbook, writes a column-major
//! [`Table`] into a target sheet at a caller-given or auto-detected offset,
//! optionally truncating the sheet first, and saves the whole package back
//! atomically. Parts that are not touched round-trip verbatim, so sheets
//! other than the target keep their content, names and order.

mod files_part;
mod table_part;
#[cfg(test)]
mod test;

use anyhow::{Context, Result, bail};
use log::debug;
use memchr::memmem;
use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};
use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use files_part::EMPTY_SHEET_XML;
use table_part::{cell_xml, col_letters, letters_to_col, row_xml};

pub use table_part::{AppendOptions, Cell, Column, Table, WriteOptions};

/// In-memory editor over one xlsx package.
///
/// Holds the container parts that can change during an append; everything
/// else is copied straight through at save time. One sheet is selected at a
/// time; edits to previously selected sheets are kept until [`XlsxWorkbook::save`].
pub struct XlsxWorkbook {
    src_path: Option<PathBuf>,
    workbook_xml: Vec<u8>,
    rels_xml: Vec<u8>,
    content_types_xml: Vec<u8>,
    sheet_path: String,
    sheet_xml: Vec<u8>,
    last_row: u32,
    new_files: Vec<(String, Vec<u8>)>,
}

/// Appends `table` to a sheet of the workbook at `path`.
///
/// If `path` does not exist the workbook is created; if the target sheet
/// does not exist it is added after the existing sheets. With
/// `options.start_row` unset the block lands one past the last occupied
/// row of the sheet. `options.truncate_sheet` discards the sheet's prior
/// content first, so an unset `start_row` then resolves to 0.
///
/// The write touches only the rectangle covered by the block; all other
/// cells, and all other sheets, are preserved. A failed call leaves the
/// file at `path` in its prior state.
pub fn append_table<P: AsRef<Path>>(path: P, table: &Table, options: &AppendOptions) -> Result<()> {
    table.validate()?;
    if let Some(engine) = options.write.engine.as_deref() {
        debug!("engine override '{engine}' ignored; the built-in writer is always used");
    }

    let mut wb = XlsxWorkbook::open_or_create(path.as_ref())?;
    let existed = wb.sheet_names().iter().any(|n| n == &options.sheet_name);
    if existed {
        wb.select_sheet(&options.sheet_name)?;
        if options.truncate_sheet {
            wb.truncate_sheet();
        }
    } else {
        wb.add_sheet(&options.sheet_name)?;
    }

    // Truncation zeroes the occupied-row count, so it must happen before
    // an unset start_row is resolved.
    let start_row = options.start_row.unwrap_or_else(|| wb.last_row());
    let rows = table.to_rows(&options.write);
    debug!(
        "writing {} row(s) to sheet '{}' at row {start_row}, col {}",
        rows.len(),
        options.sheet_name,
        options.start_col
    );

    wb.write_block(start_row, options.start_col, &rows)?;
    wb.save(path)
}

/// Lists the sheet names of the workbook at `path`, in workbook order.
pub fn sheet_names<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("{} is not a valid xlsx workbook", path.display()))?;
    let mut wb = zip
        .by_name(files_part::WORKBOOK_PART)
        .context("workbook.xml not found")?;
    let mut wb_xml = Vec::with_capacity(wb.size() as usize);
    wb.read_to_end(&mut wb_xml)?;
    Ok(sheet_names_in(&wb_xml))
}

impl XlsxWorkbook {
    /// Sheet names in workbook order, reflecting any sheets added since open.
    pub fn sheet_names(&self) -> Vec<String> {
        sheet_names_in(&self.workbook_xml)
    }

    /// 1-based number of the last occupied row of the selected sheet, which
    /// is also the 0-based index of the first free row. 0 when the sheet is
    /// empty or nothing is selected.
    pub fn last_row(&self) -> u32 {
        self.last_row
    }

    /// Switches the editor to an existing sheet, keeping any edits made to
    /// the previously selected one.
    pub fn select_sheet(&mut self, name: &str) -> Result<&mut Self> {
        self.flush_current_sheet();

        let rid = self
            .find_sheet_rid(name)
            .with_context(|| format!("sheet '{name}' not found"))?;
        let target = self
            .find_rel_target(&rid)
            .with_context(|| format!("relationship '{rid}' for sheet '{name}' not found"))?;

        let part_path = if let Some(abs) = target.strip_prefix('/') {
            abs.to_owned()
        } else if target.starts_with("xl/") {
            target
        } else {
            format!("xl/{target}")
        };

        let mut sheet_xml =
            if let Some((_, content)) = self.new_files.iter().find(|(p, _)| p == &part_path) {
                content.clone()
            } else {
                let src = self
                    .src_path
                    .as_ref()
                    .with_context(|| format!("sheet part {part_path} missing from workbook"))?;
                let mut zin = zip::ZipArchive::new(File::open(src)?)?;
                let mut part = zin
                    .by_name(&part_path)
                    .with_context(|| format!("{part_path} not found in workbook"))?;
                let mut buf = Vec::with_capacity(part.size() as usize);
                part.read_to_end(&mut buf)?;
                buf
            };

        normalize_sheet_data(&mut sheet_xml)?;
        self.last_row = last_row_in(&sheet_xml);
        self.sheet_path = part_path;
        self.sheet_xml = sheet_xml;
        Ok(self)
    }

    /// Adds a new empty sheet after the existing ones and selects it.
    pub fn add_sheet(&mut self, name: &str) -> Result<&mut Self> {
        if self.sheet_names().iter().any(|n| n == name) {
            bail!("sheet '{name}' already exists");
        }
        self.flush_current_sheet();

        let new_sheet_id = self.max_sheet_id() + 1;
        let new_rid = self.max_rid() + 1;
        let new_file_num = self.max_sheet_file_num()? + 1;
        let new_sheet_path = format!("xl/worksheets/sheet{new_file_num}.xml");
        let new_sheet_target = format!("worksheets/sheet{new_file_num}.xml");

        let sheet_tag = format!(
            r#"<sheet name="{}" sheetId="{new_sheet_id}" r:id="rId{new_rid}"/>"#,
            xml_escape(name)
        );
        let pos = memmem::rfind(&self.workbook_xml, b"</sheets>")
            .context("</sheets> not found in workbook.xml")?;
        self.workbook_xml.splice(pos..pos, sheet_tag.into_bytes());

        let rel_tag = format!(
            r#"<Relationship Id="rId{new_rid}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="{new_sheet_target}"/>"#
        );
        let pos = memmem::rfind(&self.rels_xml, b"</Relationships>")
            .context("</Relationships> not found in workbook.xml.rels")?;
        self.rels_xml.splice(pos..pos, rel_tag.into_bytes());

        let override_tag = format!(
            r#"<Override PartName="/{new_sheet_path}" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#
        );
        let pos = memmem::rfind(&self.content_types_xml, b"</Types>")
            .context("</Types> not found in [Content_Types].xml")?;
        self.content_types_xml
            .splice(pos..pos, override_tag.into_bytes());

        self.new_files
            .push((new_sheet_path.clone(), EMPTY_SHEET_XML.as_bytes().to_vec()));
        self.sheet_path = new_sheet_path;
        self.sheet_xml = EMPTY_SHEET_XML.as_bytes().to_vec();
        self.last_row = 0;
        debug!("added sheet '{name}'");
        Ok(self)
    }

    /// Discards all content of the selected sheet. Its name, relationship
    /// and position among the sheets are untouched.
    pub fn truncate_sheet(&mut self) {
        self.sheet_xml = EMPTY_SHEET_XML.as_bytes().to_vec();
        self.last_row = 0;
        debug!("truncated sheet part {}", self.sheet_path);
    }

    /// Writes a block of rows into the selected sheet with its top-left
    /// cell at 0-based (`start_row`, `start_col`).
    ///
    /// Rows that already exist are patched cell by cell; rows past the end
    /// are emitted whole. Cells outside the block's rectangle are never
    /// touched.
    pub fn write_block(
        &mut self,
        start_row: u32,
        start_col: u32,
        rows: &[Vec<Cell>],
    ) -> Result<()> {
        let mut bulk = Vec::<u8>::new();
        for (i, row) in rows.iter().enumerate() {
            let abs_row = start_row + i as u32 + 1;
            if abs_row <= self.last_row {
                for (j, cell) in row.iter().enumerate() {
                    self.patch_cell(abs_row, start_col + j as u32, cell)?;
                }
            } else {
                bulk.extend_from_slice(&row_xml(abs_row, start_col, row)?);
                self.last_row = abs_row;
            }
        }
        if !bulk.is_empty() {
            let pos = memmem::rfind(&self.sheet_xml, b"</sheetData>")
                .context("</sheetData> tag not found")?;
            self.sheet_xml.splice(pos..pos, bulk);
        }
        Ok(())
    }

    /// Replaces, inserts or (for [`Cell::Empty`]) removes the cell at the
    /// given 1-based row and 0-based column.
    fn patch_cell(&mut self, row: u32, col: u32, cell: &Cell) -> Result<()> {
        let coord = format!("{}{row}", col_letters(col));
        // the trailing quote keeps r="1" from matching r="12"
        let row_marker = format!("<row r=\"{row}\"");

        if let Some(row_start) = memmem::find(&self.sheet_xml, row_marker.as_bytes()) {
            let tag_end = self.sheet_xml[row_start..]
                .iter()
                .position(|&b| b == b'>')
                .map(|p| p + row_start)
                .context("malformed row element")?;
            if self.sheet_xml[tag_end - 1] == b'/' {
                // expand a childless row so cells can be inserted
                self.sheet_xml
                    .splice(tag_end - 1..tag_end + 1, b"></row>".iter().copied());
            }
            let row_end = memmem::find(&self.sheet_xml[row_start..], b"</row>")
                .map(|p| p + row_start + b"</row>".len())
                .context("malformed row element")?;
            let mut row_slice = self.sheet_xml[row_start..row_end].to_vec();

            let cell_marker = format!("<c r=\"{coord}\"");
            if let Some(cell_pos) = memmem::find(&row_slice, cell_marker.as_bytes()) {
                if let Some(end) = cell_end(&row_slice, cell_pos) {
                    row_slice.drain(cell_pos..end);
                }
            }

            if let Some(xml) = cell_xml(&coord, cell)? {
                let insert_pos = cell_insert_pos(&row_slice, col);
                row_slice.splice(insert_pos..insert_pos, xml);
            }
            self.sheet_xml.splice(row_start..row_end, row_slice);
        } else if let Some(xml) = cell_xml(&coord, cell)? {
            let mut new_row = Vec::new();
            new_row.extend_from_slice(format!("<row r=\"{row}\">").as_bytes());
            new_row.extend_from_slice(&xml);
            new_row.extend_from_slice(b"</row>");
            let pos = self.row_insert_pos(row)?;
            self.sheet_xml.splice(pos..pos, new_row);
        }

        if row > self.last_row {
            self.last_row = row;
        }
        Ok(())
    }

    /// Position for a new `<row r="N">`, keeping rows ordered by `r`.
    /// Out-of-order rows make Excel report recovered records.
    fn row_insert_pos(&self, row: u32) -> Result<usize> {
        let mut search = 0;
        while let Some(p) = memmem::find(&self.sheet_xml[search..], b"<row r=\"") {
            let num_start = search + p + b"<row r=\"".len();
            let Some(q) = self.sheet_xml[num_start..].iter().position(|&b| b == b'"') else {
                break;
            };
            let existing = std::str::from_utf8(&self.sheet_xml[num_start..num_start + q])
                .ok()
                .and_then(|s| s.parse::<u32>().ok());
            if let Some(n) = existing {
                if n > row {
                    return Ok(search + p);
                }
            }
            search = num_start + q;
        }
        memmem::rfind(&self.sheet_xml, b"</sheetData>").context("</sheetData> tag not found")
    }

    fn find_sheet_rid(&self, name: &str) -> Option<String> {
        let mut reader = Reader::from_reader(self.workbook_xml.as_slice());
        reader.config_mut().trim_text(true);
        while let Ok(ev) = reader.read_event() {
            match ev {
                Event::Empty(ref e) | Event::Start(ref e) if e.name().as_ref() == b"sheet" => {
                    if attr_value(e, b"name").as_deref() == Some(name) {
                        return attr_value(e, b"r:id");
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        None
    }

    fn find_rel_target(&self, rid: &str) -> Option<String> {
        let mut reader = Reader::from_reader(self.rels_xml.as_slice());
        reader.config_mut().trim_text(true);
        while let Ok(ev) = reader.read_event() {
            match ev {
                Event::Empty(ref e) | Event::Start(ref e)
                    if e.name().as_ref() == b"Relationship" =>
                {
                    if attr_value(e, b"Id").as_deref() == Some(rid) {
                        return attr_value(e, b"Target");
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        None
    }

    fn max_sheet_id(&self) -> u32 {
        let mut reader = Reader::from_reader(self.workbook_xml.as_slice());
        reader.config_mut().trim_text(true);
        let mut max = 0;
        while let Ok(ev) = reader.read_event() {
            match ev {
                Event::Empty(ref e) | Event::Start(ref e) if e.name().as_ref() == b"sheet" => {
                    if let Some(id) = attr_value(e, b"sheetId").and_then(|v| v.parse::<u32>().ok())
                    {
                        max = max.max(id);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        max
    }

    fn max_rid(&self) -> u32 {
        let mut reader = Reader::from_reader(self.rels_xml.as_slice());
        reader.config_mut().trim_text(true);
        let mut max = 0;
        while let Ok(ev) = reader.read_event() {
            match ev {
                Event::Empty(ref e) | Event::Start(ref e)
                    if e.name().as_ref() == b"Relationship" =>
                {
                    if let Some(n) = attr_value(e, b"Id")
                        .and_then(|id| id.strip_prefix("rId").and_then(|s| s.parse::<u32>().ok()))
                    {
                        max = max.max(n);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        max
    }

    /// Highest N among existing `xl/worksheets/sheetN.xml` part names,
    /// counting both the source archive and parts added this session.
    fn max_sheet_file_num(&self) -> Result<usize> {
        fn part_num(name: &str) -> Option<usize> {
            name.strip_prefix("xl/worksheets/sheet")?
                .strip_suffix(".xml")?
                .parse()
                .ok()
        }

        let mut max = 0;
        if let Some(src) = &self.src_path {
            let mut zin = zip::ZipArchive::new(File::open(src)?)?;
            for i in 0..zin.len() {
                if let Some(n) = part_num(zin.by_index_raw(i)?.name()) {
                    max = max.max(n);
                }
            }
        }
        for (path, _) in &self.new_files {
            if let Some(n) = part_num(path) {
                max = max.max(n);
            }
        }
        if let Some(n) = part_num(&self.sheet_path) {
            max = max.max(n);
        }
        Ok(max)
    }
}

pub(crate) fn attr_value(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes().with_checks(false).flatten().find_map(|a| {
        if a.key.as_ref() == key {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

fn sheet_names_in(workbook_xml: &[u8]) -> Vec<String> {
    let mut reader = Reader::from_reader(workbook_xml);
    reader.config_mut().trim_text(true);
    let mut names = Vec::new();
    while let Ok(ev) = reader.read_event() {
        match ev {
            Event::Empty(ref e) | Event::Start(ref e) if e.name().as_ref() == b"sheet" => {
                if let Some(n) = attr_value(e, b"name") {
                    names.push(n);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    names
}

fn last_row_in(sheet_xml: &[u8]) -> u32 {
    let mut reader = Reader::from_reader(sheet_xml);
    reader.config_mut().trim_text(true);
    let mut last_row = 0u32;
    while let Ok(ev) = reader.read_event() {
        match ev {
            Event::Empty(ref e) | Event::Start(ref e) if e.name().as_ref() == b"row" => {
                if let Some(r) = attr_value(e, b"r").and_then(|v| v.parse::<u32>().ok()) {
                    last_row = last_row.max(r);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    last_row
}

/// Some producers emit an empty sheet as `<sheetData/>`; expand it so new
/// rows always have a `</sheetData>` anchor to splice against.
fn normalize_sheet_data(xml: &mut Vec<u8>) -> Result<()> {
    if memmem::find(xml, b"</sheetData>").is_some() {
        return Ok(());
    }
    if let Some(pos) = memmem::find(xml, b"<sheetData/>") {
        xml.splice(
            pos..pos + b"<sheetData/>".len(),
            b"<sheetData></sheetData>".iter().copied(),
        );
        return Ok(());
    }
    if let Some(pos) = memmem::find(xml, b"<sheetData ") {
        if let Some(end) = memmem::find(&xml[pos..], b"/>") {
            let abs = pos + end;
            xml.splice(abs..abs + 2, b"></sheetData>".iter().copied());
            return Ok(());
        }
    }
    bail!("sheetData element not found in worksheet part");
}

/// End offset (exclusive) of the cell element starting at `cell_pos`.
fn cell_end(row_slice: &[u8], cell_pos: usize) -> Option<usize> {
    let gt = row_slice[cell_pos..]
        .iter()
        .position(|&b| b == b'>')
        .map(|p| p + cell_pos)?;
    if row_slice[gt - 1] == b'/' {
        Some(gt + 1)
    } else {
        memmem::find(&row_slice[gt..], b"</c>").map(|p| gt + p + b"</c>".len())
    }
}

/// Position within a `<row>...</row>` slice where a cell of column `col`
/// belongs, keeping cells ordered by column.
fn cell_insert_pos(row_slice: &[u8], col: u32) -> usize {
    let mut insert_pos = row_slice.len() - b"</row>".len();
    let mut i = 0;
    while let Some(p) = memmem::find(&row_slice[i..], b"<c r=\"") {
        let coord_start = i + p + b"<c r=\"".len();
        let Some(q) = row_slice[coord_start..].iter().position(|&b| b == b'"') else {
            break;
        };
        if let Ok(coord) = std::str::from_utf8(&row_slice[coord_start..coord_start + q]) {
            if letters_to_col(coord) > col {
                insert_pos = i + p;
                break;
            }
        }
        i = coord_start + q;
    }
    insert_pos
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
