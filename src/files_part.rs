//! files_part.rs — zip container I/O: part loading, blank package, atomic save.

use anyhow::{Context, Result};
use log::debug;
use std::{
    collections::HashSet,
    fs::File,
    io::{ErrorKind, Read, Write},
    path::Path,
};
use tempfile::NamedTempFile;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::FileOptions};

use crate::XlsxWorkbook;

pub(crate) const WORKBOOK_PART: &str = "xl/workbook.xml";
pub(crate) const RELS_PART: &str = "xl/_rels/workbook.xml.rels";
pub(crate) const CONTENT_TYPES_PART: &str = "[Content_Types].xml";

/// Minimal worksheet part; also the post-truncation state of a sheet.
pub(crate) const EMPTY_SHEET_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData></sheetData></worksheet>"#;

// A blank package carries no worksheets; the first add_sheet call supplies
// the sheet tag, its relationship and its content-type override.
const BLANK_WORKBOOK_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets></sheets></workbook>"#;

const BLANK_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/></Relationships>"#;

const BLANK_ROOT_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const BLANK_CONTENT_TYPES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/></Types>"#;

const BLANK_STYLES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="1"><font><sz val="11"/><name val="Calibri"/></font></fonts><fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills><borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders><cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs><cellXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/></cellXfs></styleSheet>"#;

fn read_part(zip: &mut ZipArchive<File>, name: &str) -> Result<Vec<u8>> {
    let mut part = zip
        .by_name(name)
        .with_context(|| format!("{name} not found in workbook"))?;
    let mut buf = Vec::with_capacity(part.size() as usize);
    part.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Work with files
impl XlsxWorkbook {
    /// Opens an existing workbook and loads its container parts.
    ///
    /// No sheet is selected yet; use [`XlsxWorkbook::select_sheet`] or
    /// [`XlsxWorkbook::add_sheet`] before writing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        Self::from_file(file, path)
    }

    /// Opens `path`, or starts a blank in-memory package when the file does
    /// not exist. Only a missing file takes the blank path; any other open
    /// or parse failure is propagated.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match File::open(path) {
            Ok(file) => Self::from_file(file, path),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} does not exist, starting a blank workbook", path.display());
                Ok(Self::create())
            }
            Err(e) => {
                Err(e).with_context(|| format!("cannot open {}", path.display()))
            }
        }
    }

    fn from_file(file: File, path: &Path) -> Result<Self> {
        let mut zip = ZipArchive::new(file)
            .with_context(|| format!("{} is not a valid xlsx workbook", path.display()))?;

        let workbook_xml = read_part(&mut zip, WORKBOOK_PART)?;
        let rels_xml = read_part(&mut zip, RELS_PART)?;
        let content_types_xml = read_part(&mut zip, CONTENT_TYPES_PART)?;
        debug!("opened workbook {}", path.display());

        Ok(Self {
            src_path: Some(path.to_path_buf()),
            workbook_xml,
            rels_xml,
            content_types_xml,
            sheet_path: String::new(),
            sheet_xml: Vec::new(),
            last_row: 0,
            new_files: Vec::new(),
        })
    }

    /// A blank in-memory package with no sheets. Add at least one sheet
    /// before saving; a workbook without sheets is not a valid xlsx file.
    pub fn create() -> Self {
        Self {
            src_path: None,
            workbook_xml: BLANK_WORKBOOK_XML.as_bytes().to_vec(),
            rels_xml: BLANK_RELS_XML.as_bytes().to_vec(),
            content_types_xml: BLANK_CONTENT_TYPES_XML.as_bytes().to_vec(),
            sheet_path: String::new(),
            sheet_xml: Vec::new(),
            last_row: 0,
            new_files: vec![
                ("_rels/.rels".to_owned(), BLANK_ROOT_RELS_XML.as_bytes().to_vec()),
                ("xl/styles.xml".to_owned(), BLANK_STYLES_XML.as_bytes().to_vec()),
            ],
        }
    }

    pub(crate) fn flush_current_sheet(&mut self) {
        if self.sheet_path.is_empty() {
            return;
        }
        let path = self.sheet_path.clone();
        let xml = self.sheet_xml.clone();
        if let Some((_, content)) = self.new_files.iter_mut().find(|(p, _)| p == &path) {
            *content = xml;
        } else {
            self.new_files.push((path, xml));
        }
    }

    /// Serializes the whole workbook back to `dst`.
    ///
    /// The zip is rebuilt into a temporary file in the destination directory
    /// and renamed into place, so an interrupted save never leaves `dst`
    /// truncated. Untouched entries of the source archive are copied raw.
    pub fn save<P: AsRef<Path>>(&mut self, dst: P) -> Result<()> {
        self.flush_current_sheet();
        let dst = dst.as_ref();
        let dir = dst
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("cannot create temporary file in {}", dir.display()))?;

        {
            let mut zout = ZipWriter::new(&mut tmp);
            let opt: FileOptions<'_, ()> = FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(1));

            let mut written: HashSet<String> = HashSet::new();

            if let Some(src) = &self.src_path {
                let mut zin = ZipArchive::new(File::open(src)?)?;
                for i in 0..zin.len() {
                    let file = zin.by_index_raw(i)?;
                    let name = file.name().to_owned();
                    if let Some((_, content)) = self.new_files.iter().find(|(p, _)| p == &name) {
                        zout.start_file(name.as_str(), opt)?;
                        zout.write_all(content)?;
                    } else {
                        match name.as_str() {
                            WORKBOOK_PART => {
                                zout.start_file(name.as_str(), opt)?;
                                zout.write_all(&self.workbook_xml)?;
                            }
                            RELS_PART => {
                                zout.start_file(name.as_str(), opt)?;
                                zout.write_all(&self.rels_xml)?;
                            }
                            CONTENT_TYPES_PART => {
                                zout.start_file(name.as_str(), opt)?;
                                zout.write_all(&self.content_types_xml)?;
                            }
                            _ => zout.raw_copy_file(file)?,
                        }
                    }
                    written.insert(name);
                }
            } else {
                zout.start_file(CONTENT_TYPES_PART, opt)?;
                zout.write_all(&self.content_types_xml)?;
                zout.start_file(WORKBOOK_PART, opt)?;
                zout.write_all(&self.workbook_xml)?;
                zout.start_file(RELS_PART, opt)?;
                zout.write_all(&self.rels_xml)?;
                written.insert(CONTENT_TYPES_PART.to_owned());
                written.insert(WORKBOOK_PART.to_owned());
                written.insert(RELS_PART.to_owned());
            }

            // parts created this session that the source archive never had
            for (path, content) in &self.new_files {
                if written.insert(path.clone()) {
                    zout.start_file(path.as_str(), opt)?;
                    zout.write_all(content)?;
                }
            }

            zout.finish()?;
        }

        tmp.persist(dst)
            .with_context(|| format!("cannot replace {}", dst.display()))?;
        debug!("saved workbook to {}", dst.display());
        Ok(())
    }
}
