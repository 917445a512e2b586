//! Form-field editing with lopdf
//!
//! [`FormDocument`] is the write side of the pipeline: it reads page boxes,
//! strips old fields, creates widget annotations and stitches them into the
//! document's `/AcroForm` before serializing.

use super::ensure_pdf_header;
use crate::error::{Error, Result};
use crate::form::{FieldKind, PlacedField};
use crate::geometry::{PageBox, PdfRect};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId};
use std::collections::{BTreeSet, HashSet};

/// Default appearance for text widgets (auto-sized Helvetica, black)
const TEXT_APPEARANCE: &str = "/Helv 0 Tf 0 0 0 rg";
/// Default appearance for checkbox widgets (ZapfDingbats check mark)
const CHECKBOX_APPEARANCE: &str = "/ZaDb 0 Tf 0 g";
/// `/Ff` bit 13: multi-line text
const FIELD_FLAG_MULTILINE: i64 = 1 << 12;
/// `/F` bit 3: print
const ANNOT_FLAG_PRINT: i64 = 4;
/// Guard against cyclic `/Parent` or `/Kids` chains
const MAX_TREE_DEPTH: usize = 64;

/// A widget annotation read back from a page
#[derive(Debug, Clone, PartialEq)]
pub struct WidgetAnnotation {
    /// Page index (0-indexed)
    pub page: usize,
    /// Partial field name (`/T`), if the widget carries one
    pub name: Option<String>,
    /// Field type (`Tx`, `Btn`, `Sig`, ...)
    pub field_type: Option<String>,
    /// Annotation rectangle
    pub rect: Option<PdfRect>,
    /// Field flags (`/Ff`)
    pub flags: i64,
}

/// A PDF opened for form-field editing
pub struct FormDocument {
    doc: Document,
    page_ids: Vec<ObjectId>,
    names: HashSet<String>,
    new_fields: Vec<ObjectId>,
}

fn document_error(err: lopdf::Error) -> Error {
    Error::Document {
        reason: err.to_string(),
    }
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

fn rect_object(rect: &PdfRect) -> Object {
    Object::Array(
        rect.to_array()
            .iter()
            .map(|v| Object::Real(*v as f32))
            .collect(),
    )
}

/// Decode a PDF text string (UTF-16BE with BOM, otherwise byte-wise)
fn decode_text(bytes: &[u8]) -> String {
    if let Some(utf16) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Whether `region` holds the name `/Encrypt` itself, not a longer name
/// such as `/EncryptMetadata`
fn names_encrypt_key(region: &[u8]) -> bool {
    const KEY: &[u8] = b"/Encrypt";
    let mut rest = region;
    while let Some(pos) = find(rest, KEY) {
        let after = rest.get(pos + KEY.len()).copied();
        match after {
            None => return true,
            Some(b) if b.is_ascii_whitespace() || b"()<>[]{}/%".contains(&b) => return true,
            Some(_) => rest = &rest[pos + KEY.len()..],
        }
    }
    false
}

fn startxref_offset(data: &[u8]) -> Option<usize> {
    let pos = rfind(data, b"startxref")?;
    let digits: Vec<u8> = data[pos + b"startxref".len()..]
        .iter()
        .copied()
        .skip_while(u8::is_ascii_whitespace)
        .take_while(u8::is_ascii_digit)
        .collect();
    std::str::from_utf8(&digits).ok()?.parse().ok()
}

/// Whether the trailer dictionary, or the cross-reference stream dictionary
/// `startxref` points at, carries an `/Encrypt` entry. Used when lopdf cannot
/// parse the file at all.
fn trailer_has_encrypt(data: &[u8]) -> bool {
    if let Some(pos) = rfind(data, b"trailer") {
        if names_encrypt_key(&data[pos..]) {
            return true;
        }
    }

    let Some(tail) = startxref_offset(data).and_then(|offset| data.get(offset..)) else {
        return false;
    };
    if !tail.first().is_some_and(u8::is_ascii_digit) {
        return false;
    }
    let end = find(tail, b"stream").unwrap_or(tail.len());
    names_encrypt_key(&tail[..end])
}

impl FormDocument {
    /// Open a PDF from bytes.
    ///
    /// Documents that are still encrypted after loading are refused with
    /// [`Error::EncryptedDocument`]; they cannot be rewritten without the password.
    pub fn load(data: &[u8]) -> Result<Self> {
        ensure_pdf_header(data)?;

        let doc = Document::load_mem(data).map_err(|e| {
            if trailer_has_encrypt(data) {
                Error::EncryptedDocument
            } else {
                document_error(e)
            }
        })?;

        if doc.trailer.has(b"Encrypt") {
            return Err(Error::EncryptedDocument);
        }

        let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
        let mut form = Self {
            doc,
            page_ids,
            names: HashSet::new(),
            new_fields: Vec::new(),
        };
        form.names = form.existing_field_names().into_iter().collect();

        Ok(form)
    }

    /// Number of pages
    pub fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    fn page_id(&self, page: usize) -> Result<ObjectId> {
        self.page_ids
            .get(page)
            .copied()
            .ok_or(Error::PageOutOfBounds {
                page,
                total: self.page_ids.len(),
            })
    }

    /// Follow a reference to its object; direct objects are returned as-is
    fn resolve<'a>(&'a self, obj: &'a Object) -> Option<&'a Object> {
        match obj {
            Object::Reference(id) => self.doc.get_object(*id).ok(),
            other => Some(other),
        }
    }

    /// Look up a page attribute, walking up the page tree through `/Parent`
    fn inherited(&self, page_id: ObjectId, key: &[u8]) -> Option<&Object> {
        let mut current = page_id;
        for _ in 0..MAX_TREE_DEPTH {
            let dict = self.doc.get_dictionary(current).ok()?;
            if let Ok(value) = dict.get(key) {
                return Some(value);
            }
            current = dict.get(b"Parent").and_then(Object::as_reference).ok()?;
        }
        None
    }

    /// The page's CropBox, falling back to its MediaBox
    pub fn page_box(&self, page: usize) -> Result<PageBox> {
        let page_id = self.page_id(page)?;
        let obj = self
            .inherited(page_id, b"CropBox")
            .or_else(|| self.inherited(page_id, b"MediaBox"))
            .ok_or_else(|| Error::Document {
                reason: format!("page {} has neither CropBox nor MediaBox", page),
            })?;

        let invalid = || Error::Document {
            reason: format!("page {} has a malformed page box", page),
        };

        let array = self
            .resolve(obj)
            .and_then(|o| o.as_array().ok())
            .filter(|a| a.len() == 4)
            .ok_or_else(invalid)?;

        let mut values = [0.0; 4];
        for (slot, value) in values.iter_mut().zip(array) {
            *slot = self.resolve(value).and_then(number).ok_or_else(invalid)?;
        }

        Ok(PageBox::from_array(values))
    }

    /// Page boxes for every page, in page order
    pub fn page_boxes(&self) -> Result<Vec<PageBox>> {
        (0..self.page_count()).map(|i| self.page_box(i)).collect()
    }

    fn acroform(&self) -> Option<&Dictionary> {
        let catalog = self.doc.catalog().ok()?;
        let obj = catalog.get(b"AcroForm").ok()?;
        self.resolve(obj)?.as_dict().ok()
    }

    fn acroform_fields(&self) -> Vec<Object> {
        self.acroform()
            .and_then(|form| form.get(b"Fields").ok())
            .and_then(|fields| self.resolve(fields))
            .and_then(|fields| fields.as_array().ok())
            .cloned()
            .unwrap_or_default()
    }

    fn collect_names(&self, obj: &Object, prefix: Option<&str>, depth: usize, out: &mut Vec<String>) {
        if depth >= MAX_TREE_DEPTH {
            return;
        }
        let Some(dict) = self.resolve(obj).and_then(|o| o.as_dict().ok()) else {
            return;
        };

        let partial = match dict.get(b"T") {
            Ok(Object::String(bytes, _)) => Some(decode_text(bytes)),
            _ => None,
        };
        let full = match (prefix, partial) {
            (Some(p), Some(t)) => Some(format!("{}.{}", p, t)),
            (None, Some(t)) => Some(t),
            (Some(p), None) => Some(p.to_string()),
            (None, None) => None,
        };

        let kids = dict
            .get(b"Kids")
            .ok()
            .and_then(|kids| self.resolve(kids))
            .and_then(|kids| kids.as_array().ok());

        match kids {
            Some(kids) if !kids.is_empty() => {
                for kid in kids {
                    self.collect_names(kid, full.as_deref(), depth + 1, out);
                }
            }
            _ => {
                if let Some(name) = full {
                    out.push(name);
                }
            }
        }
    }

    fn existing_field_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for field in self.acroform_fields() {
            self.collect_names(&field, None, 0, &mut names);
        }
        names
    }

    /// Every fully-qualified terminal field name, sorted
    pub fn field_names(&self) -> Vec<String> {
        self.names
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn is_widget(&self, annotation: &Object) -> bool {
        self.resolve(annotation)
            .and_then(|o| o.as_dict().ok())
            .map(|d| matches!(d.get(b"Subtype"), Ok(Object::Name(n)) if n == b"Widget"))
            .unwrap_or(false)
    }

    fn page_annotations(&self, page_id: ObjectId) -> Vec<Object> {
        self.doc
            .get_dictionary(page_id)
            .ok()
            .and_then(|page| page.get(b"Annots").ok())
            .and_then(|annots| self.resolve(annots))
            .and_then(|annots| annots.as_array().ok())
            .cloned()
            .unwrap_or_default()
    }

    fn set_page_annotations(&mut self, page_id: ObjectId, annotations: Vec<Object>) -> Result<()> {
        self.doc
            .get_dictionary_mut(page_id)
            .map_err(document_error)?
            .set("Annots", Object::Array(annotations));
        Ok(())
    }

    /// Make sure the catalog holds an indirect `/AcroForm` and return its id
    fn ensure_acroform(&mut self) -> Result<ObjectId> {
        let current = self
            .doc
            .catalog()
            .map_err(document_error)?
            .get(b"AcroForm")
            .ok()
            .cloned();

        let id = match current {
            Some(Object::Reference(id)) => return Ok(id),
            Some(Object::Dictionary(dict)) => self.doc.add_object(dict),
            _ => self.doc.add_object(dictionary! {
                "Fields" => Object::Array(vec![]),
            }),
        };

        self.doc
            .catalog_mut()
            .map_err(document_error)?
            .set("AcroForm", Object::Reference(id));
        Ok(id)
    }

    /// Remove every form field and every widget annotation.
    ///
    /// Non-widget annotations (links, comments) stay on their pages. Returns
    /// the number of widget annotations removed.
    pub fn clear_fields(&mut self) -> Result<usize> {
        if self.acroform().is_some() {
            let acroform_id = self.ensure_acroform()?;
            self.doc
                .get_dictionary_mut(acroform_id)
                .map_err(document_error)?
                .set("Fields", Object::Array(vec![]));
        }

        let mut removed = 0;
        for page_id in self.page_ids.clone() {
            let annotations = self.page_annotations(page_id);
            if annotations.is_empty() {
                continue;
            }

            let before = annotations.len();
            let kept: Vec<Object> = annotations
                .into_iter()
                .filter(|a| !self.is_widget(a))
                .collect();
            removed += before - kept.len();
            self.set_page_annotations(page_id, kept)?;
        }

        self.names.clear();
        self.new_fields.clear();
        tracing::debug!(removed, "cleared existing form fields");

        Ok(removed)
    }

    fn add_widget(
        &mut self,
        page: usize,
        name: &str,
        rect: &PdfRect,
        mut field: Dictionary,
    ) -> Result<ObjectId> {
        let page_id = self.page_id(page)?;
        if self.names.contains(name) {
            return Err(Error::FieldNameCollision {
                name: name.to_string(),
            });
        }

        field.set("Type", Object::Name(b"Annot".to_vec()));
        field.set("Subtype", Object::Name(b"Widget".to_vec()));
        field.set("T", Object::string_literal(name));
        field.set("Rect", rect_object(rect));
        field.set("P", Object::Reference(page_id));

        let field_id = self.doc.add_object(Object::Dictionary(field));

        let mut annotations = self.page_annotations(page_id);
        annotations.push(Object::Reference(field_id));
        self.set_page_annotations(page_id, annotations)?;

        self.names.insert(name.to_string());
        self.new_fields.push(field_id);

        Ok(field_id)
    }

    /// Add an empty text field
    pub fn add_text_field(
        &mut self,
        page: usize,
        name: &str,
        rect: &PdfRect,
        multiline: bool,
    ) -> Result<ObjectId> {
        let flags = if multiline { FIELD_FLAG_MULTILINE } else { 0 };
        let field = dictionary! {
            "FT" => "Tx",
            "V" => Object::string_literal(""),
            "DV" => Object::string_literal(""),
            "Ff" => Object::Integer(flags),
            "DA" => Object::string_literal(TEXT_APPEARANCE),
        };
        self.add_widget(page, name, rect, field)
    }

    /// Add an unchecked two-state button
    pub fn add_checkbox_field(&mut self, page: usize, name: &str, rect: &PdfRect) -> Result<ObjectId> {
        let field = dictionary! {
            "FT" => "Btn",
            "Ff" => Object::Integer(0),
            "V" => "Off",
            "AS" => "Off",
            "MK" => dictionary! {
                "CA" => Object::string_literal("4"),
            },
            "DA" => Object::string_literal(CHECKBOX_APPEARANCE),
        };
        self.add_widget(page, name, rect, field)
    }

    /// Add an unsigned signature field
    pub fn add_signature_field(&mut self, page: usize, name: &str, rect: &PdfRect) -> Result<ObjectId> {
        let field = dictionary! {
            "FT" => "Sig",
            "F" => Object::Integer(ANNOT_FLAG_PRINT),
        };
        self.add_widget(page, name, rect, field)
    }

    /// Materialize a planned field as the annotation its kind calls for
    pub fn add_field(&mut self, field: &PlacedField, multiline_text: bool) -> Result<ObjectId> {
        match field.kind {
            FieldKind::Text => {
                self.add_text_field(field.page, &field.name, &field.rect, multiline_text)
            }
            FieldKind::Checkbox => self.add_checkbox_field(field.page, &field.name, &field.rect),
            FieldKind::Signature => self.add_signature_field(field.page, &field.name, &field.rect),
        }
    }

    /// Attach new fields to `/AcroForm /Fields` and make sure viewers can draw them
    fn reconcile_fields(&mut self) -> Result<()> {
        if self.new_fields.is_empty() {
            return Ok(());
        }

        let acroform_id = self.ensure_acroform()?;
        let mut fields = self.acroform_fields();
        for id in &self.new_fields {
            let attached = fields
                .iter()
                .any(|f| matches!(f, Object::Reference(existing) if existing == id));
            if !attached {
                fields.push(Object::Reference(*id));
            }
        }

        let needs_resources = !self
            .doc
            .get_dictionary(acroform_id)
            .map_err(document_error)?
            .has(b"DR");
        let resources = if needs_resources {
            let helv = self.doc.add_object(dictionary! {
                "Type" => "Font",
                "Subtype" => "Type1",
                "BaseFont" => "Helvetica",
                "Name" => "Helv",
                "Encoding" => "WinAnsiEncoding",
            });
            let zadb = self.doc.add_object(dictionary! {
                "Type" => "Font",
                "Subtype" => "Type1",
                "BaseFont" => "ZapfDingbats",
                "Name" => "ZaDb",
            });
            Some(dictionary! {
                "Font" => dictionary! {
                    "Helv" => Object::Reference(helv),
                    "ZaDb" => Object::Reference(zadb),
                },
            })
        } else {
            None
        };

        let acroform = self
            .doc
            .get_dictionary_mut(acroform_id)
            .map_err(document_error)?;
        acroform.set("Fields", Object::Array(fields));
        acroform.set("NeedAppearances", Object::Boolean(true));
        if !acroform.has(b"DA") {
            acroform.set("DA", Object::string_literal("/Helv 0 Tf 0 g"));
        }
        if let Some(resources) = resources {
            acroform.set("DR", resources);
        }

        Ok(())
    }

    /// Reconcile the field tree and serialize the document
    pub fn save_to_bytes(&mut self) -> Result<Vec<u8>> {
        self.reconcile_fields()?;

        let mut output = Vec::new();
        self.doc.save_to(&mut output).map_err(|e| Error::Document {
            reason: format!("Failed to save PDF: {}", e),
        })?;
        Ok(output)
    }

    /// Widget annotations currently attached to pages
    pub fn widgets(&self) -> Vec<WidgetAnnotation> {
        let mut widgets = Vec::new();
        for (page, page_id) in self.page_ids.iter().enumerate() {
            for annotation in self.page_annotations(*page_id) {
                if !self.is_widget(&annotation) {
                    continue;
                }
                let Some(dict) = self.resolve(&annotation).and_then(|o| o.as_dict().ok()) else {
                    continue;
                };

                let name = match dict.get(b"T") {
                    Ok(Object::String(bytes, _)) => Some(decode_text(bytes)),
                    _ => None,
                };
                let field_type = match dict.get(b"FT") {
                    Ok(Object::Name(n)) => Some(String::from_utf8_lossy(n).into_owned()),
                    _ => None,
                };
                let rect = dict
                    .get(b"Rect")
                    .ok()
                    .and_then(|r| self.resolve(r))
                    .and_then(|r| r.as_array().ok())
                    .filter(|r| r.len() == 4)
                    .and_then(|r| {
                        let v: Vec<f64> = r.iter().filter_map(number).collect();
                        (v.len() == 4).then(|| PdfRect::normalized(v[0], v[1], v[2], v[3]))
                    });
                let flags = dict.get(b"Ff").ok().and_then(number).unwrap_or(0.0) as i64;

                widgets.push(WidgetAnnotation {
                    page,
                    name,
                    field_type,
                    rect,
                    flags,
                });
            }
        }
        widgets
    }
}
