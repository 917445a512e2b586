//! Integration tests for the form pipeline
//!
//! Documents are built in memory with lopdf. Rendering and detection are
//! replaced by stubs so no PDFium library or model weights are needed.

use lopdf::{dictionary, Document, Object, ObjectId, Stream, StringFormat};
use pdf_formify::detect::{DetectParams, DetectionMap, FieldDetector};
use pdf_formify::form::{FieldKind, Widget, WidgetType};
use pdf_formify::geometry::{BoundingBox, PageBox};
use pdf_formify::pdf::{FormDocument, Page, PageRenderer};
use pdf_formify::{prepare_form_with, Error, FormOptions, FormPipeline};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ============================================================================
// Fixtures
// ============================================================================

const LETTER: [i64; 4] = [0, 0, 612, 792];
const CROP: [i64; 4] = [36, 36, 576, 756];

fn number_array(values: &[i64]) -> Object {
    Object::Array(values.iter().map(|v| Object::Integer(*v)).collect())
}

/// Blank document; every page inherits a Letter MediaBox from the page tree
fn build_document(page_count: usize, crop_box: Option<[i64; 4]>) -> (Document, Vec<ObjectId>) {
    let mut doc = Document::with_version("1.7");
    let pages_id = doc.new_object_id();

    let content_id = doc.add_object(Stream::new(dictionary! {}, b"q Q".to_vec()));
    let page_ids: Vec<ObjectId> = (0..page_count)
        .map(|_| {
            let mut page = dictionary! {
                "Type" => "Page",
                "Parent" => Object::Reference(pages_id),
                "Contents" => Object::Reference(content_id),
            };
            if let Some(crop) = crop_box {
                page.set("CropBox", number_array(&crop));
            }
            doc.add_object(page)
        })
        .collect();

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => page_ids.iter().map(|id| Object::Reference(*id)).collect::<Vec<_>>(),
            "Count" => page_count as i64,
            "MediaBox" => number_array(&LETTER),
        }),
    );

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", Object::Reference(catalog_id));

    (doc, page_ids)
}

fn save(mut doc: Document) -> Vec<u8> {
    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).unwrap();
    buffer
}

fn blank_pdf(page_count: usize, crop_box: Option<[i64; 4]>) -> Vec<u8> {
    save(build_document(page_count, crop_box).0)
}

/// One page that already carries a text field named `existing_name`
fn pdf_with_field(existing_name: &str) -> Vec<u8> {
    let (mut doc, page_ids) = build_document(1, None);
    let field_id = doc.add_object(dictionary! {
        "Type" => "Annot",
        "Subtype" => "Widget",
        "FT" => "Tx",
        "T" => Object::string_literal(existing_name),
        "Rect" => number_array(&[72, 700, 300, 720]),
        "P" => Object::Reference(page_ids[0]),
    });
    doc.get_dictionary_mut(page_ids[0])
        .unwrap()
        .set("Annots", vec![Object::Reference(field_id)]);

    let acroform_id = doc.add_object(dictionary! {
        "Fields" => vec![Object::Reference(field_id)],
    });
    doc.catalog_mut()
        .unwrap()
        .set("AcroForm", Object::Reference(acroform_id));

    save(doc)
}

const PAD_BYTES: [u8; 32] = [
    0x28, 0xBF, 0x4E, 0x5E, 0x4E, 0x75, 0x8A, 0x41, 0x64, 0x00, 0x4E, 0x56, 0xFF, 0xFA, 0x01, 0x08,
    0x2E, 0x2E, 0x00, 0xB6, 0xD0, 0x68, 0x3E, 0x80, 0x2F, 0x0C, 0xA9, 0xFE, 0x64, 0x53, 0x69, 0x7A,
];

fn rc4(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut s: Vec<u8> = (0..=255).collect();
    let mut j: usize = 0;
    for i in 0..256 {
        j = (j + s[i] as usize + key[i % key.len()] as usize) & 0xFF;
        s.swap(i, j);
    }
    let mut out = Vec::with_capacity(data.len());
    let (mut i, mut j) = (0usize, 0usize);
    for &byte in data {
        i = (i + 1) & 0xFF;
        j = (j + s[i] as usize) & 0xFF;
        s.swap(i, j);
        out.push(byte ^ s[(s[i] as usize + s[j] as usize) & 0xFF]);
    }
    out
}

/// A one-page document protected by the standard security handler (RC4-40)
fn encrypted_pdf(user_password: &[u8]) -> Vec<u8> {
    let file_id = b"formifytestid001";
    let permissions: i32 = -4;

    let mut padded = user_password[..user_password.len().min(32)].to_vec();
    padded.extend_from_slice(&PAD_BYTES[..32 - padded.len()]);

    let owner_key = md5::compute(&padded);
    let o_value = rc4(&owner_key[..5], &padded);

    let mut key_input = padded.clone();
    key_input.extend_from_slice(&o_value);
    key_input.extend_from_slice(&(permissions as u32).to_le_bytes());
    key_input.extend_from_slice(file_id);
    let key = md5::compute(&key_input)[..5].to_vec();
    let u_value = rc4(&key, &PAD_BYTES);

    let (mut doc, _) = build_document(1, None);
    for (&(id, generation), obj) in doc.objects.iter_mut() {
        let mut object_key = key.clone();
        object_key.extend_from_slice(&id.to_le_bytes()[..3]);
        object_key.extend_from_slice(&generation.to_le_bytes()[..2]);
        let digest = md5::compute(&object_key);
        if let Object::Stream(stream) = obj {
            let encrypted = rc4(&digest[..10], &stream.content);
            stream.set_content(encrypted);
        }
    }

    let encrypt_id = doc.add_object(dictionary! {
        "Filter" => "Standard",
        "V" => 1_i64,
        "R" => 2_i64,
        "Length" => 40_i64,
        "O" => Object::String(o_value, StringFormat::Literal),
        "U" => Object::String(u_value, StringFormat::Literal),
        "P" => permissions as i64,
    });
    doc.trailer.set("Encrypt", Object::Reference(encrypt_id));
    doc.trailer.set(
        "ID",
        Object::Array(vec![
            Object::String(file_id.to_vec(), StringFormat::Literal),
            Object::String(file_id.to_vec(), StringFormat::Literal),
        ]),
    );

    save(doc)
}

// ============================================================================
// Stub backends
// ============================================================================

/// One blank Letter-sized raster per page; refuses documents lopdf cannot open
struct BlankRenderer;

impl PageRenderer for BlankRenderer {
    fn render(&self, data: &[u8]) -> pdf_formify::Result<Vec<Page>> {
        let document = FormDocument::load(data)?;
        Ok((0..document.page_count())
            .map(|i| Page::new(i, image::RgbImage::new(612, 792)))
            .collect())
    }
}

/// Returns fixed detections and remembers the parameters it was called with
struct FixedDetector {
    detections: DetectionMap,
    seen: Mutex<Vec<DetectParams>>,
}

impl FixedDetector {
    fn new(widgets: Vec<Widget>) -> Self {
        let mut detections = DetectionMap::new();
        for widget in widgets {
            detections.entry(widget.page).or_default().push(widget);
        }
        Self {
            detections,
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl FieldDetector for FixedDetector {
    fn detect(&self, _pages: &[Page], params: &DetectParams) -> pdf_formify::Result<DetectionMap> {
        self.seen.lock().unwrap().push(*params);
        Ok(self.detections.clone())
    }
}

fn widget(widget_type: WidgetType, page: usize, cx: f64, cy: f64, w: f64, h: f64) -> Widget {
    Widget::new(widget_type, BoundingBox::from_center(cx, cy, w, h), page)
}

/// The two detections from the reference end-to-end scenario
fn text_and_checkbox() -> Vec<Widget> {
    vec![
        widget(WidgetType::ChoiceButton, 0, 0.3, 0.5, 0.03, 0.03),
        widget(WidgetType::TextBox, 0, 0.3, 0.2, 0.2, 0.05),
    ]
}

fn run(data: &[u8], widgets: Vec<Widget>, options: &FormOptions) -> pdf_formify::Result<Vec<u8>> {
    let detector = FixedDetector::new(widgets);
    FormPipeline::new(&BlankRenderer, &detector)
        .run(data, options)
        .map(|prepared| prepared.data)
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn test_two_detections_become_named_fields() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("flat.pdf");
    let output = dir.path().join("fillable.pdf");
    std::fs::write(&input, blank_pdf(1, Some(CROP))).unwrap();

    let fields = prepare_form_with(
        &input,
        &output,
        &FormOptions::default(),
        Arc::new(BlankRenderer),
        Arc::new(FixedDetector::new(text_and_checkbox())),
    )
    .await
    .unwrap();

    let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["textbox_0_0", "choicebutton_0_1"]);

    let written = FormDocument::load(&std::fs::read(&output).unwrap()).unwrap();
    let widgets = written.widgets();
    assert_eq!(widgets.len(), 2);

    let crop = PageBox::from_array(CROP.map(|v| v as f64));
    let summary: Vec<(Option<&str>, Option<&str>)> = widgets
        .iter()
        .map(|w| (w.name.as_deref(), w.field_type.as_deref()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (Some("textbox_0_0"), Some("Tx")),
            (Some("choicebutton_0_1"), Some("Btn")),
        ]
    );

    for annotation in &widgets {
        let rect = annotation.rect.unwrap();
        assert!(rect.x0 <= rect.x1 && rect.y0 <= rect.y1);
        assert!(rect.is_within(&crop), "{rect:?} outside {crop:?}");
    }

    // Text box sits near the top of the page: its top edge is 20% down the crop box
    let text_rect = widgets[0].rect.unwrap();
    let expected_top = 756.0 - (0.2 - 0.025) * 720.0;
    assert!((text_rect.y1 - expected_top).abs() < 1e-3);
}

#[tokio::test]
async fn test_encrypted_document_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("locked.pdf");
    let output = dir.path().join("fillable.pdf");
    std::fs::write(&input, encrypted_pdf(b"secret")).unwrap();

    let err = prepare_form_with(
        &input,
        &output,
        &FormOptions::default(),
        Arc::new(BlankRenderer),
        Arc::new(FixedDetector::new(text_and_checkbox())),
    )
    .await
    .unwrap_err();

    assert!(err.is_encrypted(), "unexpected error: {err}");
    assert_eq!(err.client_message(), "PDF is password protected");
    assert!(!output.exists());
}

#[tokio::test]
async fn test_failed_run_leaves_no_partial_output() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("flat.pdf");
    let output = dir.path().join("fillable.pdf");
    std::fs::write(&input, blank_pdf(1, None)).unwrap();

    // Detection on a page the document does not have
    let err = prepare_form_with(
        &input,
        &output,
        &FormOptions::default(),
        Arc::new(BlankRenderer),
        Arc::new(FixedDetector::new(vec![widget(
            WidgetType::TextBox,
            3,
            0.5,
            0.5,
            0.1,
            0.1,
        )])),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::PageOutOfBounds { page: 3, total: 1 }));
    assert!(!output.exists());
}

#[tokio::test]
async fn test_missing_input() {
    let dir = TempDir::new().unwrap();
    let err = prepare_form_with(
        &dir.path().join("absent.pdf"),
        &dir.path().join("out.pdf"),
        &FormOptions::default(),
        Arc::new(BlankRenderer),
        Arc::new(FixedDetector::new(vec![])),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::PdfNotFound { .. }));
}

// ============================================================================
// Materialize options
// ============================================================================

#[test]
fn test_existing_fields_cleared_by_default() {
    let data = run(
        &pdf_with_field("legacy"),
        text_and_checkbox(),
        &FormOptions::default(),
    )
    .unwrap();

    let document = FormDocument::load(&data).unwrap();
    assert_eq!(
        document.field_names(),
        vec!["choicebutton_0_1".to_string(), "textbox_0_0".to_string()]
    );
}

#[test]
fn test_keep_existing_fields() {
    let options = FormOptions {
        keep_existing_fields: true,
        ..FormOptions::default()
    };
    let data = run(&pdf_with_field("legacy"), text_and_checkbox(), &options).unwrap();

    let document = FormDocument::load(&data).unwrap();
    assert_eq!(
        document.field_names(),
        vec![
            "choicebutton_0_1".to_string(),
            "legacy".to_string(),
            "textbox_0_0".to_string(),
        ]
    );
    assert_eq!(document.widgets().len(), 3);
}

#[test]
fn test_kept_field_name_collision_aborts() {
    let options = FormOptions {
        keep_existing_fields: true,
        ..FormOptions::default()
    };
    let err = run(&pdf_with_field("textbox_0_0"), text_and_checkbox(), &options).unwrap_err();

    assert!(matches!(err, Error::FieldNameCollision { ref name } if name == "textbox_0_0"));
}

#[rstest]
#[case(false, FieldKind::Text, "Tx")]
#[case(true, FieldKind::Signature, "Sig")]
fn test_signature_materialization(
    #[case] use_signature_fields: bool,
    #[case] expected_kind: FieldKind,
    #[case] expected_type: &str,
) {
    let options = FormOptions {
        use_signature_fields,
        ..FormOptions::default()
    };
    let detector = FixedDetector::new(vec![widget(
        WidgetType::Signature,
        0,
        0.7,
        0.9,
        0.25,
        0.04,
    )]);
    let prepared = FormPipeline::new(&BlankRenderer, &detector)
        .run(&blank_pdf(1, None), &options)
        .unwrap();

    assert_eq!(prepared.fields[0].name, "signature_0_0");
    assert_eq!(prepared.fields[0].kind, expected_kind);

    let document = FormDocument::load(&prepared.data).unwrap();
    assert_eq!(
        document.widgets()[0].field_type.as_deref(),
        Some(expected_type)
    );
}

#[rstest]
#[case(false, 0)]
#[case(true, 1 << 12)]
fn test_multiline_text_fields(#[case] multiline_text_fields: bool, #[case] flags: i64) {
    let options = FormOptions {
        multiline_text_fields,
        ..FormOptions::default()
    };
    let data = run(
        &blank_pdf(1, None),
        vec![widget(WidgetType::TextBox, 0, 0.5, 0.5, 0.4, 0.1)],
        &options,
    )
    .unwrap();

    let document = FormDocument::load(&data).unwrap();
    assert_eq!(document.widgets()[0].flags, flags);
}

// ============================================================================
// Multi-page and staged flows
// ============================================================================

#[test]
fn test_pages_are_numbered_independently() {
    let widgets = vec![
        widget(WidgetType::TextBox, 2, 0.6, 0.3, 0.2, 0.03),
        widget(WidgetType::TextBox, 2, 0.2, 0.302, 0.2, 0.03),
        widget(WidgetType::ChoiceButton, 0, 0.1, 0.1, 0.02, 0.02),
    ];
    let detector = FixedDetector::new(widgets);
    let prepared = FormPipeline::new(&BlankRenderer, &detector)
        .run(&blank_pdf(3, None), &FormOptions::default())
        .unwrap();

    let placed: Vec<(&str, usize)> = prepared
        .fields
        .iter()
        .map(|f| (f.name.as_str(), f.page))
        .collect();
    assert_eq!(
        placed,
        vec![("choicebutton_0_0", 0), ("textbox_2_0", 2), ("textbox_2_1", 2)]
    );
    // Same row, left field first
    assert!(prepared.fields[1].bounding_box.x0 < prepared.fields[2].bounding_box.x0);

    let document = FormDocument::load(&prepared.data).unwrap();
    let pages: Vec<usize> = document.widgets().iter().map(|w| w.page).collect();
    assert_eq!(pages, vec![0, 2, 2]);
}

#[test]
fn test_fast_mode_overrides_image_size() {
    let options = FormOptions {
        fast: true,
        image_size: 2048,
        confidence: 0.5,
        ..FormOptions::default()
    };
    let detector = FixedDetector::new(vec![]);
    FormPipeline::new(&BlankRenderer, &detector)
        .run(&blank_pdf(1, None), &options)
        .unwrap();

    let seen = detector.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].fast);
    assert_eq!(seen[0].confidence, 0.5);
    assert_eq!(seen[0].effective_image_size(), 1216);
}

#[rstest]
#[case(0, 0.3)]
#[case(1_000_000, 0.3)]
#[case(1600, f32::NAN)]
fn test_out_of_range_options_rejected_before_detection(
    #[case] image_size: u32,
    #[case] confidence: f32,
) {
    let options = FormOptions {
        image_size,
        confidence,
        ..FormOptions::default()
    };
    let detector = FixedDetector::new(text_and_checkbox());
    let err = FormPipeline::new(&BlankRenderer, &detector)
        .run(&blank_pdf(1, None), &options)
        .err()
        .unwrap();

    assert!(matches!(err, Error::InvalidOption { .. }), "unexpected error: {err}");
    assert!(detector.seen.lock().unwrap().is_empty());
}

#[test]
fn test_plan_does_not_modify_document() {
    let data = pdf_with_field("legacy");
    let detector = FixedDetector::new(text_and_checkbox());
    let planned = FormPipeline::new(&BlankRenderer, &detector)
        .plan(&data, &FormOptions::default())
        .unwrap();

    assert_eq!(planned.len(), 2);
    let document = FormDocument::load(&data).unwrap();
    assert_eq!(document.field_names(), vec!["legacy".to_string()]);
}

#[test]
fn test_apply_reviewed_widgets() {
    let data = blank_pdf(2, Some(CROP));
    let detector = FixedDetector::new(vec![
        widget(WidgetType::TextBox, 0, 0.3, 0.2, 0.2, 0.05),
        widget(WidgetType::TextBox, 0, 0.3, 0.4, 0.2, 0.05),
        widget(WidgetType::ChoiceButton, 1, 0.5, 0.5, 0.03, 0.03),
    ]);
    let planned = FormPipeline::new(&BlankRenderer, &detector)
        .plan(&data, &FormOptions::default())
        .unwrap();

    // The caller drops the second text box
    let reviewed: Vec<Widget> = planned
        .iter()
        .filter(|f| f.name != "textbox_0_1")
        .map(|f| Widget::new(f.widget_type, f.bounding_box, f.page))
        .collect();

    let prepared = FormPipeline::apply(&data, reviewed, &FormOptions::default()).unwrap();
    let document = FormDocument::load(&prepared.data).unwrap();
    assert_eq!(
        document.field_names(),
        vec!["choicebutton_1_0".to_string(), "textbox_0_0".to_string()]
    );
}

#[test]
fn test_no_detections_still_clears_fields() {
    let data = run(&pdf_with_field("legacy"), vec![], &FormOptions::default()).unwrap();
    let document = FormDocument::load(&data).unwrap();
    assert!(document.field_names().is_empty());
    assert!(document.widgets().is_empty());
}
