//! Naming and placement of sorted widgets

use super::order::sort_widgets;
use super::widget::{DetectionMap, Widget, WidgetType};
use crate::error::{Error, Result};
use crate::geometry::{page_rect, BoundingBox, PageBox, PdfRect};
use rmcp::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The annotation kind a widget is materialized as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// `/FT /Tx`
    Text,
    /// Two-state `/FT /Btn`
    Checkbox,
    /// `/FT /Sig`
    Signature,
}

impl FieldKind {
    /// Resolve the annotation kind for a detected widget type.
    ///
    /// Signatures become text fields unless signature fields are enabled.
    pub fn for_widget(widget_type: WidgetType, use_signature_fields: bool) -> Self {
        match widget_type {
            WidgetType::TextBox => FieldKind::Text,
            WidgetType::ChoiceButton => FieldKind::Checkbox,
            WidgetType::Signature if use_signature_fields => FieldKind::Signature,
            WidgetType::Signature => FieldKind::Text,
        }
    }
}

/// A widget that has been named and mapped into page space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlacedField {
    /// Fully-qualified field name (`{type}_{page}_{index}`)
    pub name: String,
    /// Annotation kind to create
    pub kind: FieldKind,
    /// Detected widget type
    pub widget_type: WidgetType,
    /// Page index (0-indexed)
    pub page: usize,
    /// Normalized box on the rendered page
    pub bounding_box: BoundingBox,
    /// Rectangle in PDF user space
    pub rect: PdfRect,
}

/// Field name for the `index`-th widget (in reading order) on `page`
pub fn field_name(widget_type: WidgetType, page: usize, index: usize) -> String {
    format!("{}_{}_{}", widget_type.slug(), page, index)
}

/// Sort every page's widgets, name them and map them onto their page box.
///
/// `page_boxes[i]` is the CropBox (or MediaBox) of page `i`. Pages are
/// independent of each other; the output is grouped by ascending page and
/// ordered for tab navigation within each page.
pub fn plan_fields(
    detections: &DetectionMap,
    page_boxes: &[PageBox],
    use_signature_fields: bool,
) -> Result<Vec<PlacedField>> {
    let mut placed = Vec::new();
    let mut names = HashSet::new();

    for (&page, widgets) in detections {
        let page_box = page_boxes.get(page).ok_or(Error::PageOutOfBounds {
            page,
            total: page_boxes.len(),
        })?;

        let sorted: Vec<Widget> = sort_widgets(widgets.clone());
        for (index, widget) in sorted.into_iter().enumerate() {
            let name = field_name(widget.widget_type, page, index);
            if !names.insert(name.clone()) {
                return Err(Error::FieldNameCollision { name });
            }

            placed.push(PlacedField {
                name,
                kind: FieldKind::for_widget(widget.widget_type, use_signature_fields),
                widget_type: widget.widget_type,
                page,
                rect: page_rect(&widget.bounding_box, page_box),
                bounding_box: widget.bounding_box,
            });
        }
    }

    Ok(placed)
}
