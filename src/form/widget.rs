use crate::error::{Error, Result};
use crate::geometry::BoundingBox;
use rmcp::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Detected widgets keyed by 0-indexed page.
///
/// Pages without detections have no entry; a missing key and an empty list
/// mean the same thing.
pub type DetectionMap = BTreeMap<usize, Vec<Widget>>;

/// The field kinds the detector can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum WidgetType {
    TextBox,
    ChoiceButton,
    Signature,
}

impl WidgetType {
    /// All kinds, in detector class-id order
    pub const ALL: [WidgetType; 3] = [
        WidgetType::TextBox,
        WidgetType::ChoiceButton,
        WidgetType::Signature,
    ];

    /// Map a detector class id to a kind
    pub fn from_class_id(class_id: usize) -> Option<Self> {
        Self::ALL.get(class_id).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WidgetType::TextBox => "TextBox",
            WidgetType::ChoiceButton => "ChoiceButton",
            WidgetType::Signature => "Signature",
        }
    }

    /// Lowercase tag used as the field-name prefix
    pub fn slug(&self) -> &'static str {
        match self {
            WidgetType::TextBox => "textbox",
            WidgetType::ChoiceButton => "choicebutton",
            WidgetType::Signature => "signature",
        }
    }
}

impl std::fmt::Display for WidgetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected form field on one page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Widget {
    /// Field kind
    pub widget_type: WidgetType,
    /// Normalized box on the rendered page image
    pub bounding_box: BoundingBox,
    /// Page index (0-indexed)
    pub page: usize,
}

impl Widget {
    pub fn new(widget_type: WidgetType, bounding_box: BoundingBox, page: usize) -> Self {
        Self {
            widget_type,
            bounding_box,
            page,
        }
    }

    /// Build a widget from raw detector output.
    ///
    /// Class ids outside the known kinds fail the whole run rather than
    /// silently dropping a field the user would never see.
    pub fn from_detection(page: usize, class_id: usize, bounding_box: BoundingBox) -> Result<Self> {
        let widget_type = WidgetType::from_class_id(class_id)
            .ok_or(Error::InvalidDetectorOutput { page, class_id })?;
        Ok(Self::new(widget_type, bounding_box, page))
    }
}
