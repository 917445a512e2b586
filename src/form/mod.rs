//! Form-field model and the pure steps between detection and the PDF writer
//!
//! - `widget`: detected fields and their closed set of kinds
//! - `order`: reading-order reconstruction for tab navigation
//! - `layout`: naming and page-space placement of sorted widgets

mod layout;
mod order;
mod widget;

pub use layout::{field_name, plan_fields, FieldKind, PlacedField};
pub use order::{sort_widgets, ROW_THRESHOLD};
pub use widget::{DetectionMap, Widget, WidgetType};
