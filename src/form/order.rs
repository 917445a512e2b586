//! Reading order for detected widgets

use super::widget::Widget;
use std::cmp::Ordering;

/// Vertical distance (normalized page units) under which two widgets share a row
pub const ROW_THRESHOLD: f64 = 0.01;

/// Round the exact decimal value of `value` to three places, ties to even
fn round3(value: f64) -> f64 {
    format!("{:.3}", value).parse().unwrap_or(value)
}

fn by_x0(a: &Widget, b: &Widget) -> Ordering {
    a.bounding_box.x0.total_cmp(&b.bounding_box.x0)
}

/// Order one page's widgets for tab navigation: rows top to bottom, each row
/// left to right.
///
/// Widgets are first sorted by `(round(y0, 3), x0)`. Rows are then built by
/// walking that order; a widget joins the open row while its `y0` is within
/// [`ROW_THRESHOLD`] of the row's *first* member, so a row never drifts
/// downward through a staircase of slightly offset fields. The page field is
/// not consulted.
pub fn sort_widgets(widgets: Vec<Widget>) -> Vec<Widget> {
    if widgets.is_empty() {
        return widgets;
    }

    let mut sorted = widgets;
    sorted.sort_by(|a, b| {
        round3(a.bounding_box.y0)
            .total_cmp(&round3(b.bounding_box.y0))
            .then_with(|| by_x0(a, b))
    });

    let mut ordered = Vec::with_capacity(sorted.len());
    let mut row: Vec<Widget> = Vec::new();

    for widget in sorted {
        let starts_new_row = row.first().is_some_and(|anchor| {
            (widget.bounding_box.y0 - anchor.bounding_box.y0).abs() >= ROW_THRESHOLD
        });
        if starts_new_row {
            row.sort_by(by_x0);
            ordered.append(&mut row);
        }
        row.push(widget);
    }

    row.sort_by(by_x0);
    ordered.append(&mut row);

    ordered
}
