//! Raw cell to display string.

use super::dataset::RawCell;

/// Convert any cell into the string the template will see.
///
/// Missing values and non-finite numbers become `""`. Text is trimmed,
/// integral floats drop their fractional part and dates use `YYYY-MM-DD`.
pub fn normalize(cell: &RawCell) -> String {
    match cell {
        RawCell::Empty => String::new(),
        RawCell::Text(text) => text.trim().to_string(),
        RawCell::Integer(value) => value.to_string(),
        RawCell::Number(value) if !value.is_finite() => String::new(),
        // -0.0 would otherwise print as "-0"
        RawCell::Number(value) if *value == 0.0 => "0".to_string(),
        RawCell::Number(value) => value.to_string(),
        RawCell::Bool(value) => value.to_string(),
        RawCell::Date(date) => date.format("%Y-%m-%d").to_string(),
    }
}
