//! Per-resource defaults.
//!
//! Resource spellings match the remote API: `form`, `case`, `user`,
//! `location`, `location_type`, `messaging-event`, `ucr`.

use hqexport_types::checkpoint::PaginationMode;

pub const DEFAULT_PAGE_SIZE: u64 = 200;
pub const UCR_PAGE_SIZE: u64 = 1000;

/// Pagination mode used when no checkpoint dictates otherwise.
#[must_use]
pub fn default_pagination_mode(resource: &str) -> PaginationMode {
    match resource {
        "form" | "case" => PaginationMode::DateIndexed,
        "messaging-event" => PaginationMode::Cursor,
        _ => PaginationMode::Offset,
    }
}

#[must_use]
pub fn default_page_size(resource: &str) -> u64 {
    if resource == "ucr" {
        UCR_PAGE_SIZE
    } else {
        DEFAULT_PAGE_SIZE
    }
}

/// Timestamp field driving a date-windowed pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateField {
    /// Field name in response records.
    pub field: String,
    /// Request parameter for the window start.
    pub start_param: String,
}

/// Date field for (resource, mode), when the mode is date-windowed.
#[must_use]
pub fn date_field(resource: &str, mode: PaginationMode) -> Option<DateField> {
    match mode {
        PaginationMode::DateIndexed => Some(DateField {
            field: "indexed_on".to_owned(),
            start_param: "indexed_on_start".to_owned(),
        }),
        PaginationMode::DateModified => {
            let field = match resource {
                "form" => "server_modified_on",
                "case" => "server_date_modified",
                _ => return None,
            };
            Some(DateField {
                field: field.to_owned(),
                start_param: format!("{field}_start"),
            })
        }
        PaginationMode::Cursor | PaginationMode::Offset => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_defaults() {
        assert_eq!(
            default_pagination_mode("form"),
            PaginationMode::DateIndexed
        );
        assert_eq!(
            default_pagination_mode("case"),
            PaginationMode::DateIndexed
        );
        assert_eq!(
            default_pagination_mode("messaging-event"),
            PaginationMode::Cursor
        );
        assert_eq!(default_pagination_mode("user"), PaginationMode::Offset);
    }

    #[test]
    fn page_size_defaults() {
        assert_eq!(default_page_size("ucr"), 1000);
        assert_eq!(default_page_size("case"), 200);
    }

    #[test]
    fn legacy_date_fields() {
        let f = date_field("form", PaginationMode::DateModified).unwrap();
        assert_eq!(f.field, "server_modified_on");
        let c = date_field("case", PaginationMode::DateModified).unwrap();
        assert_eq!(c.start_param, "server_date_modified_start");
        assert!(date_field("user", PaginationMode::DateModified).is_none());
    }
}
