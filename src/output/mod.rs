pub mod csv;
pub mod json;
pub mod plain;

pub use csv::output_csv;
pub use json::output_json;
pub use plain::output_plain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Plain,
    Json,
    Csv,
}

impl OutputFormat {
    /// Command-line flags win over the config file's `json_output` default.
    pub fn select(json_flag: bool, csv_flag: bool, json_default: bool) -> Self {
        if json_flag {
            OutputFormat::Json
        } else if csv_flag {
            OutputFormat::Csv
        } else if json_default {
            OutputFormat::Json
        } else {
            OutputFormat::Plain
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_flag_overrides_json_default() {
        assert_eq!(OutputFormat::select(false, true, true), OutputFormat::Csv);
    }

    #[test]
    fn test_format_selection() {
        assert_eq!(OutputFormat::select(false, false, false), OutputFormat::Plain);
        assert_eq!(OutputFormat::select(false, false, true), OutputFormat::Json);
        assert_eq!(OutputFormat::select(true, false, false), OutputFormat::Json);
        assert_eq!(OutputFormat::select(false, true, false), OutputFormat::Csv);
    }
}
