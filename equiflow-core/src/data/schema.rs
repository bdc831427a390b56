//! Raw column schema: required fields and case-insensitive header resolution.

use std::fmt;

/// A required field of a raw price row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Date,
    Symbol,
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl Field {
    /// Every field a raw batch must carry.
    pub const REQUIRED: [Field; 7] = [
        Field::Date,
        Field::Symbol,
        Field::Open,
        Field::High,
        Field::Low,
        Field::Close,
        Field::Volume,
    ];

    /// Canonical lowercase column name.
    pub fn name(self) -> &'static str {
        match self {
            Field::Date => "date",
            Field::Symbol => "symbol",
            Field::Open => "open",
            Field::High => "high",
            Field::Low => "low",
            Field::Close => "close",
            Field::Volume => "volume",
        }
    }

    /// Map a source header to a field.
    ///
    /// Matching ignores case and surrounding whitespace. Besides the canonical
    /// names this accepts the upstream API's keys (`"4. close"`) and the
    /// `OpenPrice`/`ClosePrice` spelling used by earlier extracts.
    pub fn from_header(header: &str) -> Option<Field> {
        let key = header.trim().to_ascii_lowercase();
        let field = match key.as_str() {
            "date" | "index" | "timestamp" => Field::Date,
            "symbol" | "ticker" => Field::Symbol,
            "open" | "openprice" | "open_price" | "1. open" => Field::Open,
            "high" | "highprice" | "high_price" | "2. high" => Field::High,
            "low" | "lowprice" | "low_price" | "3. low" => Field::Low,
            "close" | "closeprice" | "close_price" | "4. close" => Field::Close,
            "volume" | "5. volume" => Field::Volume,
            _ => return None,
        };
        Some(field)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Position of each required field within a batch's header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    positions: [usize; 7],
}

impl ColumnMap {
    /// Resolve the headers of a batch.
    ///
    /// When two headers map to the same field the first one wins. Unknown
    /// headers are ignored. Fails listing every required field that is absent.
    pub fn resolve(label: &str, headers: &[String]) -> Result<Self, SchemaError> {
        let mut found: [Option<usize>; 7] = [None; 7];
        for (pos, header) in headers.iter().enumerate() {
            if let Some(field) = Field::from_header(header) {
                found[field.index()].get_or_insert(pos);
            }
        }

        let missing: Vec<String> = Field::REQUIRED
            .iter()
            .filter(|f| found[f.index()].is_none())
            .map(|f| f.name().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(SchemaError {
                batch: label.to_string(),
                missing,
            });
        }

        let mut positions = [0usize; 7];
        for field in Field::REQUIRED {
            positions[field.index()] = found[field.index()].unwrap_or_default();
        }
        Ok(Self { positions })
    }

    /// Cell for `field` in `row`; short rows read as empty cells.
    pub fn cell<'a>(&self, row: &'a [String], field: Field) -> &'a str {
        row.get(self.positions[field.index()])
            .map(|s| s.as_str())
            .unwrap_or("")
    }
}

/// Required columns are absent from a batch. Fatal for the run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("batch '{batch}' is missing required columns: {}", .missing.join(", "))]
pub struct SchemaError {
    pub batch: String,
    pub missing: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolves_any_case_and_order() {
        let h = headers(&["VOLUME", "Symbol", " close ", "Low", "HIGH", "open", "Date"]);
        let map = ColumnMap::resolve("b", &h).unwrap();
        let row = headers(&["10", "aapl", "3", "2", "4", "1", "2024-01-02"]);
        assert_eq!(map.cell(&row, Field::Volume), "10");
        assert_eq!(map.cell(&row, Field::Symbol), "aapl");
        assert_eq!(map.cell(&row, Field::Close), "3");
        assert_eq!(map.cell(&row, Field::Date), "2024-01-02");
    }

    #[test]
    fn accepts_upstream_aliases() {
        let h = headers(&["Date", "OpenPrice", "High", "Low", "ClosePrice", "Volume", "Symbol"]);
        assert!(ColumnMap::resolve("b", &h).is_ok());

        let h = headers(&["index", "1. open", "2. high", "3. low", "4. close", "5. volume", "ticker"]);
        assert!(ColumnMap::resolve("b", &h).is_ok());
    }

    #[test]
    fn lists_every_missing_column() {
        let h = headers(&["date", "symbol", "open", "high"]);
        let err = ColumnMap::resolve("AAPL", &h).unwrap_err();
        assert_eq!(err.batch, "AAPL");
        assert_eq!(err.missing, vec!["low", "close", "volume"]);
        assert_eq!(
            err.to_string(),
            "batch 'AAPL' is missing required columns: low, close, volume"
        );
    }

    #[test]
    fn short_rows_read_as_empty() {
        let h = headers(&["date", "symbol", "open", "high", "low", "close", "volume"]);
        let map = ColumnMap::resolve("b", &h).unwrap();
        let row = headers(&["2024-01-02", "AAPL"]);
        assert_eq!(map.cell(&row, Field::Volume), "");
    }

    #[test]
    fn first_matching_header_wins() {
        let h = headers(&["date", "symbol", "open", "high", "low", "close", "ClosePrice", "volume"]);
        let map = ColumnMap::resolve("b", &h).unwrap();
        let row = headers(&["d", "s", "o", "h", "l", "c1", "c2", "v"]);
        assert_eq!(map.cell(&row, Field::Close), "c1");
    }
}
