//! CSV ingestion: read a delimited file into a raw batch without typing it.

use std::io::Read;
use std::path::Path;

use super::provider::DataError;
use crate::domain::RawBatch;

/// Read a CSV file with a header line. The batch is labelled with the file name.
pub fn read_csv_batch(path: &Path) -> Result<RawBatch, DataError> {
    let file = std::fs::File::open(path).map_err(|e| DataError::RawFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let label = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    parse_csv_batch(&label, file)
}

/// Parse CSV text from any reader.
///
/// Rows may be ragged; cells are trimmed. Header validation is left to the
/// normalizer so that every missing column is reported at once.
pub fn parse_csv_batch<R: Read>(label: &str, reader: R) -> Result<RawBatch, DataError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let raw_file_error = |e: csv::Error| DataError::RawFile {
        path: label.to_string(),
        reason: e.to_string(),
    };

    let headers: Vec<String> = rdr
        .headers()
        .map_err(raw_file_error)?
        .iter()
        .map(str::to_string)
        .collect();

    let mut batch = RawBatch::new(label, headers);
    for record in rdr.records() {
        let record = record.map_err(raw_file_error)?;
        batch.push_row(record.iter().map(str::to_string).collect());
    }
    Ok(batch)
}
