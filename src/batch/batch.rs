use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{CellValue, RowId, parse_boolean};

const BATCH_MAGIC: u32 = 0x4753_4231;
const BATCH_VERSION: u16 = 1;

/// Ingestion counters captured when a batch is sealed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchStats {
    pub rows_parsed: u64,
    pub bytes_parsed: u64,
    pub end_of_file: bool,
}

/// Per-row null bitmap, one bit per row.
#[derive(Debug, Clone, Default)]
pub struct NullMask {
    words: Vec<u64>,
}

impl NullMask {
    pub fn with_rows(rows: usize) -> Self {
        NullMask {
            words: vec![0; rows.div_ceil(64)],
        }
    }

    pub fn set(&mut self, row: usize) {
        self.words[row / 64] |= 1 << (row % 64);
    }

    pub fn get(&self, row: usize) -> bool {
        self.words
            .get(row / 64)
            .map(|w| w & (1 << (row % 64)) != 0)
            .unwrap_or(false)
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn from_words(words: Vec<u64>) -> Self {
        NullMask { words }
    }
}

/// Typed column payload for one batch. The encoding is chosen per batch
/// from what the rows actually contain; the dataset-level column type is
/// tracked separately by inference.
#[derive(Debug, Clone)]
pub enum ColumnData {
    Numbers(Vec<f64>),
    Booleans(NullMask),
    /// Cells are refcounted views into the parse chunk (during
    /// ingestion) or into the decoded file payload (after readback).
    Text { cells: Vec<Bytes> },
}

#[derive(Debug, Clone)]
pub struct ColumnBuffer {
    pub data: ColumnData,
    pub nulls: NullMask,
}

/// A chunk of rows stored column-wise. Immutable once sealed.
#[derive(Debug, Clone)]
pub struct RowBatch {
    pub first_row_id: RowId,
    pub row_ids: Vec<RowId>,
    pub columns: Vec<ColumnBuffer>,
    pub stats: BatchStats,
}

impl RowBatch {
    pub fn len(&self) -> usize {
        self.row_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_ids.is_empty()
    }

    pub fn cell(&self, local_row: usize, column: usize) -> CellValue {
        let Some(col) = self.columns.get(column) else {
            return CellValue::Null;
        };
        if col.nulls.get(local_row) {
            return CellValue::Null;
        }
        match &col.data {
            ColumnData::Numbers(values) => CellValue::Number(values[local_row]),
            ColumnData::Booleans(bits) => CellValue::Boolean(bits.get(local_row)),
            ColumnData::Text { cells } => CellValue::Text(cells[local_row].clone()),
        }
    }
}

/// Accumulates parsed rows until the batch is sealed into typed columns.
pub struct BatchBuilder {
    first_row_id: RowId,
    column_count: usize,
    rows: Vec<Vec<Bytes>>,
}

impl BatchBuilder {
    pub fn new(first_row_id: RowId, column_count: usize) -> Self {
        BatchBuilder {
            first_row_id,
            column_count,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Short rows are padded with empty (null) cells; extra fields past
    /// the header width are dropped.
    pub fn push_row(&mut self, mut fields: Vec<Bytes>) {
        fields.truncate(self.column_count);
        while fields.len() < self.column_count {
            fields.push(Bytes::new());
        }
        self.rows.push(fields);
    }

    pub fn seal(self, stats: BatchStats) -> RowBatch {
        let rows = self.rows.len();
        let row_ids: Vec<RowId> = (0..rows as u32).map(|i| self.first_row_id + i).collect();

        let mut columns = Vec::with_capacity(self.column_count);
        for col in 0..self.column_count {
            columns.push(seal_column(&self.rows, col, rows));
        }

        RowBatch {
            first_row_id: self.first_row_id,
            row_ids,
            columns,
            stats,
        }
    }
}

fn seal_column(rows: &[Vec<Bytes>], col: usize, row_count: usize) -> ColumnBuffer {
    let mut nulls = NullMask::with_rows(row_count);
    let mut non_null = 0usize;
    for (i, row) in rows.iter().enumerate() {
        if row[col].is_empty() {
            nulls.set(i);
        } else {
            non_null += 1;
        }
    }

    let mut all_numeric = true;
    let mut all_boolean = true;
    for row in rows {
        let cell = &row[col];
        if cell.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(cell);
        let trimmed = text.trim();
        if all_numeric && trimmed.parse::<f64>().is_err() {
            all_numeric = false;
        }
        if all_boolean && parse_boolean(trimmed).is_none() {
            all_boolean = false;
        }
        if !all_numeric && !all_boolean {
            // No typed encoding can apply; stop probing.
            break;
        }
    }

    let data = if non_null > 0 && all_numeric {
        let mut values = vec![f64::NAN; row_count];
        for (i, row) in rows.iter().enumerate() {
            if !nulls.get(i) {
                values[i] = String::from_utf8_lossy(&row[col]).trim().parse().unwrap_or(f64::NAN);
            }
        }
        ColumnData::Numbers(values)
    } else if non_null > 0 && all_boolean {
        let mut bits = NullMask::with_rows(row_count);
        for (i, row) in rows.iter().enumerate() {
            if !nulls.get(i)
                && parse_boolean(String::from_utf8_lossy(&row[col]).trim()) == Some(true)
            {
                bits.set(i);
            }
        }
        ColumnData::Booleans(bits)
    } else {
        let cells = rows.iter().map(|row| row[col].clone()).collect();
        ColumnData::Text { cells }
    };

    ColumnBuffer { data, nulls }
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchFileHeader {
    version: u16,
    row_count: u32,
    first_row_id: RowId,
    column_count: u16,
    checksum: u32,
    stats: BatchStats,
}

const TAG_NUMBERS: u8 = 0;
const TAG_BOOLEANS: u8 = 1;
const TAG_TEXT: u8 = 2;

/// Serialize a sealed batch. Column buffers stream straight into the
/// frame encoder; text cells in particular are written one view at a
/// time without first assembling a contiguous payload.
pub fn encode_batch(batch: &RowBatch) -> Result<Vec<u8>> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());

    for col in &batch.columns {
        write_words(&mut encoder, col.nulls.words())?;
        match &col.data {
            ColumnData::Numbers(values) => {
                encoder.write_all(&[TAG_NUMBERS])?;
                for v in values {
                    encoder.write_all(&v.to_le_bytes())?;
                }
            }
            ColumnData::Booleans(bits) => {
                encoder.write_all(&[TAG_BOOLEANS])?;
                write_words(&mut encoder, bits.words())?;
            }
            ColumnData::Text { cells } => {
                encoder.write_all(&[TAG_TEXT])?;
                let mut offset = 0u32;
                for cell in cells {
                    encoder.write_all(&offset.to_le_bytes())?;
                    offset += cell.len() as u32;
                }
                encoder.write_all(&offset.to_le_bytes())?;
                for cell in cells {
                    encoder.write_all(cell)?;
                }
            }
        }
    }

    let body = encoder
        .finish()
        .map_err(|e| Error::new(ErrorKind::Io, e.to_string()))?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);

    let header = BatchFileHeader {
        version: BATCH_VERSION,
        row_count: batch.len() as u32,
        first_row_id: batch.first_row_id,
        column_count: batch.columns.len() as u16,
        checksum: hasher.finalize(),
        stats: batch.stats,
    };
    let header_bytes = bincode::serialize(&header)?;

    let mut out = Vec::with_capacity(12 + header_bytes.len() + body.len());
    out.extend_from_slice(&BATCH_MAGIC.to_le_bytes());
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode_batch(data: &[u8]) -> Result<RowBatch> {
    if data.len() < 8 {
        return Err(Error::new(ErrorKind::Parse, "batch file too short"));
    }
    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if magic != BATCH_MAGIC {
        return Err(Error::new(ErrorKind::Parse, "bad batch magic"));
    }
    let header_len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    if data.len() < 8 + header_len {
        return Err(Error::new(ErrorKind::Parse, "truncated batch header"));
    }
    let header: BatchFileHeader = bincode::deserialize(&data[8..8 + header_len])?;
    if header.version != BATCH_VERSION {
        return Err(Error::new(
            ErrorKind::Parse,
            format!("unsupported batch version {}", header.version),
        ));
    }

    let body = &data[8 + header_len..];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != header.checksum {
        return Err(Error::new(ErrorKind::Parse, "batch checksum mismatch"));
    }

    let mut decoder = lz4_flex::frame::FrameDecoder::new(body);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| Error::new(ErrorKind::Parse, e.to_string()))?;
    let raw = Bytes::from(raw);

    let rows = header.row_count as usize;
    let null_words = rows.div_ceil(64);
    let mut cursor = 0usize;
    let mut columns = Vec::with_capacity(header.column_count as usize);

    for _ in 0..header.column_count {
        let nulls = NullMask::from_words(read_words(&raw, &mut cursor, null_words)?);
        let tag = *raw
            .get(cursor)
            .ok_or_else(|| Error::new(ErrorKind::Parse, "truncated column tag"))?;
        cursor += 1;

        let data = match tag {
            TAG_NUMBERS => {
                let mut values = Vec::with_capacity(rows);
                for _ in 0..rows {
                    let bytes = slice_checked(&raw, cursor, 8)?;
                    values.push(f64::from_le_bytes(bytes.as_ref().try_into().unwrap()));
                    cursor += 8;
                }
                ColumnData::Numbers(values)
            }
            TAG_BOOLEANS => {
                ColumnData::Booleans(NullMask::from_words(read_words(&raw, &mut cursor, null_words)?))
            }
            TAG_TEXT => {
                let mut offsets = Vec::with_capacity(rows + 1);
                for _ in 0..=rows {
                    let bytes = slice_checked(&raw, cursor, 4)?;
                    offsets.push(u32::from_le_bytes(bytes.as_ref().try_into().unwrap()) as usize);
                    cursor += 4;
                }
                let payload_len = *offsets.last().unwrap_or(&0);
                let payload = slice_checked(&raw, cursor, payload_len)?;
                cursor += payload_len;
                let cells = offsets
                    .windows(2)
                    .map(|w| payload.slice(w[0]..w[1]))
                    .collect();
                ColumnData::Text { cells }
            }
            other => {
                return Err(Error::new(
                    ErrorKind::Parse,
                    format!("unknown column tag {}", other),
                ));
            }
        };
        columns.push(ColumnBuffer { data, nulls });
    }

    let row_ids = (0..header.row_count)
        .map(|i| header.first_row_id + i)
        .collect();

    Ok(RowBatch {
        first_row_id: header.first_row_id,
        row_ids,
        columns,
        stats: header.stats,
    })
}

fn write_words<W: Write>(w: &mut W, words: &[u64]) -> Result<()> {
    for word in words {
        w.write_all(&word.to_le_bytes())?;
    }
    Ok(())
}

fn read_words(raw: &Bytes, cursor: &mut usize, count: usize) -> Result<Vec<u64>> {
    let mut words = Vec::with_capacity(count);
    for _ in 0..count {
        let bytes = slice_checked(raw, *cursor, 8)?;
        words.push(u64::from_le_bytes(bytes.as_ref().try_into().unwrap()));
        *cursor += 8;
    }
    Ok(words)
}

fn slice_checked(raw: &Bytes, start: usize, len: usize) -> Result<Bytes> {
    if start + len > raw.len() {
        return Err(Error::new(ErrorKind::Parse, "truncated batch body"));
    }
    Ok(raw.slice(start..start + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> RowBatch {
        let mut builder = BatchBuilder::new(0, 3);
        builder.push_row(vec![
            Bytes::from_static(b"Alice"),
            Bytes::from_static(b"30"),
            Bytes::from_static(b"true"),
        ]);
        builder.push_row(vec![
            Bytes::from_static(b"Bob"),
            Bytes::from_static(b"25"),
            Bytes::from_static(b"false"),
        ]);
        builder.push_row(vec![Bytes::from_static(b"Carol"), Bytes::new(), Bytes::new()]);
        builder.seal(BatchStats {
            rows_parsed: 3,
            bytes_parsed: 42,
            end_of_file: true,
        })
    }

    #[test]
    fn seal_picks_typed_encodings() {
        let batch = sample_batch();
        assert!(matches!(batch.columns[0].data, ColumnData::Text { .. }));
        assert!(matches!(batch.columns[1].data, ColumnData::Numbers(_)));
        assert!(matches!(batch.columns[2].data, ColumnData::Booleans(_)));
    }

    #[test]
    fn cells_resolve_with_nulls() {
        let batch = sample_batch();
        assert_eq!(batch.cell(0, 1), CellValue::Number(30.0));
        assert_eq!(batch.cell(1, 2), CellValue::Boolean(false));
        assert_eq!(batch.cell(2, 1), CellValue::Null);
        assert_eq!(batch.cell(2, 0).display().unwrap(), "Carol");
    }

    #[test]
    fn encode_decode_round_trip() {
        let batch = sample_batch();
        let bytes = encode_batch(&batch).unwrap();
        let decoded = decode_batch(&bytes).unwrap();
        assert_eq!(decoded.len(), batch.len());
        assert_eq!(decoded.first_row_id, 0);
        for row in 0..batch.len() {
            for col in 0..3 {
                assert_eq!(decoded.cell(row, col), batch.cell(row, col));
            }
        }
        assert!(decoded.stats.end_of_file);
    }

    #[test]
    fn corrupted_body_is_rejected() {
        let batch = sample_batch();
        let mut bytes = encode_batch(&batch).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = decode_batch(&bytes).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
    }

    #[test]
    fn short_rows_pad_with_nulls() {
        let mut builder = BatchBuilder::new(10, 2);
        builder.push_row(vec![Bytes::from_static(b"only")]);
        let batch = builder.seal(BatchStats {
            rows_parsed: 1,
            bytes_parsed: 5,
            end_of_file: false,
        });
        assert_eq!(batch.row_ids, vec![10]);
        assert_eq!(batch.cell(0, 1), CellValue::Null);
    }
}
