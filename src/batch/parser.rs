use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

/// One parsed record: the absolute byte offset of its first byte in the
/// source, plus the decoded field payloads. Fields that need no
/// unescaping or re-encoding are zero-copy views into the fed chunk.
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub byte_offset: u64,
    pub fields: Vec<Bytes>,
}

/// Incremental quote-aware parser for delimited text.
///
/// Chunks are fed in arrival order; records fully contained in one chunk
/// are sliced out of it without copying. Only a record spanning a chunk
/// boundary is assembled into an owned carry buffer.
pub struct DelimitedParser {
    delimiter: u8,
    encoding: TextEncoding,
    carry: Vec<u8>,
    carry_offset: u64,
    carry_in_quotes: bool,
    consumed: u64,
}

impl DelimitedParser {
    pub fn new(delimiter: u8, encoding: TextEncoding) -> Self {
        DelimitedParser {
            delimiter,
            encoding,
            carry: Vec::new(),
            carry_offset: 0,
            carry_in_quotes: false,
            consumed: 0,
        }
    }

    /// Feed the next chunk, returning every record it completes.
    pub fn feed(&mut self, chunk: &Bytes) -> Vec<ParsedRecord> {
        let mut records = Vec::new();
        let mut start = 0usize;
        let mut in_quotes = self.carry_in_quotes;

        for i in 0..chunk.len() {
            let b = chunk[i];
            if b == b'"' {
                // Toggling on every quote is enough for boundary
                // detection: an escaped "" flips off and straight back
                // on with no byte in between.
                in_quotes = !in_quotes;
            } else if b == b'\n' && !in_quotes {
                let (raw, offset) = if self.carry.is_empty() {
                    (chunk.slice(start..=i), self.consumed + start as u64)
                } else {
                    self.carry.extend_from_slice(&chunk[start..=i]);
                    let raw = Bytes::from(std::mem::take(&mut self.carry));
                    (raw, self.carry_offset)
                };
                if let Some(record) = self.parse_record(raw, offset) {
                    records.push(record);
                }
                start = i + 1;
            }
        }

        // Unterminated tail becomes (or extends) the carry.
        if start < chunk.len() {
            if self.carry.is_empty() {
                self.carry_offset = self.consumed + start as u64;
            }
            self.carry.extend_from_slice(&chunk[start..]);
        }
        self.carry_in_quotes = in_quotes;
        self.consumed += chunk.len() as u64;

        records
    }

    /// Flush the final unterminated record, if any.
    pub fn finish(&mut self) -> Option<ParsedRecord> {
        if self.carry.is_empty() {
            return None;
        }
        let raw = Bytes::from(std::mem::take(&mut self.carry));
        let offset = self.carry_offset;
        self.carry_in_quotes = false;
        self.parse_record(raw, offset)
    }

    /// Absolute offset of the next byte the parser expects.
    pub fn bytes_consumed(&self) -> u64 {
        self.consumed
    }

    fn parse_record(&self, raw: Bytes, byte_offset: u64) -> Option<ParsedRecord> {
        // Strip the record terminator.
        let mut end = raw.len();
        if end > 0 && raw[end - 1] == b'\n' {
            end -= 1;
        }
        if end > 0 && raw[end - 1] == b'\r' {
            end -= 1;
        }
        let raw = raw.slice(..end);
        if raw.is_empty() {
            return None;
        }

        let mut fields = Vec::new();
        let mut i = 0usize;
        let n = raw.len();

        loop {
            if i < n && raw[i] == b'"' {
                fields.push(self.parse_quoted_field(&raw, &mut i));
            } else {
                let field_end = raw[i..]
                    .iter()
                    .position(|&b| b == self.delimiter)
                    .map(|p| i + p)
                    .unwrap_or(n);
                fields.push(self.decode(raw.slice(i..field_end)));
                i = field_end;
            }

            if i >= n {
                break;
            }
            // Skip the delimiter; a record ending on one has a trailing
            // empty field.
            i += 1;
            if i == n {
                fields.push(Bytes::new());
                break;
            }
        }

        Some(ParsedRecord {
            byte_offset,
            fields,
        })
    }

    fn parse_quoted_field(&self, raw: &Bytes, i: &mut usize) -> Bytes {
        let n = raw.len();
        *i += 1; // opening quote
        let content_start = *i;
        let mut has_escape = false;
        let mut j = *i;
        while j < n {
            if raw[j] == b'"' {
                if j + 1 < n && raw[j + 1] == b'"' {
                    has_escape = true;
                    j += 2;
                } else {
                    break;
                }
            } else {
                j += 1;
            }
        }
        let content_end = j.min(n);

        let field = if has_escape {
            let mut out = Vec::with_capacity(content_end - content_start);
            let mut k = content_start;
            while k < content_end {
                if raw[k] == b'"' && k + 1 < content_end && raw[k + 1] == b'"' {
                    out.push(b'"');
                    k += 2;
                } else {
                    out.push(raw[k]);
                    k += 1;
                }
            }
            self.decode(Bytes::from(out))
        } else {
            self.decode(raw.slice(content_start..content_end))
        };

        // Move past the closing quote and on to the next delimiter.
        *i = content_end + 1;
        while *i < n && raw[*i] != self.delimiter {
            *i += 1;
        }
        field
    }

    fn decode(&self, field: Bytes) -> Bytes {
        match self.encoding {
            TextEncoding::Utf8 => field,
            TextEncoding::Latin1 => {
                if field.iter().all(|b| b.is_ascii()) {
                    field
                } else {
                    let s: String = field.iter().map(|&b| b as char).collect();
                    Bytes::from(s.into_bytes())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &str, delimiter: u8) -> Vec<Vec<String>> {
        let mut parser = DelimitedParser::new(delimiter, TextEncoding::Utf8);
        let mut records = parser.feed(&Bytes::copy_from_slice(input.as_bytes()));
        records.extend(parser.finish());
        records
            .into_iter()
            .map(|r| {
                r.fields
                    .iter()
                    .map(|f| String::from_utf8_lossy(f).into_owned())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn parses_simple_rows() {
        let rows = parse_all("name,age\nAlice,30\nBob,25\n", b',');
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec!["name", "age"]);
        assert_eq!(rows[1], vec!["Alice", "30"]);
    }

    #[test]
    fn final_row_without_newline_is_flushed_on_finish() {
        let rows = parse_all("a,b\n1,2", b',');
        assert_eq!(rows[1], vec!["1", "2"]);
    }

    #[test]
    fn quoted_fields_keep_delimiters_and_newlines() {
        let rows = parse_all("note,x\n\"hello, world\",1\n\"line\nbreak\",2\n", b',');
        assert_eq!(rows[1][0], "hello, world");
        assert_eq!(rows[2][0], "line\nbreak");
    }

    #[test]
    fn escaped_quotes_are_unescaped() {
        let rows = parse_all("q\n\"she said \"\"hi\"\"\"\n", b',');
        assert_eq!(rows[1][0], "she said \"hi\"");
    }

    #[test]
    fn trailing_delimiter_yields_empty_field() {
        let rows = parse_all("a,b,\n", b',');
        assert_eq!(rows[0], vec!["a", "b", ""]);
    }

    #[test]
    fn records_spanning_chunks_are_reassembled() {
        let mut parser = DelimitedParser::new(b',', TextEncoding::Utf8);
        let mut records = parser.feed(&Bytes::from_static(b"alpha,be"));
        assert!(records.is_empty());
        records.extend(parser.feed(&Bytes::from_static(b"ta\ngamma,delta\n")));
        assert_eq!(records.len(), 2);
        assert_eq!(&records[0].fields[1][..], b"beta");
        assert_eq!(records[0].byte_offset, 0);
        assert_eq!(records[1].byte_offset, 9);
    }

    #[test]
    fn quoted_newline_spanning_chunks() {
        let mut parser = DelimitedParser::new(b',', TextEncoding::Utf8);
        let mut records = parser.feed(&Bytes::from_static(b"\"a\nb"));
        assert!(records.is_empty());
        records.extend(parser.feed(&Bytes::from_static(b"c\",2\n")));
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0].fields[0][..], b"a\nbc");
    }

    #[test]
    fn byte_offsets_track_record_starts() {
        let mut parser = DelimitedParser::new(b',', TextEncoding::Utf8);
        let records = parser.feed(&Bytes::from_static(b"h1,h2\nr1,r2\nr3,r4\n"));
        let offsets: Vec<u64> = records.iter().map(|r| r.byte_offset).collect();
        assert_eq!(offsets, vec![0, 6, 12]);
    }

    #[test]
    fn latin1_high_bytes_are_transcoded() {
        let mut parser = DelimitedParser::new(b';', TextEncoding::Latin1);
        let mut records = parser.feed(&Bytes::from_static(&[b'n', 0xE9, b';', b'1', b'\n']));
        records.extend(parser.finish());
        assert_eq!(String::from_utf8_lossy(&records[0].fields[0]), "né");
    }

    #[test]
    fn tab_delimiter() {
        let rows = parse_all("a\tb\n1\t2\n", b'\t');
        assert_eq!(rows[1], vec!["1", "2"]);
    }
}
