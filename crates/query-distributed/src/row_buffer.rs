//! Columnar row streams on top of the frame protocol
//!
//! A row stream starts with one JSON frame carrying the [`Schema`], then
//! any number of batches, then the end-of-stream marker. A batch is:
//!
//! - a row-count frame (`i32` LE)
//! - for each value column, then each key column:
//!   - a presence bitmap frame: `i32` LE flag count, then LSB-first packed bits
//!     (bit set = value present)
//!   - a values frame: `i32` LE count of present values, then the values
//!
//! Nulls take no space in the values frame; readers rebuild them from the
//! bitmap.

use crate::error::{DistributedError, Result};
use crate::wire::{FrameReader, FrameWriter, DEFAULT_MAX_MESSAGE_SIZE};
use query_core::{DataType, Field, QueryError, Row, RowsGroup, Schema, Value};
use tokio::io::{AsyncRead, AsyncWrite};

/// Largest batch a reader accepts unless told otherwise
pub const DEFAULT_MAX_BATCH_ROWS: usize = 1 << 20;

/// Buffers rows for one output and flushes them as columnar batches
pub struct RowsWriter<W> {
    frames: FrameWriter<W>,
    schema: Schema,
    buffer: RowsGroup,
    flush_threshold: usize,
    flush_count: usize,
    schema_sent: bool,
}

impl<W: AsyncWrite + Unpin> RowsWriter<W> {
    /// Create a writer; a batch is flushed as soon as `flush_threshold` rows
    /// are buffered
    pub fn new(inner: W, schema: Schema, flush_threshold: usize) -> Self {
        let buffer = RowsGroup::new(&schema);
        Self {
            frames: FrameWriter::new(inner),
            schema,
            buffer,
            flush_threshold: flush_threshold.max(1),
            flush_count: 0,
            schema_sent: false,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Rows waiting for the next flush
    pub fn buffered_rows(&self) -> usize {
        self.buffer.row_count()
    }

    /// Batches written so far
    pub fn flush_count(&self) -> usize {
        self.flush_count
    }

    /// Append one row, flushing when the buffer reaches the threshold
    pub async fn write_row(&mut self, row: Row) -> Result<()> {
        self.buffer.push(&self.schema, row)?;
        if self.buffer.row_count() >= self.flush_threshold {
            self.flush().await?;
        }
        Ok(())
    }

    /// Append every row of `group`
    pub async fn write_rows_group(&mut self, group: RowsGroup) -> Result<()> {
        for row in group.into_rows() {
            self.write_row(row).await?;
        }
        Ok(())
    }

    /// Write the buffered rows as one batch
    pub async fn flush(&mut self) -> Result<()> {
        self.send_schema().await?;
        if self.buffer.is_empty() {
            return Ok(());
        }

        let group = std::mem::replace(&mut self.buffer, RowsGroup::new(&self.schema));
        for message in encode_group(&group, &self.schema)? {
            self.frames.write_message(&message).await?;
        }
        self.frames.flush().await?;
        self.flush_count += 1;
        Ok(())
    }

    /// Flush, write the end-of-stream marker and shut the transport down
    pub async fn close(&mut self) -> Result<()> {
        if self.frames.is_finished() {
            return Ok(());
        }
        self.flush().await?;
        self.frames.close().await
    }

    /// Drop buffered rows and shut the transport down without the
    /// end-of-stream marker
    pub async fn abort(&mut self) -> Result<()> {
        self.buffer = RowsGroup::new(&self.schema);
        self.frames.abort().await
    }

    pub fn into_inner(self) -> W {
        self.frames.into_inner()
    }

    async fn send_schema(&mut self) -> Result<()> {
        if !self.schema_sent {
            self.frames.write_json(&self.schema).await?;
            self.schema_sent = true;
        }
        Ok(())
    }
}

/// Decodes a row stream written by [`RowsWriter`]
pub struct RowsReader<R> {
    frames: FrameReader<R>,
    expected: Option<Schema>,
    schema: Option<Schema>,
    max_batch_rows: usize,
    current: std::vec::IntoIter<Row>,
}

impl<R: AsyncRead + Unpin> RowsReader<R> {
    /// Create a reader. When `expected` is given the stream's schema must
    /// match it column for column.
    pub fn new(inner: R, expected: Option<Schema>) -> Self {
        Self::with_max_message_size(inner, expected, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(inner: R, expected: Option<Schema>, max_message_size: usize) -> Self {
        Self {
            frames: FrameReader::with_max_message_size(inner, max_message_size),
            expected,
            schema: None,
            max_batch_rows: DEFAULT_MAX_BATCH_ROWS,
            current: Vec::new().into_iter(),
        }
    }

    /// Reject batches announcing more than `max_batch_rows` rows
    pub fn with_max_batch_rows(mut self, max_batch_rows: usize) -> Self {
        self.max_batch_rows = max_batch_rows.max(1);
        self
    }

    /// Schema announced by the writer
    pub async fn schema(&mut self) -> Result<&Schema> {
        if self.schema.is_none() {
            let schema = self.read_handshake().await?;
            self.schema = Some(schema);
        }
        self.schema
            .as_ref()
            .ok_or_else(|| DistributedError::SchemaMismatch("schema not received".to_string()))
    }

    /// Next batch, `None` at end of stream
    pub async fn read_group(&mut self) -> Result<Option<RowsGroup>> {
        let schema = self.schema().await?.clone();

        let header = match self.frames.read_message().await? {
            Some(header) => header,
            None => return Ok(None),
        };
        let row_count = decode_row_count(&header)?;
        if row_count > self.max_batch_rows {
            return Err(decode_error(format!(
                "batch announces {} rows, limit is {}",
                row_count, self.max_batch_rows
            )));
        }

        let mut vals = Vec::with_capacity(schema.num_columns());
        for field in schema.fields() {
            vals.push(self.read_column(field, row_count).await?);
        }
        let mut keys = Vec::with_capacity(schema.num_keys());
        for field in schema.keys() {
            keys.push(self.read_column(field, row_count).await?);
        }

        Ok(Some(RowsGroup::from_columns(row_count, vals, keys)?))
    }

    /// Next row, `None` at end of stream
    pub async fn read_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.current.next() {
                return Ok(Some(row));
            }
            match self.read_group().await? {
                Some(group) => self.current = group.into_rows().into_iter(),
                None => return Ok(None),
            }
        }
    }

    /// Drain the stream into one vector of rows
    pub async fn read_all(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.read_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    async fn read_handshake(&mut self) -> Result<Schema> {
        let schema: Schema = self.frames.read_json().await?.ok_or_else(|| {
            DistributedError::SchemaMismatch("stream ended before its schema".to_string())
        })?;

        if let Some(expected) = &self.expected {
            check_schema(expected, &schema)?;
        }
        Ok(schema)
    }

    async fn read_column(&mut self, field: &Field, row_count: usize) -> Result<Vec<Value>> {
        let bitmap = self.read_batch_frame().await?;
        let values = self.read_batch_frame().await?;
        decode_column(field, row_count, &bitmap, &values)
    }

    async fn read_batch_frame(&mut self) -> Result<Vec<u8>> {
        self.frames
            .read_message()
            .await?
            .ok_or_else(|| DistributedError::Truncated("end of stream inside a batch".to_string()))
    }
}

fn check_schema(expected: &Schema, received: &Schema) -> Result<()> {
    let shape = |fields: &[Field]| fields.iter().map(|f| f.data_type()).collect::<Vec<_>>();
    if shape(expected.fields()) != shape(received.fields())
        || shape(expected.keys()) != shape(received.keys())
    {
        return Err(DistributedError::SchemaMismatch(format!(
            "expected columns {:?} keys {:?}, stream carries columns {:?} keys {:?}",
            shape(expected.fields()),
            shape(expected.keys()),
            shape(received.fields()),
            shape(received.keys()),
        )));
    }
    Ok(())
}

/// Encode one batch into its frame payloads, row count first
pub fn encode_group(group: &RowsGroup, schema: &Schema) -> Result<Vec<Vec<u8>>> {
    let columns = group.columns().iter().zip(schema.fields());
    let keys = group.key_columns().iter().zip(schema.keys());

    let mut messages = Vec::with_capacity(1 + 2 * (schema.num_columns() + schema.num_keys()));
    messages.push(encode_len(group.row_count())?.to_vec());
    for (values, field) in columns.chain(keys) {
        let (bitmap, data) = encode_column(values, field.data_type())?;
        messages.push(bitmap);
        messages.push(data);
    }
    Ok(messages)
}

/// Encode one column into its bitmap payload and its values payload
pub fn encode_column(values: &[Value], data_type: DataType) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut bitmap = Vec::with_capacity(4 + values.len().div_ceil(8));
    bitmap.extend_from_slice(&encode_len(values.len())?);
    bitmap.resize(4 + values.len().div_ceil(8), 0);

    let mut data = vec![0u8; 4];
    let mut present = 0usize;
    for (i, value) in values.iter().enumerate() {
        if value.is_null() {
            continue;
        }
        bitmap[4 + i / 8] |= 1 << (i % 8);
        encode_value(value, data_type, &mut data)?;
        present += 1;
    }
    data[..4].copy_from_slice(&encode_len(present)?);
    Ok((bitmap, data))
}

fn encode_len(len: usize) -> Result<[u8; 4]> {
    i32::try_from(len)
        .map(|n| n.to_le_bytes())
        .map_err(|_| decode_error(format!("count {} does not fit in i32", len)))
}

fn encode_value(value: &Value, data_type: DataType, out: &mut Vec<u8>) -> Result<()> {
    match (data_type, value) {
        (DataType::Boolean, Value::Boolean(b)) => out.push(*b as u8),
        (DataType::Int32, Value::Int32(n)) => out.extend_from_slice(&n.to_le_bytes()),
        (DataType::Int64, Value::Int64(n)) => out.extend_from_slice(&n.to_le_bytes()),
        (DataType::Float32, Value::Float32(n)) => out.extend_from_slice(&n.to_le_bytes()),
        (DataType::Float64, Value::Float64(n)) => out.extend_from_slice(&n.to_le_bytes()),
        (DataType::Utf8, Value::Utf8(s)) => {
            out.extend_from_slice(&encode_len(s.len())?);
            out.extend_from_slice(s.as_bytes());
        }
        (DataType::Date, Value::Date(secs)) | (DataType::Timestamp, Value::Timestamp(secs)) => {
            out.extend_from_slice(&secs.to_le_bytes())
        }
        (expected, other) => {
            return Err(QueryError::TypeMismatch {
                expected: expected.to_string(),
                found: other
                    .data_type()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "NULL".to_string()),
            }
            .into())
        }
    }
    Ok(())
}

fn decode_row_count(header: &[u8]) -> Result<usize> {
    let mut cursor = ByteCursor::new(header);
    let count = cursor.read_count("row count")?;
    if !cursor.is_empty() {
        return Err(decode_error(format!(
            "row count frame has {} trailing bytes",
            cursor.remaining()
        )));
    }
    Ok(count)
}

/// Decode one column from its bitmap and values payloads
pub fn decode_column(
    field: &Field,
    row_count: usize,
    bitmap: &[u8],
    values: &[u8],
) -> Result<Vec<Value>> {
    let mut bits = ByteCursor::new(bitmap);
    let flags = bits.read_count("bitmap length")?;
    if flags != row_count {
        return Err(decode_error(format!(
            "column '{}' bitmap has {} flags for {} rows",
            field.name(),
            flags,
            row_count
        )));
    }
    let packed = bits.take(row_count.div_ceil(8))?;

    let mut data = ByteCursor::new(values);
    let present = data.read_count("value count")?;

    let mut column = Vec::with_capacity(row_count);
    let mut consumed = 0usize;
    for i in 0..row_count {
        if packed[i / 8] & (1 << (i % 8)) == 0 {
            if !field.nullable() {
                return Err(decode_error(format!(
                    "null in non-nullable column '{}'",
                    field.name()
                )));
            }
            column.push(Value::Null);
        } else {
            column.push(data.read_value(field.data_type())?);
            consumed += 1;
        }
    }

    if consumed != present || !data.is_empty() {
        return Err(decode_error(format!(
            "column '{}' declares {} values, bitmap marks {}",
            field.name(),
            present,
            consumed
        )));
    }
    Ok(column)
}

fn decode_error(msg: String) -> DistributedError {
    QueryError::DecodeError(msg).into()
}

struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(decode_error(format!(
                "needed {} bytes, {} left",
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_count(&mut self, what: &str) -> Result<usize> {
        let n = i32::from_le_bytes(self.array()?);
        usize::try_from(n).map_err(|_| decode_error(format!("negative {}: {}", what, n)))
    }

    fn read_value(&mut self, data_type: DataType) -> Result<Value> {
        let value = match data_type {
            DataType::Boolean => Value::Boolean(self.array::<1>()?[0] != 0),
            DataType::Int32 => Value::Int32(i32::from_le_bytes(self.array()?)),
            DataType::Int64 => Value::Int64(i64::from_le_bytes(self.array()?)),
            DataType::Float32 => Value::Float32(f32::from_le_bytes(self.array()?)),
            DataType::Float64 => Value::Float64(f64::from_le_bytes(self.array()?)),
            DataType::Utf8 => {
                let len = self.read_count("string length")?;
                let bytes = self.take(len)?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|e| decode_error(format!("invalid UTF-8 in string value: {}", e)))?;
                Value::Utf8(s.to_string())
            }
            DataType::Date => Value::Date(i64::from_le_bytes(self.array()?)),
            DataType::Timestamp => Value::Timestamp(i64::from_le_bytes(self.array()?)),
        };
        Ok(value)
    }
}
