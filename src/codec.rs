use std::io::Write;
use std::path::PathBuf;

use duckdb::Connection;

use crate::error::{LakeError, LakeResult};

pub const PARQUET_MAGIC: &[u8; 4] = b"PAR1";

/// One decoded/encoded row of the cold-file schema:
/// `{timestamp:int64, point_name:utf8, value:float64}`.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRow {
    pub timestamp_ms: i64,
    pub point_name: String,
    pub value: f64,
}

fn escape_csv_field(value: &str) -> String {
    if value.contains(['"', ',', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Streaming-capable Parquet encoder: rows are appended to a staging CSV
/// file batch by batch (bounded memory regardless of day size), then
/// compiled into a Snappy-compressed Parquet file by DuckDB in one
/// blocking pass over the CSV. Never holds more than one caller-supplied
/// batch in memory, so a full day of archived rows never has to fit in
/// RAM at once.
pub struct StreamingParquetEncoder {
    csv_path: PathBuf,
    file: std::fs::File,
    tmp_root: PathBuf,
}

impl StreamingParquetEncoder {
    pub fn create(tmp_root: &std::path::Path) -> LakeResult<Self> {
        std::fs::create_dir_all(tmp_root)
            .map_err(|err| LakeError::ColdStore(format!("create tmp root: {err}")))?;
        let csv_path = tmp_root.join(format!("{}.csv", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&csv_path)
            .map_err(|err| LakeError::ColdStore(format!("create staging csv: {err}")))?;
        writeln!(file, "ts_ms,point_name,value")
            .map_err(|err| LakeError::ColdStore(format!("write csv header: {err}")))?;
        Ok(Self {
            csv_path,
            file,
            tmp_root: tmp_root.to_path_buf(),
        })
    }

    pub fn write_batch(&mut self, rows: &[EncodedRow]) -> LakeResult<()> {
        for row in rows {
            writeln!(
                self.file,
                "{},{},{}",
                row.timestamp_ms,
                escape_csv_field(&row.point_name),
                row.value
            )
            .map_err(|err| LakeError::ColdStore(format!("write csv row: {err}")))?;
        }
        Ok(())
    }

    /// Compiles the staged CSV into Parquet bytes and removes the staging
    /// file. Runs on a blocking thread because the `duckdb` crate's API is
    /// synchronous.
    pub async fn finish(self) -> LakeResult<Vec<u8>> {
        self.file
            .sync_all()
            .map_err(|err| LakeError::ColdStore(format!("sync staging csv: {err}")))?;
        drop(self.file);

        let csv_path = self.csv_path;
        let parquet_path = self.tmp_root.join(format!("{}.parquet", uuid::Uuid::new_v4()));
        let result = tokio::task::spawn_blocking({
            let csv_path = csv_path.clone();
            let parquet_path = parquet_path.clone();
            move || compile_csv_to_parquet(&csv_path, &parquet_path)
        })
        .await
        .map_err(|err| LakeError::Internal(format!("encoder task panicked: {err}")))?;

        let cleanup = || {
            let _ = std::fs::remove_file(&csv_path);
            let _ = std::fs::remove_file(&parquet_path);
        };

        match result {
            Ok(()) => {
                let bytes = std::fs::read(&parquet_path)
                    .map_err(|err| LakeError::ColdStore(format!("read compiled parquet: {err}")));
                cleanup();
                let bytes = bytes?;
                validate_parquet_magic(&bytes)?;
                Ok(bytes)
            }
            Err(err) => {
                cleanup();
                Err(err)
            }
        }
    }
}

fn compile_csv_to_parquet(csv_path: &std::path::Path, parquet_path: &std::path::Path) -> LakeResult<()> {
    let conn = Connection::open_in_memory()
        .map_err(|err| LakeError::ColdStore(format!("open duckdb: {err}")))?;
    let csv = csv_path.display();
    let out = parquet_path.display();
    let sql = format!(
        "COPY (
            SELECT ts_ms::BIGINT AS timestamp, point_name::VARCHAR AS point_name, value::DOUBLE AS value
            FROM read_csv_auto('{csv}', header=true)
            ORDER BY timestamp, point_name
        ) TO '{out}' (FORMAT PARQUET, COMPRESSION SNAPPY)"
    );
    conn.execute_batch(&sql)
        .map_err(|err| LakeError::ColdStore(format!("compile parquet: {err}")))
}

fn validate_parquet_magic(bytes: &[u8]) -> LakeResult<()> {
    if bytes.len() < 8 || &bytes[0..4] != PARQUET_MAGIC || &bytes[bytes.len() - 4..] != PARQUET_MAGIC {
        return Err(LakeError::Integrity(
            "encoded file is missing the Parquet magic header".to_string(),
        ));
    }
    Ok(())
}

/// Decodes a full Parquet file already in memory (cold objects are
/// size-capped on read, so holding one decoded day in memory is fine).
pub async fn decode_bytes(bytes: &[u8]) -> LakeResult<Vec<EncodedRow>> {
    validate_parquet_magic(bytes)?;
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || decode_bytes_blocking(&bytes))
        .await
        .map_err(|err| LakeError::Internal(format!("decoder task panicked: {err}")))?
}

fn decode_bytes_blocking(bytes: &[u8]) -> LakeResult<Vec<EncodedRow>> {
    let tmp_dir = std::env::temp_dir();
    let path = tmp_dir.join(format!("{}.parquet", uuid::Uuid::new_v4()));
    std::fs::write(&path, bytes)
        .map_err(|err| LakeError::ColdStore(format!("stage parquet for decode: {err}")))?;

    let conn = Connection::open_in_memory()
        .map_err(|err| LakeError::ColdStore(format!("open duckdb: {err}")))?;
    let sql = format!(
        "SELECT timestamp, point_name, value FROM read_parquet('{}') ORDER BY timestamp, point_name",
        path.display()
    );
    let result = (|| -> LakeResult<Vec<EncodedRow>> {
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|err| LakeError::ColdStore(format!("prepare decode query: {err}")))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(EncodedRow {
                    timestamp_ms: row.get(0)?,
                    point_name: row.get(1)?,
                    value: row.get(2)?,
                })
            })
            .map_err(|err| LakeError::ColdStore(format!("decode parquet: {err}")))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|err| LakeError::ColdStore(format!("decode parquet row: {err}")))
    })();

    let _ = std::fs::remove_file(&path);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn encodes_and_decodes_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut encoder = StreamingParquetEncoder::create(tmp.path()).unwrap();
        encoder
            .write_batch(&[
                EncodedRow { timestamp_ms: 200, point_name: "p2".into(), value: 2.0 },
                EncodedRow { timestamp_ms: 100, point_name: "p1".into(), value: 1.0 },
            ])
            .unwrap();
        encoder
            .write_batch(&[EncodedRow { timestamp_ms: 150, point_name: "p1,comma".into(), value: 1.5 }])
            .unwrap();
        let bytes = encoder.finish().await.unwrap();
        assert_eq!(&bytes[0..4], PARQUET_MAGIC);

        let decoded = decode_bytes(&bytes).await.unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].timestamp_ms, 100);
        assert_eq!(decoded[1].timestamp_ms, 150);
        assert_eq!(decoded[1].point_name, "p1,comma");
        assert_eq!(decoded[2].timestamp_ms, 200);
    }

    #[test]
    fn rejects_bytes_without_parquet_magic() {
        let err = validate_parquet_magic(b"not a parquet file").unwrap_err();
        assert!(matches!(err, LakeError::Integrity(_)));
    }
}
