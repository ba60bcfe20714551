//! CSV persistence of flushed batches.
//!
//! One file per device and session, named `cu_<YYYYmmdd_HHMMSS>_<device>.csv`. The
//! file starts with a `# `-commented header block (title, date, column list, signal
//! list, channel numbers) followed by one record per sample, appended at every
//! flush:
//!
//! ```text
//! date, time, <flags...>, <presets...>, <raw signals...>, <signal>_c...
//! ```

use chrono::{DateTime, Local};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::device::{Batch, BatchSchema};
use crate::error::AppResult;

pub struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: u64,
}

impl CsvSink {
    pub fn file_name(device: &str, started: DateTime<Local>) -> String {
        format!("cu_{}_{device}.csv", started.format("%Y%m%d_%H%M%S"))
    }

    /// Data columns in record order.
    pub fn columns(schema: &BatchSchema) -> Vec<String> {
        ["date", "time"]
            .iter()
            .map(|c| c.to_string())
            .chain(schema.flag_columns.iter().cloned())
            .chain(schema.preset_columns.iter().cloned())
            .chain(schema.raw_columns.iter().cloned())
            .chain(schema.converted_columns())
            .collect()
    }

    pub fn header_lines(title: &str, started: DateTime<Local>, schema: &BatchSchema) -> Vec<String> {
        let channels = schema
            .channel_numbers
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        vec![
            format!("Title , {title}"),
            format!("Date , {}", started.format("%Y-%m-%d %H:%M:%S")),
            format!("Columns , {}", Self::columns(schema).join(", ")),
            format!("Signals , {}", schema.raw_columns.join(", ")),
            format!("Channels , {channels}"),
            "For converted signals '_c' is added".to_string(),
            String::new(),
            "[Data]".to_string(),
        ]
    }

    /// Create the file in `dir` and write the header block.
    pub fn create(
        dir: &Path,
        device: &str,
        title: &str,
        started: DateTime<Local>,
        schema: &BatchSchema,
    ) -> AppResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::file_name(device, started));
        let mut file = File::create(&path)?;
        for line in Self::header_lines(title, started, schema) {
            if line.is_empty() {
                writeln!(file, "#")?;
            } else {
                writeln!(file, "# {line}")?;
            }
        }
        info!(device, path = %path.display(), "CSV file created");
        Ok(Self {
            path,
            writer: csv::Writer::from_writer(file),
            rows: 0,
        })
    }

    /// Append one record per sample and flush.
    pub fn write_batch(&mut self, batch: &Batch) -> AppResult<()> {
        for (sample, converted) in batch.samples.iter().zip(&batch.converted) {
            let record: Vec<String> = [
                sample.timestamp.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
                sample.elapsed.to_string(),
            ]
            .into_iter()
            .chain(sample.flags.iter().map(i32::to_string))
            .chain(sample.presets.iter().map(f64::to_string))
            .chain(sample.raw.iter().map(f64::to_string))
            .chain(converted.iter().map(f64::to_string))
            .collect();
            self.writer.write_record(&record)?;
            self.rows += 1;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Sample;
    use std::sync::Arc;

    fn schema() -> BatchSchema {
        BatchSchema {
            flag_columns: vec!["IGmode".into(), "IGrange".into(), "trigger".into()],
            preset_columns: vec!["MFC1".into()],
            raw_columns: vec!["Pu".into(), "Ip".into()],
            channel_numbers: vec![0, 1],
        }
    }

    #[test]
    fn columns_follow_record_layout() {
        assert_eq!(
            CsvSink::columns(&schema()),
            vec!["date", "time", "IGmode", "IGrange", "trigger", "MFC1", "Pu", "Ip", "Pu_c", "Ip_c"]
        );
    }

    #[test]
    fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let started = Local::now();
        let schema = Arc::new(schema());
        let mut sink = CsvSink::create(dir.path(), "adc", "Test run", started, &schema).unwrap();

        let mut batch = Batch::new(schema);
        batch.push(
            Sample {
                timestamp: started,
                elapsed: 0.5,
                flags: vec![0, -5, 1],
                presets: vec![1.2],
                raw: vec![1.0, 2.52],
            },
            vec![1.0e-5, 0.0],
        );
        sink.write_batch(&batch).unwrap();
        sink.write_batch(&batch).unwrap();
        assert_eq!(sink.rows(), 2);

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# Title , Test run");
        assert!(lines[2].starts_with("# Columns , date, time, IGmode"));
        assert_eq!(lines[3], "# Signals , Pu, Ip");
        assert_eq!(lines[4], "# Channels , 0, 1");
        assert_eq!(lines[6], "#");
        assert_eq!(lines[7], "# [Data]");
        assert_eq!(lines.len(), 10);
        assert!(lines[8].ends_with(",0.5,0,-5,1,1.2,1,2.52,0.00001,0"));
    }
}
