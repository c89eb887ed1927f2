//! Per-component log files, `{server_name}.out` and `{server_name}.err`.
//!
//! Each component owns its sink, so concurrent components never write to the
//! same file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};

#[derive(Debug)]
pub struct ComponentSink {
    out: File,
    err: File,
    out_path: PathBuf,
}

impl ComponentSink {
    pub fn open(dir: &Path, server_name: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let out_path = dir.join(format!("{server_name}.out"));
        let err_path = dir.join(format!("{server_name}.err"));
        Ok(Self {
            out: Self::append(&out_path)?,
            err: Self::append(&err_path)?,
            out_path,
        })
    }

    fn append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    pub fn out_path(&self) -> &Path {
        &self.out_path
    }

    pub fn out(&self, line: &str) -> io::Result<()> {
        Self::stamp(&self.out, line)
    }

    pub fn err(&self, line: &str) -> io::Result<()> {
        Self::stamp(&self.err, line)
    }

    fn stamp(mut file: &File, line: &str) -> io::Result<()> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        for l in line.lines() {
            writeln!(file, "[{now}] {l}")?;
        }
        Ok(())
    }
}
