//! Per-batch text export.

use panorec::entity::Model;
use panorec::export::{orientation_records, position_records, structure_records};
use panorec::prelude::v1::*;
use serde::Serialize;
use std::path::PathBuf;

/// Writes space separated `.xyz` files into a directory, three per batch.
pub struct DirectoryExporter {
    dir: PathBuf,
}

impl DirectoryExporter {
    /// Create an exporter, creating the output directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn write<T: Serialize>(&self, name: &str, records: impl Iterator<Item = T>) -> Result<()> {
        let mut path = self.dir.clone();
        path.push(name);

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b' ')
            .has_headers(false)
            .from_path(path)?;

        for record in records {
            writer.serialize(record)?;
        }

        writer.flush()?;

        Ok(())
    }
}

impl Exporter for DirectoryExporter {
    fn export(&mut self, batch: usize, model: &Model) -> Result<()> {
        self.write(
            &format!("{batch:06}_structure.xyz"),
            structure_records(model),
        )?;
        self.write(&format!("{batch:06}_position.xyz"), position_records(model))?;
        self.write(
            &format!("{batch:06}_orientation.xyz"),
            orientation_records(model),
        )?;
        Ok(())
    }
}
