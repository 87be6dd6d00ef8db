use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::axis::reduce_mask_of;
use crate::common::{saturating_volume, AxisId};
use crate::encode::{decode, TilingCaseKey};

/// One compiled artifact: its name and its encoded tiling case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub artifact: String,
    pub bytes: Vec<u8>,
}

/// Decoded cases in generation order, as the runtime selects among them.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    entries: Vec<(String, TilingCaseKey)>,
}

#[derive(thiserror::Error, Debug)]
pub enum TableIoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed table file: {0}")]
    Format(#[from] bincode::Error),
}

impl DispatchTable {
    /// Decodes every entry. Entries that fail to decode are logged and left
    /// out of the table.
    pub fn from_encoded<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a TableEntry>,
    {
        let entries = entries
            .into_iter()
            .filter_map(|e| match decode(&e.bytes) {
                Ok(key) => Some((e.artifact.clone(), key)),
                Err(err) => {
                    warn!("Excluding artifact {}: {}", e.artifact, err);
                    None
                }
            })
            .collect();
        DispatchTable { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TilingCaseKey)> + '_ {
        self.entries.iter().map(|(a, k)| (a.as_str(), k))
    }

    /// The first case whose region admits the iteration-space extents `dims`.
    ///
    /// `reduce_axes` gives the runtime reduce axes of a dynamic-axis reduce.
    /// Regions over a fused single axis are matched against the product of
    /// `dims`.
    pub fn select(&self, dims: &[u64], reduce_axes: Option<&[AxisId]>) -> Option<&TilingCaseKey> {
        let mask = reduce_axes.map(reduce_mask_of);
        let fused = [saturating_volume(dims)];
        let found = self.entries.iter().find(|(_, key)| {
            let region = &key.case.region;
            let dims = if region.rank() == 1 && dims.len() > 1 {
                &fused[..]
            } else {
                dims
            };
            region.matches(dims, mask)
        });
        if let Some((artifact, _)) = found {
            debug!("dims {:?} dispatch to {}", dims, artifact);
        }
        found.map(|(_, key)| key)
    }
}

/// Writes `entries` as a zstd-compressed bincode file.
pub fn write_table(path: &Path, entries: &[TableEntry]) -> Result<(), TableIoError> {
    let file = BufWriter::new(fs::File::create(path)?);
    let mut writer = zstd::Encoder::new(file, 0)?;
    bincode::serialize_into(&mut writer, entries)?;
    writer.finish()?;
    Ok(())
}

pub fn read_table(path: &Path) -> Result<Vec<TableEntry>, TableIoError> {
    let reader = zstd::Decoder::new(BufReader::new(fs::File::open(path)?))?;
    Ok(bincode::deserialize_from(reader)?)
}
