//! Calibration dataset: an ordered record store read through a sequential
//! cursor, and the batch loader that turns records into input activations.
//!
//! The store is persisted as an rkyv archive of labelled records.

use std::path::Path;

use rkyv::{Archive, Deserialize, Serialize};

use super::error::DatasetError;
use super::oracle::Activation;

/// One labelled image: `channels x height x width` bytes in CHW order.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[rkyv(derive(Debug))]
pub struct Datum {
    pub channels: u32,
    pub height: u32,
    pub width: u32,
    pub label: i32,
    pub data: Vec<u8>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[rkyv(derive(Debug))]
pub struct Record {
    pub key: String,
    pub datum: Datum,
}

/// Ordered key/value record store.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[rkyv(derive(Debug))]
pub struct RecordStore {
    records: Vec<Record>,
}

impl RecordStore {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// A cursor positioned on the first record.
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor {
            records: &self.records,
            pos: 0,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), DatasetError> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self).map_err(|e| {
            DatasetError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        std::fs::write(path, &bytes).map_err(|source| DatasetError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn open(path: &Path) -> Result<Self, DatasetError> {
        let raw = std::fs::read(path).map_err(|source| DatasetError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(raw.len());
        aligned.extend_from_slice(&raw);
        let store = rkyv::from_bytes::<RecordStore, rkyv::rancor::Error>(&aligned).map_err(
            |e| DatasetError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            },
        )?;
        log::info!(
            "opened record store '{}' ({} records)",
            path.display(),
            store.len()
        );
        Ok(store)
    }
}

/// Forward-only view over a record store.
pub struct Cursor<'a> {
    records: &'a [Record],
    pos: usize,
}

impl Cursor<'_> {
    pub fn offset(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Cursor<'a> {
    type Item = &'a Record;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.get(self.pos)?;
        self.pos += 1;
        Some(record)
    }
}

/// How raw bytes become floating input values.
#[derive(Clone, Debug, PartialEq)]
pub enum Normalization {
    /// `pixel / divisor`.
    Scale { divisor: f32 },
    /// `pixel - mean[channel]`.
    MeanSubtract { mean: Vec<f32> },
}

impl Default for Normalization {
    fn default() -> Self {
        Normalization::Scale { divisor: 256.0 }
    }
}

impl Normalization {
    fn apply(&self, channel: usize, pixel: u8) -> f32 {
        match self {
            Normalization::Scale { divisor } => pixel as f32 / divisor,
            Normalization::MeanSubtract { mean } => {
                pixel as f32 - mean.get(channel).copied().unwrap_or(0.0)
            }
        }
    }
}

/// Read `iterations` batches shaped like the NCHW input `shape`.
///
/// Each record is centre-cropped to the input's spatial size. A batch whose
/// element count differs from the declared input volume is rejected.
pub fn read_batches(
    cursor: &mut Cursor<'_>,
    input: &str,
    shape: &[usize],
    iterations: usize,
    normalization: &Normalization,
) -> Result<Vec<Activation>, DatasetError> {
    let &[n, c, h, w] = shape else {
        return Err(DatasetError::Rank {
            input: input.to_string(),
            shape: shape.to_vec(),
        });
    };
    let declared = n * c * h * w;
    let mut batches = Vec::with_capacity(iterations);

    for _ in 0..iterations {
        let mut data = Vec::with_capacity(declared);
        for _ in 0..n {
            let record = cursor.next().ok_or(DatasetError::Exhausted {
                read: cursor.offset(),
                wanted: iterations * n,
            })?;
            let datum = &record.datum;
            let (height, width) = (datum.height as usize, datum.width as usize);
            if datum.channels as usize != c {
                return Err(DatasetError::Channels {
                    key: record.key.clone(),
                    input: input.to_string(),
                    expected: c,
                    found: datum.channels as usize,
                });
            }
            if height < h || width < w {
                return Err(DatasetError::TooSmall {
                    key: record.key.clone(),
                    height,
                    width,
                    crop_h: h,
                    crop_w: w,
                });
            }
            let top = (height - h) / 2;
            let left = (width - w) / 2;
            for ch in 0..c {
                for y in 0..h {
                    let row = (ch * height + top + y) * width + left;
                    for x in 0..w {
                        if let Some(&pixel) = datum.data.get(row + x) {
                            data.push(normalization.apply(ch, pixel));
                        }
                    }
                }
            }
        }
        if data.len() != declared {
            return Err(DatasetError::VolumeMismatch {
                input: input.to_string(),
                declared,
                loaded: data.len(),
            });
        }
        batches.push(Activation::new(shape.to_vec(), data));
    }
    log::debug!(
        "loaded {} batches of {} elements for '{}'",
        batches.len(),
        declared,
        input
    );
    Ok(batches)
}
