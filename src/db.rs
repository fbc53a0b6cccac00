use std::fs;
use std::sync::Arc;

use rayon::prelude::*;

use crate::crypto::{absorption_bytesize, aggregate_bytesize, plaintext_chunks};
use crate::crypto::{HomomorphicCrypto, Plaintext};
use crate::errors::{PirError, Result};
use crate::params::ParameterSet;
use crate::utils::arith::ceil_div;
use crate::utils::memory::{warn_if_over_budget, MemoryProbe, SystemMemory};

// Worst case expansion of raw bytes once encoded for the engine
const IMPORT_EXPANSION_FACTOR: u64 = 4;

/// Raw access to the database the server answers queries on. Each element
/// of the database is a byte stream.
pub trait DbHandler: Send + Sync {
  fn stream_count(&self) -> u64;

  /// Size of the largest stream, the natural `bytes_per_element`
  fn max_stream_bytesize(&self) -> u64;

  /// Reads up to `len` bytes of stream `stream_index` starting at
  /// `offset`. Returns fewer bytes when the stream ends early.
  fn read_stream(
    &self,
    stream_index: u64,
    offset: u64,
    len: u64,
  ) -> Result<Vec<u8>>;
}

/// A database held in memory, one byte vector per element.
#[derive(Clone, Debug, Default)]
pub struct MemoryDb {
  elements: Vec<Vec<u8>>,
}
impl MemoryDb {
  pub fn new(elements: Vec<Vec<u8>>) -> Self {
    Self { elements }
  }

  /// Expects an array of base64-encoded strings, one per element
  pub fn from_base64_strings(base64_strs: &[String]) -> Result<Self> {
    let elements = base64_strs
      .iter()
      .map(base64::decode)
      .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Self::new(elements))
  }

  /// Expects a JSON file holding an array of base64-encoded strings
  pub fn from_json_file(file_path: &str) -> Result<Self> {
    let file_contents = fs::read_to_string(file_path)?;
    let elements: Vec<String> = serde_json::from_str(&file_contents)?;
    Self::from_base64_strings(&elements)
  }

  /// Returns the ith element
  pub fn get_element(&self, i: usize) -> Option<&[u8]> {
    self.elements.get(i).map(Vec::as_slice)
  }
}

impl DbHandler for MemoryDb {
  fn stream_count(&self) -> u64 {
    self.elements.len() as u64
  }

  fn max_stream_bytesize(&self) -> u64 {
    self.elements.iter().map(|e| e.len() as u64).max().unwrap_or(0)
  }

  fn read_stream(
    &self,
    stream_index: u64,
    offset: u64,
    len: u64,
  ) -> Result<Vec<u8>> {
    let stream = self.elements.get(stream_index as usize).ok_or(
      PirError::IndexOutOfRange {
        index: stream_index,
        capacity: self.stream_count(),
      },
    )?;
    let start = (offset as usize).min(stream.len());
    let end = start.saturating_add(len as usize).min(stream.len());
    Ok(stream[start..end].to_vec())
  }
}

/// The `ImportedDatabase` is the server's resident snapshot of the raw
/// database, aggregated by `alpha` and encoded for the crypto engine.
///
/// It is read-only once built. Call `release` once it is no longer
/// needed; the snapshot cannot be used afterwards.
#[derive(Debug)]
pub struct ImportedDatabase {
  elements: Vec<Vec<Plaintext>>,
  nb_elements: u64,
  polys_per_element: u64,
  before_import_element_bytesize: u64,
}
impl ImportedDatabase {
  /// Number of aggregated elements, `ceil(stream_count / alpha)`
  pub fn nb_elements(&self) -> u64 {
    self.nb_elements
  }

  pub fn polys_per_element(&self) -> u64 {
    self.polys_per_element
  }

  pub fn before_import_element_bytesize(&self) -> u64 {
    self.before_import_element_bytesize
  }

  pub(crate) fn elements(&self) -> &[Vec<Plaintext>] {
    &self.elements
  }

  /// Frees the encoded elements
  pub fn release(self) {
    tracing::debug!(
      nb_elements = self.nb_elements,
      "releasing imported database"
    );
    drop(self.elements);
  }
}

/// The `DatabaseImporter` turns the raw database into an
/// `ImportedDatabase`, warning when the snapshot may take more than a tenth
/// of the system memory.
pub struct DatabaseImporter {
  params: ParameterSet,
  crypto: Arc<dyn HomomorphicCrypto>,
  db_handler: Arc<dyn DbHandler>,
  memory: Box<dyn MemoryProbe>,
}
impl DatabaseImporter {
  pub fn new(
    params: ParameterSet,
    crypto: Arc<dyn HomomorphicCrypto>,
    db_handler: Arc<dyn DbHandler>,
  ) -> Self {
    Self {
      params,
      crypto,
      db_handler,
      memory: Box::new(SystemMemory),
    }
  }

  /// Replaces the source of the total memory figure used for the capacity
  /// warning
  pub fn with_memory_probe(mut self, memory: Box<dyn MemoryProbe>) -> Self {
    self.memory = memory;
    self
  }

  /// Projected resident size of an import, as checked against the memory
  /// budget
  pub fn projected_import_bytesize(&self, bytes_per_element: u64) -> u64 {
    bytes_per_element
      .saturating_mul(self.db_handler.stream_count())
      .saturating_mul(IMPORT_EXPANSION_FACTOR)
  }

  /// Logs the capacity warning when needed, returns whether it fired
  pub fn check_import_capacity(&self, bytes_per_element: u64) -> bool {
    warn_if_over_budget(
      self.memory.as_ref(),
      self.projected_import_bytesize(bytes_per_element),
      "storing the imported database, consider reducing bytes_per_element",
    )
  }

  /// Reads `bytes_per_element` bytes at `offset` of every stream and
  /// encodes them, `alpha` streams per imported element.
  pub fn import_data(
    &self,
    offset: u64,
    bytes_per_element: u64,
  ) -> Result<ImportedDatabase> {
    let stream_count = self.db_handler.stream_count();
    if stream_count == 0 || bytes_per_element == 0 {
      return Err(PirError::InvalidParameters(
        "cannot import an empty database".into(),
      ));
    }
    let alpha = self.params.alpha();
    let nb_elements = ceil_div(stream_count, alpha);
    if nb_elements > self.params.capacity() {
      return Err(PirError::InvalidParameters(format!(
        "{} aggregated elements do not fit in a hypercube of {}",
        nb_elements,
        self.params.capacity()
      )));
    }
    let crypto = self.crypto.as_ref();
    let abs_bytes = absorption_bytesize(crypto) as usize;
    let polys_per_element =
      plaintext_chunks(crypto, &self.params, bytes_per_element)?;
    let aggregated_bytes =
      usize::try_from(aggregate_bytesize(&self.params, bytes_per_element)?)
        .map_err(|_| {
          PirError::InvalidParameters(format!(
            "elements of {} bytes do not fit in memory",
            bytes_per_element
          ))
        })?;
    self.check_import_capacity(bytes_per_element);

    let elements = (0..nb_elements)
      .into_par_iter()
      .map(|k| -> Result<Vec<Plaintext>> {
        let mut raw = Vec::new();
        raw.try_reserve_exact(aggregated_bytes)?;
        for (slot, stream) in (k * alpha..(k + 1) * alpha).enumerate() {
          if stream < stream_count {
            raw.extend(self.db_handler.read_stream(
              stream,
              offset,
              bytes_per_element,
            )?);
          }
          // short streams and the tail of the last aggregate are zeroes
          raw.resize((slot + 1) * bytes_per_element as usize, 0);
        }
        let mut encoded = Vec::new();
        encoded.try_reserve_exact(polys_per_element as usize)?;
        for chunk in raw.chunks(abs_bytes) {
          encoded.push(crypto.encode(chunk)?);
        }
        Ok(encoded)
      })
      .collect::<Result<Vec<Vec<Plaintext>>>>()?;

    tracing::info!(
      nb_elements,
      polys_per_element,
      bytes_per_element,
      "database imported"
    );
    Ok(ImportedDatabase {
      elements,
      nb_elements,
      polys_per_element,
      before_import_element_bytesize: bytes_per_element,
    })
  }
}
