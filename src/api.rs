//! The `api` module is the public entry point of the PIR pipeline.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use rlwe_pir::api::*;
//!
//! // client side
//! let params = ParameterSet::new(2, vec![4, 4], 2).unwrap();
//! let client_crypto = CryptoProvider::get_crypto_method("RLWE:256:64").unwrap();
//! let mut query_gen = QueryGenerator::new(params.clone(), client_crypto.clone());
//! query_gen.set_chosen_element(9).unwrap();
//! query_gen.generate_query().unwrap();
//! let mut raw_query = Vec::new();
//! while let Some(block) = query_gen.pop_query().unwrap() {
//!   raw_query.extend(block);
//! }
//!
//! // server side, only the public parameters are shared
//! let server_crypto =
//!   CryptoProvider::from_public_parameters(&client_crypto.public_parameters())
//!     .unwrap();
//! let elements: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i; 64]).collect();
//! let db = Arc::new(MemoryDb::new(elements));
//! let importer =
//!   DatabaseImporter::new(params.clone(), server_crypto.clone(), db);
//! let imported = importer.import_data(0, 64).unwrap();
//! let mut reply_gen = ReplyGenerator::new(params.clone(), server_crypto);
//! reply_gen.push_query(&raw_query).unwrap();
//! reply_gen.generate_reply(&imported).unwrap();
//!
//! // back to the client
//! let mut extractor = ReplyExtractor::new(params, client_crypto);
//! while let Some(chunk) = reply_gen.pop_reply().unwrap() {
//!   extractor.push_encrypted_reply(&chunk).unwrap();
//! }
//! assert_eq!(extractor.extract_element(9, 64).unwrap(), vec![9u8; 64]);
//!
//! reply_gen.free_queries();
//! imported.release();
//! ```

pub use crate::crypto::{
  plaintext_chunks, reply_size_in_chunks, CryptoProvider, HomomorphicCrypto,
  PublicParameters,
};
pub use crate::db::{DatabaseImporter, DbHandler, ImportedDatabase, MemoryDb};
pub use crate::errors::{PirError, Result};
pub use crate::extract::ReplyExtractor;
pub use crate::params::ParameterSet;
pub use crate::query::QueryGenerator;
pub use crate::reply::{ReplyGenerator, ReplyState};
pub use crate::utils::memory::{FixedMemory, MemoryProbe, SystemMemory};
