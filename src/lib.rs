//! Orchestration layer of a Private Information Retrieval protocol built on
//! a homomorphic (Ring-LWE) cryptosystem.
//!
//! A client retrieves one element of a server-held database without the
//! server learning which one. The pipeline is:
//!
//! - [`query::QueryGenerator`] (client) encrypts one selector vector per
//!   dimension of the database hypercube.
//! - [`db::DatabaseImporter`] (server) encodes the raw database once into an
//!   [`db::ImportedDatabase`].
//! - [`reply::ReplyGenerator`] (server) folds the database with the query and
//!   streams the reply chunk by chunk.
//! - [`extract::ReplyExtractor`] (client) decrypts the reply.
//!
//! The lattice arithmetic sits behind [`crypto::HomomorphicCrypto`].

pub mod api;
pub mod crypto;
pub mod db;
pub mod errors;
pub mod extract;
pub mod params;
pub mod query;
mod queue;
pub mod reply;
pub mod utils;
