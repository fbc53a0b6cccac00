//! pir-demo: runs one PIR round locally, the reply being drained by a
//! separate thread while the server computes it.

use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use pir_cli_utils::{parse_cli_flags, CLIFlags};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use rlwe_pir::api::*;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn main() -> std::result::Result<(), Box<dyn Error>> {
  let subscriber = FmtSubscriber::builder()
    .with_max_level(Level::INFO)
    .with_target(false)
    .with_writer(std::io::stderr)
    .finish();
  tracing::subscriber::set_global_default(subscriber)?;

  let CLIFlags {
    dim_sizes,
    alpha,
    crypto,
    num_elements,
    ele_size,
    index,
    seed,
    list_crypto,
  } = parse_cli_flags();

  if list_crypto {
    println!("Available crypto parameters (CryptoSystem:PolyDegree[:ModulusBitsize]):");
    for name in CryptoProvider::available_crypto_params() {
      println!("{}", name);
    }
    return Ok(());
  }

  let params = ParameterSet::new(dim_sizes.len(), dim_sizes, alpha)?;
  info!(?params, crypto = %crypto, num_elements, ele_size, "starting PIR round");

  let mut rng = match seed {
    Some(seed) => SmallRng::seed_from_u64(seed),
    None => SmallRng::from_entropy(),
  };
  let elements: Vec<Vec<u8>> = (0..num_elements)
    .map(|_| {
      let mut ele = vec![0u8; ele_size];
      rng.fill_bytes(&mut ele);
      ele
    })
    .collect();
  let expected = elements
    .get(index as usize)
    .cloned()
    .ok_or("index is outside of the generated database")?;

  // client
  let client_crypto = CryptoProvider::get_crypto_method(&crypto)?;
  let mut query_gen = QueryGenerator::new(params.clone(), client_crypto.clone());
  let start = Instant::now();
  query_gen.set_chosen_element(index)?;
  query_gen.generate_query()?;
  let mut raw_query = Vec::new();
  while let Some(block) = query_gen.pop_query()? {
    raw_query.extend(block);
  }
  info!(
    bytes = raw_query.len(),
    elapsed_ms = start.elapsed().as_millis(),
    "query generated"
  );

  // server
  let public_params =
    PublicParameters::from_bytes(&client_crypto.public_parameters().to_bytes()?)?;
  let server_crypto = CryptoProvider::from_public_parameters(&public_params)?;
  let db = Arc::new(MemoryDb::new(elements));
  let importer = DatabaseImporter::new(params.clone(), server_crypto.clone(), db);
  let start = Instant::now();
  let imported = importer.import_data(0, ele_size as u64)?;
  info!(elapsed_ms = start.elapsed().as_millis(), "database imported");

  let mut reply_gen = ReplyGenerator::new(params.clone(), server_crypto);
  reply_gen.push_query(&raw_query)?;

  let start = Instant::now();
  let reply_gen_ref = &reply_gen;
  let reply = thread::scope(|s| -> std::result::Result<Vec<Vec<u8>>, PirError> {
    let consumer = s.spawn(move || -> std::result::Result<Vec<Vec<u8>>, PirError> {
      let mut chunks = Vec::new();
      while let Some(chunk) = reply_gen_ref.pop_reply()? {
        chunks.push(chunk);
      }
      Ok(chunks)
    });
    reply_gen_ref.generate_reply(&imported)?;
    consumer.join().unwrap_or(Err(PirError::ReplyAborted))
  })?;
  info!(
    chunks = reply.len(),
    bytes = reply.len() as u64 * reply_gen.reply_element_bytesize(),
    elapsed_ms = start.elapsed().as_millis(),
    "reply generated"
  );
  reply_gen.free_queries();
  imported.release();

  // client
  let mut extractor = ReplyExtractor::new(params, client_crypto);
  for chunk in &reply {
    extractor.push_encrypted_reply(chunk)?;
  }
  let start = Instant::now();
  let retrieved = extractor.extract_element(index, ele_size as u64)?;
  info!(elapsed_ms = start.elapsed().as_millis(), "reply extracted");

  if retrieved != expected {
    return Err("retrieved element does not match the database".into());
  }
  info!(index, "retrieved element matches the database");
  Ok(())
}
