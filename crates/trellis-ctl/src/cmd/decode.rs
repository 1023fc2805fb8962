//! `decode`: read a whole stream and print the materialized root.

use anyhow::{Context, Result};

use trellis_core::config::TrellisConfig;
use trellis_core::ChunkState;
use trellis_stream::{NoModules, ReadError, Response, ResponseState};

use super::open_input;

pub async fn cmd_decode(path: Option<&str>, config: &TrellisConfig) -> Result<()> {
    let input = open_input(path).await?;
    let mut response = Response::with_config(input, NoModules, &config.reader);
    response.run_to_end().await.context("failed to read stream")?;

    match response.materialize_root() {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Err(ReadError::Chunk(e)) => {
            println!("═══════════════════════════════════════");
            println!("  Root could not be materialized");
            println!("═══════════════════════════════════════");
            println!("  error  : {}", e.message);
            if let Some(digest) = &e.digest {
                println!("  digest : {digest}");
            }
        }
        Err(e) => return Err(e).context("failed to materialize root"),
    }

    print_errored(response.state());
    Ok(())
}

/// List every chunk that settled with an error.
fn print_errored(state: &ResponseState) {
    let chunks = state.chunks();
    let errored: Vec<_> = chunks
        .ids()
        .into_iter()
        .filter_map(|id| match chunks.state(id) {
            Some(ChunkState::Errored(e)) => Some((id, e)),
            _ => None,
        })
        .collect();
    if errored.is_empty() {
        return;
    }

    eprintln!("\n  Errored chunks ({}):", errored.len());
    for (id, e) in errored {
        eprintln!("  ┌─ chunk {id}");
        eprintln!("  │  message : {}", e.message);
        eprintln!("  └─ digest  : {}", e.digest.as_deref().unwrap_or("-"));
    }
}
