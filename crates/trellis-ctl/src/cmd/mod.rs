//! CLI command modules.

pub mod decode;
pub mod demo;
pub mod rows;

use anyhow::{Context, Result};
use tokio::io::AsyncRead;

pub type Input = Box<dyn AsyncRead + Unpin + Send>;

/// Open `path` for reading, or stdin for `None` and `-`.
pub async fn open_input(path: Option<&str>) -> Result<Input> {
    match path {
        None | Some("-") => Ok(Box::new(tokio::io::stdin())),
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {path}"))?;
            Ok(Box::new(file))
        }
    }
}
