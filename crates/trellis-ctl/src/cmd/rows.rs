//! `rows`: decode a stream row by row without resolving anything.

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;

use trellis_core::RowDecoder;

use super::open_input;

pub async fn cmd_rows(path: Option<&str>) -> Result<()> {
    let mut input = open_input(path).await?;
    let mut decoder = RowDecoder::new();
    let mut buf = vec![0u8; 8 * 1024];
    let mut count = 0usize;

    loop {
        let n = input.read(&mut buf).await.context("failed to read input")?;
        if n == 0 {
            break;
        }
        decoder.push(&buf[..n]);
        while let Some(row) = decoder.next_row().context("malformed stream")? {
            println!("{:>6}  {}  {}", row.id, row.tag.as_byte() as char, row.payload);
            count += 1;
        }
    }
    decoder.finish().context("malformed stream")?;

    eprintln!("{count} rows");
    Ok(())
}
