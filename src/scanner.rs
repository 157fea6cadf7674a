//! Delimiter-driven byte scanning over an async stream.
//!
//! These are the only read primitives the request parser uses. Both write
//! exclusively into caller-supplied storage; neither allocates. Callers are
//! expected to hand in a buffered reader, since the scan advances one byte
//! at a time and is only cheap against a `BufReader`.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads from `reader` until `delim` is encountered, writing the bytes seen
/// so far into `dest`.
///
/// On success returns `Some(slice)` holding the bytes before the delimiter,
/// which may be empty. The delimiter itself is consumed from the stream and never
/// appears in the result. Returns `None` when the stream ends or `dest` is
/// exhausted before the delimiter shows up: the field could not be read and
/// nothing partial is handed back as if it were complete.
pub async fn scan_until<'a, R>(
    reader: &mut R,
    delim: u8,
    dest: &'a mut [u8],
) -> io::Result<Option<&'a [u8]>>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    loop {
        let Some(byte) = read_byte(reader).await? else {
            return Ok(None);
        };
        if byte == delim {
            return Ok(Some(&dest[..filled]));
        }
        if filled == dest.len() {
            // field would overflow its region
            return Ok(None);
        }
        dest[filled] = byte;
        filled += 1;
    }
}

/// Reads a single byte, returning `None` on end of stream.
pub async fn read_byte<R>(reader: &mut R) -> io::Result<Option<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    let n = reader.read(&mut byte).await?;
    Ok(if n == 0 { None } else { Some(byte[0]) })
}
