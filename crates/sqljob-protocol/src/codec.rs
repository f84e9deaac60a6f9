use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Encode `m` as a newline-delimited JSON line, appended to `buf`.
pub fn encode<M: Serialize>(m: &M, buf: &mut Vec<u8>) -> serde_json::Result<()> {
    serde_json::to_writer(&mut *buf, m)?;
    buf.push(b'\n');
    Ok(())
}

/// LineDecoder accumulates chunks of a byte stream and decodes each
/// complete line as a JSON message. Lines which are blank or don't parse
/// are dropped: a job server may interleave diagnostic output with its
/// messages, and that must never take down the channel.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered bytes which don't yet form a complete line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer `chunk` and decode all complete lines now available,
    /// in the order they were written.
    pub fn push<M: DeserializeOwned>(&mut self, chunk: &[u8]) -> Vec<M> {
        self.buffer.extend_from_slice(chunk);
        self.decode()
    }

    fn decode<M: DeserializeOwned>(&mut self) -> Vec<M> {
        let mut buf = self.buffer.as_slice();
        let mut consumed = 0;
        let mut out = Vec::new();

        while let Some(bound) = buf.iter().position(|b| *b == b'\n') {
            let line = &buf[..bound];
            let bound = bound + 1; // Byte index after '\n'.

            if !line.iter().all(u8::is_ascii_whitespace) {
                match serde_json::from_slice::<M>(line) {
                    Ok(m) => out.push(m),
                    Err(error) => {
                        tracing::debug!(
                            %error,
                            line = %String::from_utf8_lossy(line),
                            "dropping malformed job server output"
                        );
                    }
                }
            }
            consumed += bound;
            buf = &buf[bound..];
        }

        // Remove consumed portion of `buffer`, shifting any remainder to the front.
        let len = self.buffer.len();
        if consumed != 0 && consumed != len {
            self.buffer.copy_within(consumed..len, 0);
        }
        self.buffer.truncate(len - consumed);

        out
    }
}

/// Map an AsyncRead into a Stream of decoded messages, which ends
/// upon a clean EOF of the reader.
pub fn reader_to_message_stream<M, R>(
    reader: R,
    min_capacity: usize,
) -> impl futures::Stream<Item = Result<M, crate::Error>>
where
    M: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let chunk = Vec::with_capacity(min_capacity);

    futures::stream::try_unfold(
        (Vec::new().into_iter(), LineDecoder::new(), chunk, reader),
        |(mut it, mut decoder, mut chunk, mut reader)| async move {
            loop {
                if let Some(next) = it.next() {
                    return Ok(Some((next, (it, decoder, chunk, reader))));
                }

                chunk.clear();
                let n = reader.read_buf(&mut chunk).await?;

                if n == 0 && decoder.pending() == 0 {
                    tracing::debug!("finished reading job server output");
                    return Ok(None); // Graceful EOF.
                } else if n == 0 {
                    return Err(crate::Error::PartialMessage);
                }

                it = decoder.push::<M>(&chunk).into_iter();
            }
        },
    )
}
