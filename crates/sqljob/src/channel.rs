use crate::spawn::{BoxWriter, Transport};
use futures::StreamExt;
use sqljob_protocol::{reader_to_message_stream, Request, Response};
use tokio::io::AsyncWriteExt;

/// Channel frames Requests and Responses over the Transport of one job.
///
/// Writes are serialized so that concurrent callers never interleave lines.
/// Reads happen on a background task which hands each decoded Response to
/// `on_message`, and calls `on_close` exactly once when the job server's
/// output ends or fails.
pub(crate) struct Channel {
    writer: tokio::sync::Mutex<BoxWriter>,
    reader: tokio::task::JoinHandle<()>,
    _guard: Option<Box<dyn std::any::Any + Send + Sync>>,
}

impl Channel {
    pub fn open<M, C>(transport: Transport, mut on_message: M, on_close: C) -> Self
    where
        M: FnMut(Response) + Send + 'static,
        C: FnOnce(String) + Send + 'static,
    {
        let Transport {
            reader,
            writer,
            guard,
        } = transport;

        let reader = tokio::spawn(async move {
            let messages = reader_to_message_stream::<Response, _>(reader, 32 * 1024);
            tokio::pin!(messages);

            let reason = loop {
                match messages.next().await {
                    Some(Ok(response)) => on_message(response),
                    Some(Err(error)) => break format!("failed to read job server output: {error}"),
                    None => break "job server closed its output".to_string(),
                }
            };
            on_close(reason);
        });

        Self {
            writer: tokio::sync::Mutex::new(writer),
            reader,
            _guard: guard,
        }
    }

    /// Write `request` as a single line.
    pub async fn write(&self, request: &Request) -> crate::Result<()> {
        let mut buf = Vec::new();
        sqljob_protocol::encode(request, &mut buf)?;

        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;

        tracing::trace!(id = %request.id, kind = request.body.tag(), "wrote request");
        Ok(())
    }

    /// Stop reading from the job server. The Transport itself is released
    /// once the last reference to this Channel is dropped.
    pub fn shutdown(&self) {
        self.reader.abort();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
