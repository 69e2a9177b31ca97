//! tonic bidirectional streaming call as a managed stream

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Response, Status, Streaming};
use tracing::debug;

use super::{BidiStream, StreamError};

/// Client side of a gRPC bidirectional stream.
///
/// Outbound messages go through a bounded queue feeding the request stream.
/// Inbound messages are read by a background task, so the end of the call is
/// noticed even when nobody is receiving.
pub struct GrpcBidiStream<Req, Resp> {
    outbound: parking_lot::Mutex<Option<mpsc::Sender<Req>>>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Result<Resp, Status>>>,
    done: CancellationToken,
}

impl<Req, Resp> GrpcBidiStream<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Open the stream with `call`, typically a generated client method:
    ///
    /// ```ignore
    /// let stream = GrpcBidiStream::open(64, |outbound| async move {
    ///     EchoClient::new(channel).chat(outbound).await
    /// })
    /// .await?;
    /// ```
    pub async fn open<F, Fut>(buffer: usize, call: F) -> Result<Self, StreamError>
    where
        F: FnOnce(ReceiverStream<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Streaming<Resp>>, Status>>,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
        let mut messages = call(ReceiverStream::new(outbound_rx)).await?.into_inner();

        let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
        let done = CancellationToken::new();
        let reader_done = done.clone();
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = reader_done.cancelled() => break,
                    item = messages.message() => item,
                };
                let (item, last) = match item {
                    Ok(Some(message)) => (Ok(message), false),
                    Ok(None) => break,
                    Err(status) => (Err(status), true),
                };
                let delivered = tokio::select! {
                    biased;
                    _ = reader_done.cancelled() => false,
                    sent = inbound_tx.send(item) => sent.is_ok(),
                };
                if !delivered || last {
                    break;
                }
            }
            debug!("Bidirectional stream read loop ended");
            reader_done.cancel();
        });

        Ok(Self {
            outbound: parking_lot::Mutex::new(Some(outbound_tx)),
            inbound: tokio::sync::Mutex::new(inbound_rx),
            done,
        })
    }

    pub async fn send(&self, message: Req) -> Result<(), StreamError> {
        let sender = self.outbound.lock().clone().ok_or(StreamError::Closed)?;
        sender.send(message).await.map_err(|_| StreamError::Closed)
    }

    /// Next inbound message; `None` once the call has ended.
    pub async fn recv(&self) -> Option<Result<Resp, StreamError>> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .map(|item| item.map_err(StreamError::from))
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }
}

#[async_trait]
impl<Req, Resp> BidiStream for GrpcBidiStream<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn closed(&self) {
        self.done.cancelled().await;
    }

    async fn close(&self) -> Result<(), StreamError> {
        // Dropping the sender half-closes the request stream.
        self.outbound.lock().take();
        self.done.cancel();
        Ok(())
    }
}
