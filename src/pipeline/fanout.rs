// Broadcast of one chunk stream to several destination queues.
//
// A broadcast completes only once every attached consumer has accepted the
// chunk, so the upstream read rate follows the slowest active consumer. A
// consumer whose queue has closed is detached and no longer holds anyone back.

use super::Chunk;
use crate::models::DestinationId;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
pub struct Fanout {
    consumers: Vec<(DestinationId, mpsc::Sender<Chunk>)>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, id: DestinationId, tx: mpsc::Sender<Chunk>) {
        self.consumers.push((id, tx));
    }

    /// Drop a consumer's queue, which tells its writer the stream is over
    pub fn detach(&mut self, id: DestinationId) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|(consumer, _)| *consumer != id);
        before != self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    /// Send a chunk to every consumer, returning the ones that went away
    pub async fn broadcast(&mut self, chunk: Chunk) -> Vec<DestinationId> {
        if self.consumers.is_empty() {
            return Vec::new();
        }

        let results = join_all(
            self.consumers
                .iter()
                .map(|(id, tx)| {
                    let chunk = chunk.clone();
                    async move { (*id, tx.send(chunk).await.is_ok()) }
                }),
        )
        .await;

        let gone: Vec<DestinationId> = results
            .into_iter()
            .filter_map(|(id, delivered)| (!delivered).then_some(id))
            .collect();
        for id in &gone {
            debug!("Destination {} left the fan-out", id);
            self.detach(*id);
        }
        gone
    }
}
