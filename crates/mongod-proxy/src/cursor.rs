use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::Document;
use mongodb::options::FindOptions;
use mongodb::Collection;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Opaque handle to a live server-side cursor: monotonically increasing,
/// unique for the life of the process, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct CursorId(u64);

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Cursor lifecycle events, tagged with their handle so a single transport
/// subscriber can demultiplex them.
#[derive(Debug, Clone)]
pub enum CursorEvent {
    Close { cursor: CursorId },
    Data { cursor: CursorId, document: Document },
    End { cursor: CursorId },
    Readable { cursor: CursorId },
}

/// The registry's view of a server-side cursor. Configuration calls are
/// valid only before any document has been consumed.
#[async_trait]
pub trait DocumentCursor: Send + 'static {
    fn limit(&mut self, limit: i64) -> Result<(), Error>;
    fn skip(&mut self, skip: u64) -> Result<(), Error>;
    fn sort(&mut self, sort: Document) -> Result<(), Error>;
    async fn next_document(&mut self) -> Result<Option<Document>, Error>;
    async fn close(&mut self) -> Result<(), Error>;
}

/// Registry entry: the cursor behind its own async mutex, plus the
/// cancellation signal that interrupts a flowing pump at teardown.
#[derive(Clone)]
struct Entry {
    cursor: Arc<tokio::sync::Mutex<Box<dyn DocumentCursor>>>,
    cancel: CancellationToken,
}

/// Issues opaque handles for live query cursors and multiplexes their
/// lifecycle events onto one outbound channel. An entry exists from
/// `create` until its cursor ends or the registry is torn down; removal
/// always precedes the corresponding event emission.
pub struct CursorRegistry {
    entries: Mutex<HashMap<CursorId, Entry>>,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<CursorEvent>,
}

impl CursorRegistry {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CursorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            events,
        });
        (registry, rx)
    }

    /// Register `cursor` under the next handle. Never fails.
    pub fn create(&self, cursor: Box<dyn DocumentCursor>) -> CursorId {
        let id = CursorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Entry {
            cursor: Arc::new(tokio::sync::Mutex::new(cursor)),
            cancel: CancellationToken::new(),
        };
        self.entries.lock().unwrap().insert(id, entry);
        id
    }

    fn entry(&self, id: CursorId) -> Result<Entry, Error> {
        self.entries
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::CursorNotFound(id))
    }

    fn emit(&self, event: CursorEvent) {
        // The transport may have unsubscribed during teardown.
        let _ = self.events.send(event);
    }

    /// Remove the entry, then emit the terminal event, so a listener
    /// reacting to it can never observe a still-present entry.
    fn finish(&self, id: CursorId, event: CursorEvent) {
        if self.entries.lock().unwrap().remove(&id).is_some() {
            self.emit(event);
        }
    }

    pub async fn limit(&self, id: CursorId, limit: i64) -> Result<CursorId, Error> {
        let entry = self.entry(id)?;
        entry.cursor.lock().await.limit(limit)?;
        Ok(id)
    }

    pub async fn skip(&self, id: CursorId, skip: u64) -> Result<CursorId, Error> {
        let entry = self.entry(id)?;
        entry.cursor.lock().await.skip(skip)?;
        Ok(id)
    }

    pub async fn sort(&self, id: CursorId, sort: Document) -> Result<CursorId, Error> {
        let entry = self.entry(id)?;
        entry.cursor.lock().await.sort(sort)?;
        Ok(id)
    }

    /// Drain the cursor. Once this resolves the entry is gone and `End` has
    /// been emitted; any further operation on the handle is not-found.
    pub async fn to_array(&self, id: CursorId) -> Result<Vec<Document>, Error> {
        let entry = self.entry(id)?;
        let mut cursor = entry.cursor.lock().await;
        let mut documents = Vec::new();
        while let Some(document) = cursor.next_document().await? {
            documents.push(document);
        }
        drop(cursor);
        self.finish(id, CursorEvent::End { cursor: id });
        Ok(documents)
    }

    /// Switch the cursor into flowing mode: a pump task emits `Readable`
    /// when the first document arrives, `Data` per document, and finishes
    /// by removing the entry and emitting `End`. A driver failure instead
    /// removes the entry and emits `Close`. Teardown cancels the pump
    /// between documents, releasing the cursor for `unload` to close.
    pub fn resume(self: &Arc<Self>, id: CursorId) -> Result<CursorId, Error> {
        let entry = self.entry(id)?;
        let this = self.clone();
        tokio::spawn(async move {
            let mut cursor = entry.cursor.lock().await;
            let mut readable = false;
            loop {
                let next = tokio::select! {
                    _ = entry.cancel.cancelled() => return,
                    next = cursor.next_document() => next,
                };
                // Teardown may have fired while a read was in flight; the
                // entry is already gone, so nothing more may be emitted
                // for its handle.
                if entry.cancel.is_cancelled() {
                    return;
                }
                match next {
                    Ok(Some(document)) => {
                        if !readable {
                            this.emit(CursorEvent::Readable { cursor: id });
                            readable = true;
                        }
                        this.emit(CursorEvent::Data {
                            cursor: id,
                            document,
                        });
                    }
                    Ok(None) => {
                        drop(cursor);
                        this.finish(id, CursorEvent::End { cursor: id });
                        return;
                    }
                    Err(error) => {
                        tracing::warn!(cursor = %id, %error, "streaming cursor failed");
                        drop(cursor);
                        this.finish(id, CursorEvent::Close { cursor: id });
                        return;
                    }
                }
            }
        });
        Ok(id)
    }

    /// Close every cursor still present, waiting for all closes to settle
    /// regardless of individual failures. Flowing pumps are cancelled
    /// before their locks are awaited, so a stalled stream cannot block
    /// teardown.
    pub async fn unload(&self) {
        let drained: Vec<(CursorId, Entry)> = {
            let mut entries = self.entries.lock().unwrap();
            for entry in entries.values() {
                entry.cancel.cancel();
            }
            entries.drain().collect()
        };
        let closes = drained.into_iter().map(|(id, entry)| async move {
            if let Err(error) = entry.cursor.lock().await.close().await {
                tracing::error!(cursor = %id, %error, "failed to close cursor");
            }
            id
        });
        for id in futures::future::join_all(closes).await {
            self.emit(CursorEvent::Close { cursor: id });
        }
    }
}

/// Lazy driver `find`: configuration mutates the options until the first
/// document is requested, at which point the query executes. This is what
/// enforces "configure before any data is consumed" for registered
/// cursors.
pub struct FindCursor {
    collection: Collection<Document>,
    filter: Document,
    options: FindOptions,
    state: FindState,
}

enum FindState {
    Pending,
    Streaming(mongodb::Cursor<Document>),
    Done,
}

impl FindCursor {
    pub fn new(collection: Collection<Document>, filter: Document, options: FindOptions) -> Self {
        Self {
            collection,
            filter,
            options,
            state: FindState::Pending,
        }
    }

    fn configure(&mut self, apply: impl FnOnce(&mut FindOptions)) -> Result<(), Error> {
        match self.state {
            FindState::Pending => {
                apply(&mut self.options);
                Ok(())
            }
            _ => Err(Error::CursorConsumed),
        }
    }
}

#[async_trait]
impl DocumentCursor for FindCursor {
    fn limit(&mut self, limit: i64) -> Result<(), Error> {
        self.configure(|options| options.limit = Some(limit))
    }

    fn skip(&mut self, skip: u64) -> Result<(), Error> {
        self.configure(|options| options.skip = Some(skip))
    }

    fn sort(&mut self, sort: Document) -> Result<(), Error> {
        self.configure(|options| options.sort = Some(sort))
    }

    async fn next_document(&mut self) -> Result<Option<Document>, Error> {
        loop {
            match &mut self.state {
                FindState::Pending => {
                    let cursor = self
                        .collection
                        .find(self.filter.clone(), self.options.clone())
                        .await?;
                    self.state = FindState::Streaming(cursor);
                }
                FindState::Streaming(cursor) => match cursor.try_next().await? {
                    Some(document) => return Ok(Some(document)),
                    None => {
                        self.state = FindState::Done;
                        return Ok(None);
                    }
                },
                FindState::Done => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        // Dropping the driver cursor reaps the server-side cursor.
        self.state = FindState::Done;
        Ok(())
    }
}
