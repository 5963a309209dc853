//! Session registry: binds session ids to real local stream connections
//!
//! Explicit open/closed lifecycle: once shut down, every operation fails
//! immediately instead of touching a drained map. Session ids are monotonic
//! and never reused while the registry lives.

use crate::EndpointError;
use bytes::Bytes;
use portside_transport::BoxedIo;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::trace;

/// Hard cap on a single forwarded read, whatever the caller asked for
const MAX_READ_CHUNK: usize = 64 * 1024;

/// One registered local stream, split so reads never block writes
pub struct Session {
    id: u64,
    reader: tokio::sync::Mutex<ReadHalf<BoxedIo>>,
    writer: tokio::sync::Mutex<WriteHalf<BoxedIo>>,
}

impl Session {
    fn new(id: u64, io: BoxedIo) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(io);
        Arc::new(Self {
            id,
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Read up to `max` bytes; an empty result is end-of-stream
    pub async fn read(&self, max: usize) -> std::io::Result<Bytes> {
        let max = max.min(MAX_READ_CHUNK);
        if max == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = vec![0u8; max];
        let n = self.reader.lock().await.read(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    pub async fn write(&self, data: &[u8]) -> std::io::Result<()> {
        self.writer.lock().await.write_all(data).await
    }

    pub async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

struct Inner {
    next_id: u64,
    open: bool,
    sessions: HashMap<u64, Arc<Session>>,
}

/// Registry guarded by a mutex with map-mutation-only critical sections
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                open: true,
                sessions: HashMap::new(),
            }),
        }
    }

    /// Register a local stream under a fresh session id
    pub fn register(&self, io: BoxedIo) -> Result<Arc<Session>, EndpointError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(EndpointError::RegistryShutdown);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let session = Session::new(id, io);
        inner.sessions.insert(id, session.clone());
        trace!("registered session {id}");
        Ok(session)
    }

    pub fn get(&self, id: u64) -> Result<Arc<Session>, EndpointError> {
        let inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(EndpointError::RegistryShutdown);
        }
        inner
            .sessions
            .get(&id)
            .cloned()
            .ok_or(EndpointError::SessionNotFound(id))
    }

    pub fn remove(&self, id: u64) -> Result<Arc<Session>, EndpointError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(EndpointError::RegistryShutdown);
        }
        inner
            .sessions
            .remove(&id)
            .ok_or(EndpointError::SessionNotFound(id))
    }

    /// Close the registry and hand back everything that was still live
    pub fn shutdown(&self) -> Vec<Arc<Session>> {
        let mut inner = self.inner.lock().unwrap();
        inner.open = false;
        inner.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_read_write() {
        let registry = SessionRegistry::new();
        let (local, mut remote) = tokio::io::duplex(1024);
        let session = registry.register(Box::new(local)).unwrap();

        remote.write_all(b"hello").await.unwrap();
        let data = session.read(16).await.unwrap();
        assert_eq!(data, Bytes::from_static(b"hello"));

        session.write(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_unique() {
        let registry = SessionRegistry::new();
        let (a, _ka) = tokio::io::duplex(16);
        let (b, _kb) = tokio::io::duplex(16);
        let s1 = registry.register(Box::new(a)).unwrap();
        let s2 = registry.register(Box::new(b)).unwrap();
        assert!(s2.id() > s1.id());

        // A removed id is not handed out again.
        registry.remove(s1.id()).unwrap();
        let (c, _kc) = tokio::io::duplex(16);
        let s3 = registry.register(Box::new(c)).unwrap();
        assert!(s3.id() > s2.id());
    }

    #[tokio::test]
    async fn test_shutdown_fails_further_operations() {
        let registry = SessionRegistry::new();
        let (a, _ka) = tokio::io::duplex(16);
        registry.register(Box::new(a)).unwrap();

        let drained = registry.shutdown();
        assert_eq!(drained.len(), 1);

        let (b, _kb) = tokio::io::duplex(16);
        assert!(matches!(
            registry.register(Box::new(b)),
            Err(EndpointError::RegistryShutdown)
        ));
        assert!(matches!(
            registry.get(1),
            Err(EndpointError::RegistryShutdown)
        ));
    }

    #[tokio::test]
    async fn test_missing_session() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.get(9),
            Err(EndpointError::SessionNotFound(9))
        ));
    }
}
