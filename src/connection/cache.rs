use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::engine::{PreparedStatement, QueryResult};
use crate::error::{error_code, DbError};

/// A result handle shared between the reactor and the command workers.
pub type SharedResult = Arc<Mutex<Box<dyn QueryResult>>>;

/// A server-side object addressable by a client-chosen id.
#[derive(Clone)]
pub enum CachedObject {
    Statement(Arc<dyn PreparedStatement>),
    Result(SharedResult),
}

impl std::fmt::Debug for CachedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CachedObject::Statement(_) => f.write_str("CachedObject::Statement(..)"),
            CachedObject::Result(_) => f.write_str("CachedObject::Result(..)"),
        }
    }
}

/// Small bounded map from wire object id to server object.
///
/// Ids are assigned by the client and scoped to one connection. When the
/// cache overflows, the oldest entry is dropped; a client that keeps more
/// live objects than the capacity gets an id miss on the evicted one.
pub struct ObjectCache {
    map: HashMap<i32, CachedObject>,
    order: VecDeque<i32>,
    capacity: usize,
}

impl ObjectCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity.min(64)),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn add_object(&mut self, id: i32, obj: CachedObject) {
        if self.map.insert(id, obj).is_none() {
            self.order.push_back(id);
        }
        while self.map.len() > self.capacity {
            // never evict the entry that was just installed
            match self.order.pop_front() {
                Some(old) if old == id => self.order.push_back(old),
                Some(old) => {
                    self.map.remove(&old);
                    debug!(object_id = old, "evicted cached object");
                }
                None => break,
            }
        }
    }

    /// Look up an id that must exist; a miss is a client error.
    pub fn get_object(&self, id: i32) -> Result<CachedObject, DbError> {
        self.map.get(&id).cloned().ok_or_else(|| {
            DbError::get(error_code::OBJECT_CLOSED, format!("object {id} is closed"))
        })
    }

    /// Look up an id that may legitimately be gone already.
    pub fn try_get_object(&self, id: i32) -> Option<CachedObject> {
        self.map.get(&id).cloned()
    }

    pub fn get_statement(&self, id: i32) -> Result<Arc<dyn PreparedStatement>, DbError> {
        match self.get_object(id)? {
            CachedObject::Statement(s) => Ok(s),
            CachedObject::Result(_) => Err(DbError::protocol(format!(
                "object {id} is a result, statement expected"
            ))),
        }
    }

    pub fn get_result(&self, id: i32) -> Result<SharedResult, DbError> {
        match self.get_object(id)? {
            CachedObject::Result(r) => Ok(r),
            CachedObject::Statement(_) => Err(DbError::protocol(format!(
                "object {id} is a statement, result expected"
            ))),
        }
    }

    pub fn free_object(&mut self, id: i32) {
        if self.map.remove(&id).is_some() {
            self.order.retain(|&o| o != id);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// A LOB input stream with its read position.
///
/// The position always equals the total number of bytes handed out, so a
/// continuation request whose offset equals `pos()` can keep reading
/// without touching the storage layer again.
pub struct CachedReader {
    inner: Option<Box<dyn Read + Send>>,
    pos: i64,
}

impl CachedReader {
    pub fn new(inner: Box<dyn Read + Send>) -> Self {
        Self {
            inner: Some(inner),
            pos: 0,
        }
    }

    /// Placeholder with no stream; its position matches no offset, which
    /// forces the first read to open the storage stream.
    pub fn empty() -> Self {
        Self {
            inner: None,
            pos: -1,
        }
    }

    pub fn pos(&self) -> i64 {
        self.pos
    }

    /// Skip forward by `n` bytes by reading and discarding.
    pub fn skip(&mut self, n: i64) -> std::io::Result<()> {
        let mut remaining = n;
        let mut scratch = [0u8; 4096];
        while remaining > 0 {
            let take = scratch.len().min(remaining as usize);
            let read = match &mut self.inner {
                Some(r) => r.read(&mut scratch[..take])?,
                None => 0,
            };
            if read == 0 {
                break;
            }
            self.pos += read as i64;
            remaining -= read as i64;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes; short only at end of stream.
    pub fn read_fully(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let read = match &mut self.inner {
                Some(r) => r.read(&mut buf[filled..])?,
                None => 0,
            };
            if read == 0 {
                break;
            }
            filled += read;
        }
        self.pos += filled as i64;
        Ok(filled)
    }
}

/// Least-recently-used cache of open LOB readers, keyed by lob id.
///
/// Sized small; eviction drops the reader, which closes the underlying
/// stream. Lives and dies with its connection.
pub struct LobCache {
    map: HashMap<i64, (CachedReader, u64)>,
    capacity: usize,
    tick: u64,
}

impl LobCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            capacity: capacity.max(1),
            tick: 0,
        }
    }

    pub fn get_mut(&mut self, lob_id: i64) -> Option<&mut CachedReader> {
        self.tick += 1;
        let tick = self.tick;
        self.map.get_mut(&lob_id).map(|(reader, stamp)| {
            *stamp = tick;
            reader
        })
    }

    pub fn put(&mut self, lob_id: i64, reader: CachedReader) {
        self.tick += 1;
        self.map.insert(lob_id, (reader, self.tick));
        if self.map.len() > self.capacity {
            if let Some(&oldest) = self
                .map
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(id, _)| id)
            {
                self.map.remove(&oldest);
                debug!(lob_id = oldest, "evicted cached lob stream");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct NopStatement;
    impl PreparedStatement for NopStatement {
        fn is_query(&self) -> bool {
            false
        }
        fn query(&self, _: i32, _: bool) -> Result<Box<dyn QueryResult>, DbError> {
            Err(DbError::general("not a query"))
        }
        fn update(&self) -> Result<i32, DbError> {
            Ok(0)
        }
        fn metadata(&self) -> Result<Box<dyn QueryResult>, DbError> {
            Err(DbError::general("no metadata"))
        }
        fn parameters(&self) -> Vec<Arc<dyn crate::engine::CommandParameter>> {
            Vec::new()
        }
        fn set_fetch_size(&self, _: i32) {}
        fn set_connection_id(&self, _: i32) {}
        fn cancel(&self) {}
        fn close(&self) {}
    }

    fn stmt() -> CachedObject {
        CachedObject::Statement(Arc::new(NopStatement))
    }

    #[test]
    fn eviction_drops_the_oldest_entry_but_never_the_newest() {
        let mut cache = ObjectCache::new(2);
        cache.add_object(1, stmt());
        cache.add_object(2, stmt());
        cache.add_object(3, stmt());
        assert!(cache.try_get_object(1).is_none());
        assert!(cache.try_get_object(2).is_some());
        assert!(cache.try_get_object(3).is_some());
    }

    #[test]
    fn missing_ids_are_reported_as_closed() {
        let cache = ObjectCache::new(4);
        let e = cache.get_object(9).unwrap_err();
        assert_eq!(e.code, error_code::OBJECT_CLOSED);
        assert!(cache.try_get_object(9).is_none());
    }

    #[test]
    fn free_object_makes_ids_reusable() {
        let mut cache = ObjectCache::new(4);
        cache.add_object(1, stmt());
        cache.free_object(1);
        assert!(cache.is_empty());
        cache.add_object(1, stmt());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cached_reader_tracks_its_position() {
        let mut r = CachedReader::new(Box::new(Cursor::new(vec![9u8; 100])));
        r.skip(10).unwrap();
        assert_eq!(r.pos(), 10);
        let mut buf = [0u8; 30];
        assert_eq!(r.read_fully(&mut buf).unwrap(), 30);
        assert_eq!(r.pos(), 40);
        let mut rest = [0u8; 100];
        assert_eq!(r.read_fully(&mut rest).unwrap(), 60);
        assert_eq!(r.pos(), 100);
    }

    #[test]
    fn empty_reader_matches_no_offset() {
        let r = CachedReader::empty();
        assert_eq!(r.pos(), -1);
    }

    #[test]
    fn lob_cache_evicts_least_recently_used() {
        let mut cache = LobCache::new(2);
        cache.put(1, CachedReader::empty());
        cache.put(2, CachedReader::empty());
        assert!(cache.get_mut(1).is_some()); // 1 is now the most recent
        cache.put(3, CachedReader::empty());
        assert!(cache.get_mut(2).is_none());
        assert!(cache.get_mut(1).is_some());
        assert!(cache.get_mut(3).is_some());
    }
}
