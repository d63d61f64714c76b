use crate::KvError;

/// An owned key-value pair yielded by cursors.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// A transactional, ordered, byte-keyed store partitioned into named buckets.
pub trait Kv: Send + Sync {
    /// Read-only transaction type.
    type Tx<'env>: Tx
    where
        Self: 'env;
    /// Read-write transaction type.
    type TxMut<'env>: TxMut
    where
        Self: 'env;

    /// Begins a read-only transaction.
    fn begin(&self) -> Result<Self::Tx<'_>, KvError>;

    /// Begins a read-write transaction.
    fn begin_mut(&self) -> Result<Self::TxMut<'_>, KvError>;

    /// Runs `f` inside a read-only transaction.
    fn view<'a, T, F>(&'a self, f: F) -> Result<T, KvError>
    where
        F: FnOnce(&Self::Tx<'a>) -> Result<T, KvError>,
    {
        let tx = self.begin()?;
        f(&tx)
    }

    /// Runs `f` inside a read-write transaction, committing on `Ok` and
    /// rolling back on `Err`.
    fn update<'a, T, F>(&'a self, f: F) -> Result<T, KvError>
    where
        F: FnOnce(&mut Self::TxMut<'a>) -> Result<T, KvError>,
    {
        let mut tx = self.begin_mut()?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }
}

/// Read access within a transaction.
pub trait Tx {
    /// Cursor type over one bucket.
    type Cursor<'tx>: Cursor
    where
        Self: 'tx;

    /// Point lookup. `Ok(None)` when the key is absent.
    fn get(&self, bucket: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Opens a cursor over `bucket`.
    fn cursor(&self, bucket: &'static str) -> Result<Self::Cursor<'_>, KvError>;
}

/// Write access within a transaction. Writes become visible to other
/// transactions only after [`commit`](TxMut::commit).
pub trait TxMut: Tx {
    /// Inserts or overwrites `key`.
    fn put(&mut self, bucket: &'static str, key: &[u8], value: &[u8]) -> Result<(), KvError>;

    /// Removes `key` if present.
    fn delete(&mut self, bucket: &'static str, key: &[u8]) -> Result<(), KvError>;

    /// Removes every key in `bucket`.
    fn clear_bucket(&mut self, bucket: &'static str) -> Result<(), KvError>;

    /// Atomically applies all buffered writes.
    fn commit(self) -> Result<(), KvError>;

    /// Discards all buffered writes.
    fn rollback(self);
}

/// Forward iteration over one bucket in key order.
pub trait Cursor {
    /// Positions at the first entry.
    fn first(&mut self) -> Result<Option<KvPair>, KvError>;

    /// Positions at the first entry with key `>= key`.
    fn seek(&mut self, key: &[u8]) -> Result<Option<KvPair>, KvError>;

    /// Advances to the next entry.
    fn next(&mut self) -> Result<Option<KvPair>, KvError>;

    /// Iterates from `start` (or the first entry), invoking `f` until it
    /// returns `false` or the bucket is exhausted.
    fn walk<F>(&mut self, start: Option<&[u8]>, mut f: F) -> Result<(), KvError>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool, KvError>,
    {
        let mut entry = match start {
            Some(key) => self.seek(key)?,
            None => self.first()?,
        };
        while let Some((key, value)) = entry {
            if !f(&key, &value)? {
                return Ok(());
            }
            entry = self.next()?;
        }
        Ok(())
    }
}

/// A cursor view that yields keys and value sizes without copying values.
///
/// Used for iteration over large buckets where only keys matter.
#[derive(Debug)]
pub struct NoValuesCursor<C> {
    inner: C,
}

impl<C: Cursor> NoValuesCursor<C> {
    /// Wraps a cursor.
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    /// Positions at the first entry.
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, u32)>, KvError> {
        Ok(self.inner.first()?.map(|(k, v)| (k, v.len() as u32)))
    }

    /// Positions at the first entry with key `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, u32)>, KvError> {
        Ok(self.inner.seek(key)?.map(|(k, v)| (k, v.len() as u32)))
    }

    /// Advances to the next entry.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, u32)>, KvError> {
        Ok(self.inner.next()?.map(|(k, v)| (k, v.len() as u32)))
    }

    /// Iterates keys and value sizes until `f` returns `false`.
    pub fn walk<F>(&mut self, mut f: F) -> Result<(), KvError>
    where
        F: FnMut(&[u8], u32) -> Result<bool, KvError>,
    {
        let mut entry = self.first()?;
        while let Some((key, size)) = entry {
            if !f(&key, size)? {
                return Ok(());
            }
            entry = self.next()?;
        }
        Ok(())
    }
}
