//! Bucket-to-bucket transform: extract, spill-sort, load.

use crate::{new_buffer, Collector, EtlError, LoadFunc, TransformArgs};
use std::path::Path;
use stratus_kv::{Cursor, Kv, Tx};

/// An extract function: receives each source pair and emits zero or more
/// pairs into the collector.
pub type ExtractFunc<'a> =
    Box<dyn FnMut(&[u8], &[u8], &mut Collector) -> Result<(), EtlError> + 'a>;

/// Walks `src` from `args.extract_start_key`, feeds every pair through
/// `extract` into a spill-sorting collector, then loads the merged stream
/// into `dst` (see [`Collector::load`] for the load semantics).
pub fn transform<K: Kv>(
    db: &K,
    src: &'static str,
    dst: &'static str,
    tmpdir: &Path,
    mut extract: ExtractFunc<'_>,
    load_fn: Option<LoadFunc<'_>>,
    args: TransformArgs<'_>,
) -> Result<(), EtlError> {
    let mut collector =
        Collector::new(tmpdir, new_buffer(args.buffer_kind, args.buffer_capacity))?;

    let tx = db.begin()?;
    let mut cursor = tx.cursor(src)?;
    let mut entry = match args.extract_start_key.as_deref() {
        Some(start) => cursor.seek(start)?,
        None => cursor.first()?,
    };
    while let Some((key, value)) = entry {
        args.cancel.check()?;
        extract(&key, &value, &mut collector)?;
        entry = cursor.next()?;
    }
    drop(cursor);
    drop(tx);

    collector.load(db, dst, load_fn, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferKind;
    use stratus_kv::{tables, Cursor, MemKv, Tx, TxMut};

    const SRC: &str = tables::PLAIN_ACCOUNT_CHANGE_SET;
    const DST: &str = tables::PLAIN_STATE;

    fn seed(kv: &MemKv, pairs: &[(&[u8], &[u8])]) {
        kv.update(|tx| {
            for (k, v) in pairs {
                TxMut::put(tx, SRC, k, v)?;
            }
            Ok(())
        })
        .unwrap();
    }

    fn dst_rows(kv: &MemKv) -> Vec<(Vec<u8>, Vec<u8>)> {
        kv.view(|tx| {
            let mut out = Vec::new();
            tx.cursor(DST)?.walk(None, |k, v| {
                out.push((k.to_vec(), v.to_vec()));
                Ok(true)
            })?;
            Ok(out)
        })
        .unwrap()
    }

    #[test]
    fn extract_reorders_and_loads() {
        let kv = MemKv::new();
        seed(&kv, &[(b"1x", b"a"), (b"2y", b"b"), (b"3z", b"c")]);

        // extract strips the first byte, inverting the source order
        let extract: ExtractFunc<'_> = Box::new(|key, value, collector| {
            let mut flipped = key[1..].to_vec();
            flipped[0] = 0xff - flipped[0];
            collector.collect(&flipped, value)?;
            Ok(())
        });
        transform(
            &kv,
            SRC,
            DST,
            &std::env::temp_dir(),
            extract,
            None,
            TransformArgs { buffer_capacity: 8, ..Default::default() },
        )
        .unwrap();

        let rows = dst_rows(&kv);
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(rows[0].1, b"c".to_vec());
    }

    #[test]
    fn extract_start_key_bounds_the_scan() {
        let kv = MemKv::new();
        seed(&kv, &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);

        let extract: ExtractFunc<'_> = Box::new(|key, value, collector| {
            collector.collect(key, value)?;
            Ok(())
        });
        transform(
            &kv,
            SRC,
            DST,
            &std::env::temp_dir(),
            extract,
            None,
            TransformArgs {
                extract_start_key: Some(b"b".to_vec()),
                buffer_kind: BufferKind::SortableAppend,
                ..Default::default()
            },
        )
        .unwrap();

        let keys: Vec<_> = dst_rows(&kv).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn extraction_observes_cancellation() {
        let kv = MemKv::new();
        seed(&kv, &[(b"a", b"1")]);
        let cancel = stratus_kv::CancelToken::new();
        cancel.cancel();
        let extract: ExtractFunc<'_> = Box::new(|_, _, _| unreachable!("extract after cancel"));
        let err = transform(
            &kv,
            SRC,
            DST,
            &std::env::temp_dir(),
            extract,
            None,
            TransformArgs { cancel, ..Default::default() },
        )
        .unwrap_err();
        assert!(err.is_canceled());
    }
}
