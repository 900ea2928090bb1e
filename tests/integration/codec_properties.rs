#![allow(missing_docs)]

use std::collections::BTreeMap;

use proptest::collection::vec;
use proptest::prelude::*;
use redoline::log::record::{self, Decode, ExtendedOp, FileOp, LogRecord, PageOp, RecordContext};
use redoline::log::{encode_mtr, LogScanner, ScanStep};
use redoline::primitives::bytes::var;
use redoline::recovery::{AddResult, PageRedoStore};
use redoline::types::{Lsn, PageId};

fn encode_one(rec: &LogRecord) -> Vec<u8> {
    let mut out = Vec::new();
    record::encode(rec, &mut RecordContext::new(), &mut out).expect("encodable record");
    out
}

#[test]
fn body_length_boundaries_roundtrip() {
    // page (1, 1) and offset 64 take one byte each, the rest is data
    for body_len in [15usize, 16, 127, 128, 16511, 16512] {
        let rec = LogRecord::write(PageId::new(1, 1), 64, vec![0x5A; body_len - 3]);
        let bytes = encode_one(&rec);
        let len_bytes = if body_len <= 15 {
            0
        } else {
            var::encoded_len(body_len as u32)
        };
        assert_eq!(bytes.len(), 1 + len_bytes + body_len, "body {body_len}");
        let mut ctx = RecordContext::new();
        assert_eq!(
            record::decode(&bytes, &mut ctx),
            Decode::Record(rec, bytes.len()),
            "body {body_len}"
        );
    }
}

#[test]
fn length_forms_switch_at_the_varint_limits() {
    let frame = |body_len: usize| {
        encode_one(&LogRecord::write(PageId::new(1, 1), 64, vec![1; body_len - 3])).len() - body_len
    };
    assert_eq!(frame(15), 1);
    assert_eq!(frame(16), 2);
    assert_eq!(frame(127), 2);
    assert_eq!(frame(128), 3);
    assert_eq!(frame(16511), 3);
    assert_eq!(frame(16512), 4);
}

fn page_id() -> impl Strategy<Value = PageId> {
    // few distinct pages so same-page compression kicks in
    (0u32..3, prop_oneof![0u32..4, 60_000u32..70_000]).prop_map(|(s, p)| PageId::new(s, p))
}

fn page_op() -> impl Strategy<Value = PageOp> {
    prop_oneof![
        Just(PageOp::FreePage),
        Just(PageOp::InitPage),
        (0u32..16_000, vec(any::<u8>(), 1..200))
            .prop_map(|(offset, data)| PageOp::Write { offset, data }),
        (0u32..16_000, 1u32..400, vec(any::<u8>(), 1..8)).prop_filter_map(
            "pattern longer than the fill",
            |(offset, len, pattern)| {
                (pattern.len() <= len as usize).then_some(PageOp::Memset {
                    offset,
                    len,
                    pattern,
                })
            }
        ),
        (0u32..16_000, 1u32..400, 0u32..16_000)
            .prop_filter("source equals destination", |(offset, _, source)| offset != source)
            .prop_map(|(offset, len, source)| PageOp::Memmove {
                offset,
                len,
                source
            }),
        Just(PageOp::Extended(ExtendedOp::UndoInit)),
        vec(any::<u8>(), 1..64).prop_map(|d| PageOp::Extended(ExtendedOp::UndoAppend(d))),
        vec(any::<u8>(), 1..16).prop_map(PageOp::Option),
    ]
}

fn file_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,12}\\.ibd"
}

fn file_op() -> impl Strategy<Value = FileOp> {
    prop_oneof![
        (0u32..1000, file_name()).prop_map(|(space, name)| FileOp::Create { space, name }),
        (0u32..1000, file_name()).prop_map(|(space, name)| FileOp::Delete { space, name }),
        (0u32..1000, file_name()).prop_map(|(space, name)| FileOp::Modify { space, name }),
        (0u32..1000, file_name(), file_name())
            .prop_map(|(space, from, to)| FileOp::Rename { space, from, to }),
        any::<u64>().prop_map(|lsn| FileOp::Checkpoint(Lsn(lsn))),
    ]
}

fn log_record() -> impl Strategy<Value = LogRecord> {
    prop_oneof![
        4 => (page_id(), page_op()).prop_map(|(page, op)| LogRecord::Page { page, op }),
        1 => file_op().prop_map(LogRecord::File),
    ]
}

proptest! {
    #[test]
    fn record_sequences_roundtrip(records in vec(log_record(), 1..24)) {
        let mut out = Vec::new();
        let mut ctx = RecordContext::new();
        for rec in &records {
            record::encode(rec, &mut ctx, &mut out).expect("encodable record");
        }
        let mut ctx = RecordContext::new();
        let mut pos = 0;
        for expected in &records {
            match record::decode(&out[pos..], &mut ctx) {
                Decode::Record(rec, used) => {
                    prop_assert_eq!(&rec, expected);
                    pos += used;
                }
                other => prop_assert!(false, "unexpected decode result {:?}", other),
            }
        }
        prop_assert_eq!(pos, out.len());
    }

    #[test]
    fn scanned_mtrs_match_what_was_encoded(
        mtrs in vec(vec(log_record(), 1..8), 1..6),
        chunk in 1usize..64,
    ) {
        let seq_bit = 1;
        let start = Lsn(8192);
        let mut stream = Vec::new();
        let mut bounds = Vec::new();
        for records in &mtrs {
            let bytes = encode_mtr(records, seq_bit).expect("encodable mtr");
            let begin = start.advance(stream.len() as u64);
            stream.extend_from_slice(&bytes);
            bounds.push((begin, start.advance(stream.len() as u64)));
        }

        let mut scanner = LogScanner::new(start, seq_bit);
        let mut fed = 0;
        let mut parsed = Vec::new();
        loop {
            let step = if fed < stream.len() {
                scanner.next_mtr()
            } else {
                scanner.finish()
            };
            match step {
                ScanStep::Mtr(mtr) => parsed.push(mtr),
                ScanStep::NeedMore => {
                    let end = (fed + chunk).min(stream.len());
                    scanner.feed(&stream[fed..end]);
                    fed = end;
                }
                ScanStep::EndOfLog(_) => break,
                ScanStep::Corrupt { lsn, reason } => {
                    prop_assert!(false, "corrupt at {}: {}", lsn, reason);
                }
            }
        }
        prop_assert_eq!(parsed.len(), mtrs.len());
        for ((mtr, records), (begin, end)) in parsed.iter().zip(&mtrs).zip(&bounds) {
            prop_assert_eq!(&mtr.records, records);
            prop_assert_eq!(mtr.start_lsn, *begin);
            prop_assert_eq!(mtr.end_lsn, *end);
        }
        prop_assert_eq!(scanner.scanned_lsn(), start.advance(stream.len() as u64));
    }
}

/// A mini-transaction for the store model: the pages it touches and
/// whether its registration is rewound part way through.
#[derive(Clone, Debug)]
struct ModelMtr {
    pages: Vec<u32>,
    rewind_after: Option<usize>,
}

fn model_mtr() -> impl Strategy<Value = ModelMtr> {
    (vec(0u32..6, 1..5), prop::option::weighted(0.3, 0usize..5))
        .prop_map(|(pages, rewind_after)| ModelMtr {
            rewind_after: rewind_after.map(|n| n.min(pages.len())),
            pages,
        })
}

proptest! {
    #[test]
    fn store_keeps_log_order_and_rewinds_cleanly(mtrs in vec(model_mtr(), 1..40)) {
        let store = PageRedoStore::unbounded();
        let mut model: BTreeMap<PageId, Vec<Lsn>> = BTreeMap::new();
        let mut lsn = 8192u64;
        for mtr in &mtrs {
            let start = Lsn(lsn);
            lsn += 10 * mtr.pages.len() as u64;
            let end = Lsn(lsn);
            let op = || PageOp::Write { offset: 100, data: vec![1, 2, 3] };
            match mtr.rewind_after {
                Some(n) => {
                    let before_bytes = store.bytes_used();
                    for &p in &mtr.pages[..n] {
                        let added = store.add(PageId::new(1, p), start, end, op()).expect("add");
                        prop_assert_eq!(added, AddResult::Added);
                    }
                    for &p in &mtr.pages {
                        store.trim(PageId::new(1, p), start);
                    }
                    prop_assert_eq!(store.bytes_used(), before_bytes);
                }
                None => {
                    for &p in &mtr.pages {
                        let id = PageId::new(1, p);
                        store.add(id, start, end, op()).expect("add");
                        model.entry(id).or_default().push(end);
                    }
                }
            }
            for (id, lsns) in &model {
                let stored = store.record_lsns(*id);
                prop_assert!(stored.windows(2).all(|w| w[0] <= w[1]));
                prop_assert_eq!(&stored, lsns);
            }
        }
        let pending: Vec<PageId> = model.keys().copied().collect();
        prop_assert_eq!(store.pending_ids(), pending);
    }
}
