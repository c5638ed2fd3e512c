#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
//! Round-trip tests for group index serialization
//!
//! Every flavor written by `GroupIndexBuilder` must parse back to the same
//! sorted records, and the block hashes, TOC hash and footer checksum of
//! the output must verify.

use std::collections::BTreeMap;

use cascette_crypto::ContentKey;
use cascette_formats::archive::{
    ArchiveIndex, GroupIndexBuilder, IndexEntry, OffsetFlavor, constants::BLOCK_SIZE,
    looks_encrypted, write_group_index,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

#[test]
fn sixteen_keys_archive_group_flavor() {
    let entries: Vec<(ContentKey, IndexEntry)> = (0x00..=0x0Fu8)
        .map(|i| {
            (
                ContentKey::from_bytes([i; 16]),
                IndexEntry::new(u16::from(i) * 3, u32::from(i) * 0x1000, 100 + u32::from(i)),
            )
        })
        .collect();

    let data = write_group_index(entries.clone(), OffsetFlavor::ArchiveGroup).expect("build");

    // One block, one TOC row (16-byte key + 8-byte hash), footer
    assert_eq!(data.len(), BLOCK_SIZE + 24 + 28);
    assert!(!looks_encrypted(&data));

    let index = ArchiveIndex::parse(&data).expect("parse");
    assert_eq!(index.flavor, OffsetFlavor::ArchiveGroup);
    assert_eq!(index.footer.element_count, 16);
    index.verify(&data).expect("checksums");

    let parsed: Vec<(ContentKey, IndexEntry)> =
        index.records.iter().map(|r| (r.key, r.entry)).collect();
    assert_eq!(parsed, entries);
}

#[test]
fn archive_flavor_takes_archive_from_caller() {
    let key = ContentKey::from_data(b"blob");
    let mut builder = GroupIndexBuilder::new(OffsetFlavor::Archive);
    builder.add(key, IndexEntry::new(0, 512, 64));
    let data = builder.build().expect("build");

    let index = ArchiveIndex::parse_for_archive(&data, 17).expect("parse");
    assert_eq!(index.find(&key), Some(&IndexEntry::new(17, 512, 64)));
}

#[test]
fn footer_bytes_are_canonical() {
    let data = write_group_index(
        [(ContentKey::from_bytes([1; 16]), IndexEntry::new(1, 2, 3))],
        OffsetFlavor::PatchGroup,
    )
    .expect("build");
    let footer = &data[data.len() - 28..];
    assert_eq!(&footer[8..16], &[1, 0, 0, 4, 5, 4, 16, 8]);
    assert_eq!(&footer[16..20], &1i32.to_le_bytes());
}

fn flavor_strategy() -> impl Strategy<Value = OffsetFlavor> {
    prop_oneof![
        Just(OffsetFlavor::Archive),
        Just(OffsetFlavor::PatchGroup),
        Just(OffsetFlavor::ArchiveGroup),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn parse_inverts_build(
        raw in prop::collection::btree_map(any::<[u8; 16]>(), (any::<u8>(), any::<u32>(), any::<u32>()), 0..400),
        flavor in flavor_strategy(),
    ) {
        let entries: BTreeMap<ContentKey, IndexEntry> = raw
            .into_iter()
            .map(|(k, (archive, offset, size))| {
                let archive_index = match flavor {
                    OffsetFlavor::ArchiveGroup => u16::from(archive) * 257,
                    OffsetFlavor::PatchGroup => u16::from(archive),
                    _ => 5,
                };
                (ContentKey::from_bytes(k), IndexEntry::new(archive_index, offset, size))
            })
            .collect();

        let data = write_group_index(entries.clone(), flavor).expect("build");
        let index = ArchiveIndex::parse_for_archive(&data, 5).expect("parse");
        index.verify(&data).expect("checksums");

        let parsed: BTreeMap<ContentKey, IndexEntry> =
            index.records.iter().map(|r| (r.key, r.entry)).collect();
        prop_assert_eq!(index.records.len(), entries.len());
        prop_assert_eq!(parsed, entries);
    }
}
