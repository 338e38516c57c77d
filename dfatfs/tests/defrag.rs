// SPDX-License-Identifier: MIT

//! End-to-end scenarios over in-memory images: info is read-only, defrag
//! packs files, displacement resolves interleaved chains, crash replay
//! restores consistency, frag+defrag round-trips, and directory moves keep
//! the tree reachable.

use std::path::PathBuf;

use dfatfs::prelude::*;
use tempfile::{tempdir, TempDir};

fn fat16_image() -> Vec<u8> {
    let spec = FormatSpec::with_cluster_count(8000);
    let mut img = vec![0u8; spec.image_len() as usize];
    let mut io = MemBlockIO::new(&mut img);
    format_volume(&mut io, &spec).unwrap();
    img
}

fn tiny_fat12_image(clusters: u32) -> Vec<u8> {
    let spec = FormatSpec::with_cluster_count(clusters);
    let mut img = vec![0u8; spec.image_len() as usize];
    let mut io = MemBlockIO::new(&mut img);
    format_volume(&mut io, &spec).unwrap();
    img
}

fn jpath(dir: &TempDir) -> PathBuf {
    dir.path().join("image.jrnl")
}

/// One byte value per cluster index makes misplaced clusters visible.
fn patterned(bytes_per_cluster: usize, clusters: usize) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes_per_cluster * clusters);
    for i in 0..clusters {
        body.extend(std::iter::repeat(0x40 + i as u8).take(bytes_per_cluster));
    }
    body
}

fn assert_fats_identical(img: &mut Vec<u8>, params: &BootParams) {
    let len = params.fat_size_bytes();
    let mut io = MemBlockIO::new(img);
    let mut fat0 = vec![0u8; len];
    io.read_at(params.fat_offset(0), &mut fat0).unwrap();
    for copy in 1..params.num_fats {
        let mut other = vec![0u8; len];
        io.read_at(params.fat_offset(copy), &mut other).unwrap();
        assert_eq!(fat0, other, "FAT copy {copy} diverged from copy 0");
    }
}

// --- Scenario A: info on a clean image mutates nothing ---

#[test]
fn info_is_read_only_and_leaves_no_journal() {
    let dir = tempdir().unwrap();
    let mut img = fat16_image();
    let snapshot = img.clone();

    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        let info = vol.info().unwrap();
        assert_eq!(info.variant, FatVariant::Fat16);
        assert_eq!(info.cluster_count, 8000);
        assert_eq!(info.free_clusters, 8000);
        assert_eq!(info.file_count, 0);
        vol.close().unwrap();
    }

    assert_eq!(img, snapshot, "INFO run must not modify the image");
    assert!(!jpath(&dir).exists());
}

// --- Scenario B: defragment one scattered file ---

#[test]
fn defrag_packs_a_scattered_file() {
    let dir = tempdir().unwrap();
    let mut img = fat16_image();
    let body = patterned(512, 5);

    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        let id = vol.create_file(ROOT_ID, "file_a.txt", &body).unwrap();
        assert_eq!(vol.file_chain(id).unwrap(), vec![2, 3, 4, 5, 6]);

        // Scatter to {10, 40, 41, 80, 81}.
        for (src, dst) in [(2, 10), (3, 40), (4, 41), (5, 80), (6, 81)] {
            vol.move_cluster(src, dst).unwrap();
        }
        assert_eq!(vol.file_chain(id).unwrap(), vec![10, 40, 41, 80, 81]);
        vol.close().unwrap();
    }

    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        let report = Defragmenter::new(&mut vol).run().unwrap();
        assert_eq!(report.files_moved, 1);
        assert!(report.fully_defragmented());

        let id = vol.find_path("/file_a.txt").unwrap();
        // Earliest free run of length 5 starts right at the first data
        // cluster.
        assert_eq!(vol.file_chain(id).unwrap(), vec![2, 3, 4, 5, 6]);
        assert_eq!(vol.catalog().node(id).head, 2);
        assert_eq!(vol.read_file(id).unwrap(), body);
        let params = vol.params().clone();
        vol.close().unwrap();
        assert_fats_identical(&mut img, &params);
    }
}

// --- Scenario C: displacement when no free run is long enough ---

#[test]
fn defrag_displaces_interleaved_files() {
    let dir = tempdir().unwrap();
    let mut img = tiny_fat12_image(12);
    let body_a = patterned(512, 3);
    let body_b: Vec<u8> = patterned(512, 3).iter().map(|b| b | 0x80).collect();

    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        let a = vol.create_file(ROOT_ID, "a.bin", &body_a).unwrap();
        let b = vol.create_file(ROOT_ID, "b.bin", &body_b).unwrap();
        assert_eq!(vol.file_chain(a).unwrap(), vec![2, 3, 4]);
        assert_eq!(vol.file_chain(b).unwrap(), vec![5, 6, 7]);

        // Interleave the two chains; afterwards no free run is >= 3.
        vol.move_cluster(3, 8).unwrap();
        vol.move_cluster(4, 10).unwrap();
        vol.move_cluster(6, 9).unwrap();
        vol.move_cluster(7, 11).unwrap();
        assert_eq!(vol.file_chain(a).unwrap(), vec![2, 8, 10]);
        assert_eq!(vol.file_chain(b).unwrap(), vec![5, 9, 11]);
        assert!(vol.allocate_contiguous(3).is_none());
        vol.close().unwrap();
    }

    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        let report = Defragmenter::new(&mut vol).run().unwrap();
        assert!(report.fully_defragmented());
        // The second file may already be contiguous by the time its turn
        // comes: displacement for the first file relocates it wholesale.
        assert_eq!(report.files_moved + report.already_contiguous, 2);
        assert!(report.clusters_moved > 0);

        let a = vol.find_path("/a.bin").unwrap();
        let b = vol.find_path("/b.bin").unwrap();
        let chain_a = vol.file_chain(a).unwrap();
        let chain_b = vol.file_chain(b).unwrap();
        assert!(chain_a.windows(2).all(|w| w[1] == w[0] + 1));
        assert!(chain_b.windows(2).all(|w| w[1] == w[0] + 1));
        assert!(chain_a.iter().all(|c| !chain_b.contains(c)));

        assert_eq!(vol.read_file(a).unwrap(), body_a);
        assert_eq!(vol.read_file(b).unwrap(), body_b);
        let params = vol.params().clone();
        vol.close().unwrap();
        assert_fats_identical(&mut img, &params);
    }
}

// --- Scenario D: crash between commit marker and log truncate ---

/// Builds one journal record in the on-disk format.
fn record(seq: u64, offset: u64, old: &[u8], new: &[u8], flag: u8) -> Vec<u8> {
    let mut rec = Vec::new();
    rec.extend_from_slice(&seq.to_le_bytes());
    rec.extend_from_slice(&offset.to_le_bytes());
    rec.extend_from_slice(&(new.len() as u32).to_le_bytes());
    rec.extend_from_slice(old);
    rec.extend_from_slice(new);
    let crc = crc32fast::hash(&rec);
    rec.extend_from_slice(&crc.to_le_bytes());
    rec.push(flag);
    rec
}

#[test]
fn replay_finishes_a_committed_transaction() {
    let dir = tempdir().unwrap();
    let mut img = fat16_image();
    let body = patterned(512, 2);

    let (params, data_off) = {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        let id = vol.create_file(ROOT_ID, "crash.bin", &body).unwrap();
        let head = vol.catalog().node(id).head;
        let off = vol.params().cluster_offset(head);
        let params = vol.params().clone();
        vol.close().unwrap();
        (params, off)
    };

    // A committed-but-unapplied transaction: the first data byte becomes
    // 0xEE, mirrored into both FAT copies for cluster 200 as an EOC entry.
    let mut log = Vec::new();
    log.extend(record(0, data_off, &body[0..1], &[0xEE], 0));
    let (span, len) = params.variant.entry_span(200);
    let eoc = 0xFFFFu16.to_le_bytes();
    for copy in 0..params.num_fats {
        log.extend(record(
            1 + copy as u64,
            params.fat_offset(copy) + span as u64,
            &[0u8; 2],
            &eoc[..len],
            0,
        ));
    }
    log.extend(record(9, 0, &[], &[], 1));
    std::fs::write(jpath(&dir), &log).unwrap();

    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        assert_eq!(vol.replay_summary().replayed, 1);

        // The staged writes are now visible and the tree is intact.
        let id = vol.find_path("/crash.bin").unwrap();
        let mut expect = body.clone();
        expect[0] = 0xEE;
        assert_eq!(vol.read_file(id).unwrap(), expect);
        assert_eq!(vol.fat_entry(200), FatEntry::EndOfChain);
        vol.close().unwrap();
    }
    assert!(!jpath(&dir).exists());
    assert_fats_identical(&mut img, &params);
}

#[test]
fn replay_discards_an_uncommitted_transaction() {
    let dir = tempdir().unwrap();
    let mut img = fat16_image();
    let snapshot = img.clone();

    // Staged records with no commit marker: the crash happened before the
    // commit point, so nothing may be applied.
    let mut log = Vec::new();
    log.extend(record(0, 0x4000, &[0u8; 4], &[0xAA; 4], 0));
    std::fs::write(jpath(&dir), &log).unwrap();

    {
        let io = MemBlockIO::new(&mut img);
        let vol = Volume::mount(io, jpath(&dir)).unwrap();
        assert_eq!(vol.replay_summary().replayed, 0);
        assert_eq!(vol.replay_summary().discarded, 1);
        vol.close().unwrap();
    }
    assert_eq!(img, snapshot);
}

#[test]
fn replay_refuses_a_corrupt_journal() {
    let dir = tempdir().unwrap();
    let mut img = fat16_image();
    let snapshot = img.clone();

    let mut log = Vec::new();
    log.extend(record(0, 0x4000, &[0u8; 4], &[0xAA; 4], 0));
    log.extend(record(1, 0, &[], &[], 1));
    log[25] ^= 0xFF; // damage the record body after it was checksummed
    std::fs::write(jpath(&dir), &log).unwrap();

    let io = MemBlockIO::new(&mut img);
    match Volume::mount(io, jpath(&dir)) {
        Err(FsError::Journal(JournalError::Corrupt(_))) => {}
        other => panic!("expected CorruptJournal, got {other:?}"),
    }
    // Manual-repair state: image untouched, journal preserved.
    assert_eq!(img, snapshot);
    assert!(jpath(&dir).exists());
}

// --- Scenario E: fragment, then defragment ---

#[test]
fn frag_then_defrag_round_trips() {
    let dir = tempdir().unwrap();
    let mut img = fat16_image();

    let names = ["one.bin", "two.bin", "three.bin"];
    let bodies: Vec<Vec<u8>> = (0..names.len()).map(|i| patterned(512, 2 + i)).collect();

    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        for (name, body) in names.iter().zip(&bodies) {
            vol.create_file(ROOT_ID, name, body).unwrap();
        }
        vol.close().unwrap();
    }

    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        let moved = Fragmenter::new(&mut vol).run().unwrap();
        assert!(moved > 0, "fragmenter had nothing to scatter");

        // Every multi-cluster file must now be non-contiguous.
        for name in &names {
            let id = vol.find_path(&format!("/{name}")).unwrap();
            let chain = vol.file_chain(id).unwrap();
            assert!(chain.windows(2).any(|w| w[1] != w[0] + 1), "{name}");
        }
        let level = Defragmenter::new(&mut vol).fragmentation_level();
        assert!(level > 0.0);
        vol.close().unwrap();
    }

    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        let report = Defragmenter::new(&mut vol).run().unwrap();
        assert!(report.fully_defragmented());
        assert_eq!(Defragmenter::new(&mut vol).fragmentation_level(), 0.0);

        for (name, body) in names.iter().zip(&bodies) {
            let id = vol.find_path(&format!("/{name}")).unwrap();
            let chain = vol.file_chain(id).unwrap();
            assert!(chain.windows(2).all(|w| w[1] == w[0] + 1));
            assert_eq!(&vol.read_file(id).unwrap(), body, "{name}");
        }
        let params = vol.params().clone();
        vol.close().unwrap();
        assert_fats_identical(&mut img, &params);
    }
}

// --- Idempotence: a second defrag run performs zero mutations ---

#[test]
fn defrag_is_idempotent() {
    let dir = tempdir().unwrap();
    let mut img = fat16_image();

    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        vol.create_file(ROOT_ID, "x.bin", &patterned(512, 4)).unwrap();
        vol.create_file(ROOT_ID, "y.bin", &patterned(512, 3)).unwrap();
        Fragmenter::new(&mut vol).run().unwrap();
        Defragmenter::new(&mut vol).run().unwrap();
        vol.close().unwrap();
    }

    let settled = img.clone();
    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        let report = Defragmenter::new(&mut vol).run().unwrap();
        assert_eq!(report.clusters_moved, 0);
        assert_eq!(report.files_moved, 0);
        vol.close().unwrap();
    }
    assert_eq!(img, settled, "second defrag run must not touch the image");
}

// --- Scenario F: moving a directory updates dot entries ---

#[test]
fn moving_a_directory_keeps_the_tree_consistent() {
    let dir = tempdir().unwrap();
    let mut img = fat16_image();

    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        let sub = vol.create_dir(ROOT_ID, "sub").unwrap();
        vol.create_file(sub, "a.txt", b"alpha").unwrap();
        vol.create_file(sub, "b.txt", b"beta").unwrap();
        vol.create_dir(sub, "deeper").unwrap();

        let old_head = vol.catalog().node(sub).head;
        vol.move_cluster(old_head, 500).unwrap();
        vol.fix_dot_entries(sub).unwrap();
        assert!(vol.is_free(old_head));
        vol.close().unwrap();
    }

    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        // Traversal from the root still reaches everything.
        let sub = vol.find_path("/sub").unwrap();
        assert_eq!(vol.catalog().node(sub).head, 500);
        assert_eq!(vol.read_file(vol.find_path("/sub/a.txt").unwrap()).unwrap(), b"alpha");
        assert_eq!(vol.read_file(vol.find_path("/sub/b.txt").unwrap()).unwrap(), b"beta");
        let deeper = vol.find_path("/sub/deeper").unwrap();

        // '.' of sub points at its new head.
        let sub_data = vol.read_file(sub).unwrap();
        assert_eq!(u16::from_le_bytes([sub_data[26], sub_data[27]]), 500);
        // '..' of the child directory points at sub's new head.
        let deeper_data = vol.read_file(deeper).unwrap();
        assert_eq!(u16::from_le_bytes([deeper_data[58], deeper_data[59]]), 500);
        vol.close().unwrap();
    }
}

// --- Fault injection produces the defects the scanner classifies ---

#[test]
fn injected_defects_are_classified_on_rescan() {
    let dir = tempdir().unwrap();
    let mut img = fat16_image();

    let (loop_id, bad_id, linked) = {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        let mut inj = FaultInjector::new(&mut vol);
        let (loop_id, _) = inj.file_with_self_loop().unwrap();
        let (bad_id, _) = inj.file_with_bad_cluster().unwrap();
        let (a, b, _) = inj.cross_linked_files().unwrap();
        let names = (
            vol.catalog().path_of(loop_id),
            vol.catalog().path_of(bad_id),
            (vol.catalog().path_of(a), vol.catalog().path_of(b)),
        );
        vol.close().unwrap();
        names
    };

    let io = MemBlockIO::new(&mut img);
    let mut vol = Volume::mount(io, jpath(&dir)).unwrap();

    fn node_of<'a>(vol: &Volume<MemBlockIO<'a>>, path: &str) -> FileNode {
        let id = vol.find_path(path).unwrap();
        vol.catalog().node(id).clone()
    }
    assert!(matches!(
        node_of(&vol, &loop_id).chain_error,
        Some(ChainError::Loop(_))
    ));
    assert!(matches!(
        node_of(&vol, &bad_id).chain_error,
        Some(ChainError::Bad(_))
    ));
    // The earlier-scanned file absorbs the shared tail; the later one
    // reports the cross-link.
    let (first, second) = linked;
    assert!(node_of(&vol, &first).chain_error.is_none());
    assert!(matches!(
        node_of(&vol, &second).chain_error,
        Some(ChainError::CrossLink(_))
    ));

    // Damaged files (loop, bad cluster, cross-link) are skipped, not fatal.
    let report = Defragmenter::new(&mut vol).run().unwrap();
    assert_eq!(report.damaged.len(), 3);
    vol.close().unwrap();
}

#[test]
fn single_table_file_survives_only_with_its_table() {
    let dir = tempdir().unwrap();

    // Keep copy 0: the default mount sees the file intact.
    let mut img = fat16_image();
    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        FaultInjector::new(&mut vol).file_in_one_fat(0).unwrap();
        vol.close().unwrap();
    }
    {
        let io = MemBlockIO::new(&mut img);
        let vol = Volume::mount(io, jpath(&dir)).unwrap();
        let id = vol.find_path("/file").unwrap();
        assert!(vol.catalog().node(id).chain_error.is_none());
        vol.close().unwrap();
    }

    // Keep copy 0 but mount preferring copy 1: the chain reads as free.
    let mut img = fat16_image();
    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        FaultInjector::new(&mut vol).file_in_one_fat(0).unwrap();
        vol.close().unwrap();
    }
    {
        let io = MemBlockIO::new(&mut img);
        let opts = OpenOptions {
            preferred_fat: 1,
            ..Default::default()
        };
        let vol = Volume::mount_with(io, jpath(&dir), opts).unwrap();
        let id = vol.find_path("/file").unwrap();
        assert!(matches!(
            vol.catalog().node(id).chain_error,
            Some(ChainError::Broken(_))
        ));
        vol.close().unwrap();
    }
}

#[test]
fn lost_clusters_pin_displacement_regions() {
    let dir = tempdir().unwrap();
    let mut img = fat16_image();

    let io = MemBlockIO::new(&mut img);
    let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
    let start = FaultInjector::new(&mut vol).lost_cluster_run(3).unwrap();

    for c in start..start + 3 {
        assert!(!vol.is_free(c));
        assert!(vol.occupant(c).is_none());
    }
    // Defrag on top of lost clusters has nothing to move and must not fail.
    let report = Defragmenter::new(&mut vol).run().unwrap();
    assert_eq!(report.clusters_moved, 0);
    vol.close().unwrap();
}

// --- FAT32: the same engine over a chain-rooted tree ---

#[test]
fn fat32_defrag_with_directories() {
    let dir = tempdir().unwrap();
    let spec = FormatSpec::with_cluster_count(66000);
    let mut img = vec![0u8; spec.image_len() as usize];
    {
        let mut io = MemBlockIO::new(&mut img);
        format_volume(&mut io, &spec).unwrap();
    }

    let body = patterned(512, 4);
    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        assert_eq!(vol.params().variant, FatVariant::Fat32);

        let sub = vol.create_dir(ROOT_ID, "nested").unwrap();
        let f = vol.create_file(sub, "data.bin", &body).unwrap();
        let chain = vol.file_chain(f).unwrap();

        // Scatter the file far apart.
        vol.move_cluster(chain[1], 40_000).unwrap();
        vol.move_cluster(chain[3], 50_000).unwrap();
        vol.close().unwrap();
    }

    {
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, jpath(&dir)).unwrap();
        let report = Defragmenter::new(&mut vol).run().unwrap();
        assert!(report.fully_defragmented());

        let f = vol.find_path("/nested/data.bin").unwrap();
        let chain = vol.file_chain(f).unwrap();
        assert!(chain.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(vol.read_file(f).unwrap(), body);

        let params = vol.params().clone();
        vol.close().unwrap();
        assert_fats_identical(&mut img, &params);
    }
}
