use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::advance;

use crate::{
    ChunkedUploader, FollowState, IndexedStore, LocalDirStore, LocalFetcher, StreamFollower,
    UploaderConfig,
};

const NAME: &str = "out.txt";

async fn fixture() -> (TempDir, IndexedStore, ChunkedUploader) {
    fixture_with_encoding("utf-8").await
}

async fn fixture_with_encoding(encoding: &str) -> (TempDir, IndexedStore, ChunkedUploader) {
    let tmp = TempDir::new().expect("create temp dir");
    let store = LocalDirStore::open(tmp.path()).await.expect("open store");
    let index = IndexedStore::new(Arc::new(store));
    let config = UploaderConfig {
        filename: NAME.to_string(),
        encoding: encoding.to_string(),
        ..Default::default()
    };
    let uploader = ChunkedUploader::new(config, index.clone())
        .await
        .expect("create uploader");
    (tmp, index, uploader)
}

fn object(tmp: &TempDir, name: &str) -> Option<Vec<u8>> {
    std::fs::read(tmp.path().join(name)).ok()
}

fn manifest_sizes(tmp: &TempDir) -> Option<Vec<u64>> {
    let raw = object(tmp, &format!("{}.chunks", NAME))?;
    Some(serde_json::from_slice(&raw).expect("parse manifest"))
}

/// Arm the deadline, step past it, tick once. One flush per call.
async fn force_flush(uploader: &mut ChunkedUploader) {
    advance(Duration::from_secs(11)).await;
    uploader.write(b"", false).await.expect("flush tick");
}

#[tokio::test(start_paused = true)]
async fn test_init_publishes_empty_manifest_and_assets() {
    let (tmp, _index, _uploader) = fixture().await;
    assert_eq!(object(&tmp, "out.txt.chunks").unwrap(), b"[]");
    assert!(object(&tmp, "view.html").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_empty_stream() {
    let (tmp, _index, mut uploader) = fixture().await;
    uploader.write(b"", true).await.expect("finalise");

    assert_eq!(object(&tmp, NAME).unwrap(), b"");
    assert!(object(&tmp, "out.txt.chunks").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_single_small_line() {
    let (tmp, _index, mut uploader) = fixture().await;

    uploader.write(b"hello\n", false).await.expect("write");
    // Deadline armed but not due: nothing published yet.
    assert!(manifest_sizes(&tmp).unwrap().is_empty());

    force_flush(&mut uploader).await;
    assert_eq!(object(&tmp, "out.txt.0-6").unwrap(), b"hello\n");
    assert_eq!(manifest_sizes(&tmp).unwrap(), vec![6]);

    uploader.write(b"", true).await.expect("finalise");
    assert_eq!(object(&tmp, NAME).unwrap(), b"hello\n");
    assert!(object(&tmp, "out.txt.chunks").is_none());
    assert!(object(&tmp, "out.txt.0-6").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_merge_progression() {
    let (tmp, _index, mut uploader) = fixture().await;

    let expected = [
        (vec![1u64], "out.txt.0-1", b"a".to_vec()),
        (vec![2], "out.txt.0-2", b"ab".to_vec()),
        (vec![2, 1], "out.txt.2-3", b"c".to_vec()),
        (vec![4], "out.txt.0-4", b"abcd".to_vec()),
    ];
    for (byte, (sizes, chunk_name, chunk_data)) in [b"a", b"b", b"c", b"d"].iter().zip(&expected) {
        uploader.write(*byte, false).await.expect("write");
        force_flush(&mut uploader).await;
        assert_eq!(&manifest_sizes(&tmp).unwrap(), sizes);
        assert_eq!(&object(&tmp, chunk_name).unwrap(), chunk_data);
    }

    uploader.write(b"", true).await.expect("finalise");
    assert_eq!(object(&tmp, NAME).unwrap(), b"abcd");
    for (_, chunk_name, _) in &expected {
        assert!(object(&tmp, chunk_name).is_none(), "{} not deleted", chunk_name);
    }
    assert!(object(&tmp, "out.txt.chunks").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_size_triggered_flush() {
    let (tmp, _index, mut uploader) = fixture().await;

    let data = vec![b'x'; 1_000_000];
    uploader.write(&data, false).await.expect("write");

    assert_eq!(uploader.pending_len(), 0);
    assert_eq!(manifest_sizes(&tmp).unwrap(), vec![1_000_000]);
    assert_eq!(object(&tmp, "out.txt.0-1000000").unwrap().len(), 1_000_000);
}

#[tokio::test(start_paused = true)]
async fn test_time_triggered_flush() {
    let (tmp, _index, mut uploader) = fixture().await;

    uploader.write(b"x", false).await.expect("write");
    advance(Duration::from_secs(9)).await;
    uploader.write(b"", false).await.expect("tick");
    // Deadline not reached: still pending.
    assert_eq!(uploader.pending_len(), 1);
    assert!(manifest_sizes(&tmp).unwrap().is_empty());

    advance(Duration::from_secs(2)).await;
    uploader.write(b"", false).await.expect("tick");
    assert_eq!(uploader.pending_len(), 0);
    assert_eq!(manifest_sizes(&tmp).unwrap(), vec![1]);
    assert_eq!(object(&tmp, "out.txt.0-1").unwrap(), b"x");
}

#[tokio::test(start_paused = true)]
async fn test_deadline_rearms_per_block() {
    let (tmp, _index, mut uploader) = fixture().await;

    uploader.write(b"first", false).await.expect("write");
    force_flush(&mut uploader).await;

    // New pending data arms a fresh deadline rather than inheriting the
    // expired one.
    uploader.write(b"second", false).await.expect("write");
    assert_eq!(uploader.pending_len(), 6);
    advance(Duration::from_secs(9)).await;
    uploader.write(b"", false).await.expect("tick");
    assert_eq!(uploader.pending_len(), 6);

    advance(Duration::from_secs(2)).await;
    uploader.write(b"", false).await.expect("tick");
    assert_eq!(manifest_sizes(&tmp).unwrap(), vec![11]);
}

#[tokio::test(start_paused = true)]
async fn test_manifest_always_matches_published_chunks() {
    let (tmp, _index, mut uploader) = fixture().await;

    let mut stream = Vec::new();
    for i in 0..50u32 {
        let line = format!("line {} of the stream\n", i);
        stream.extend_from_slice(line.as_bytes());
        uploader.write(line.as_bytes(), false).await.expect("write");
        force_flush(&mut uploader).await;

        let sizes = manifest_sizes(&tmp).unwrap();
        let mut start = 0u64;
        let mut rebuilt = Vec::new();
        for size in &sizes {
            let end = start + size;
            let chunk = object(&tmp, &format!("{}.{}-{}", NAME, start, end))
                .unwrap_or_else(|| panic!("chunk {}-{} missing", start, end));
            assert_eq!(chunk.len() as u64, *size);
            rebuilt.extend(chunk);
            start = end;
        }
        assert_eq!(rebuilt, stream, "reconstruction diverged after block {}", i);
    }
}

#[tokio::test(start_paused = true)]
async fn test_round_trip_through_follower() {
    let (tmp, _index, mut uploader) = fixture().await;
    let mut follower = StreamFollower::new(LocalFetcher::new(tmp.path()), NAME);

    let mut stream = Vec::new();
    for i in 0..20u32 {
        let line = format!("{}: some interleaved output\n", i);
        stream.extend_from_slice(line.as_bytes());
        uploader.write(line.as_bytes(), false).await.expect("write");
        force_flush(&mut uploader).await;
        // Reader catches up mid-stream.
        assert!(matches!(
            follower.poll_once().await.expect("poll"),
            FollowState::Running
        ));
        assert_eq!(follower.held(), &stream[..]);
    }

    uploader.write(b"tail without flush", false).await.expect("write");
    stream.extend_from_slice(b"tail without flush");
    uploader.write(b"", true).await.expect("finalise");

    loop {
        match follower.poll_once().await.expect("poll") {
            FollowState::Finished => break,
            FollowState::Running => {}
        }
    }
    assert_eq!(follower.held(), &stream[..]);
}

#[tokio::test(start_paused = true)]
async fn test_late_joining_follower_sees_full_stream() {
    let (tmp, _index, mut uploader) = fixture().await;

    let mut stream = Vec::new();
    for i in 0..10u32 {
        let line = format!("early line {}\n", i);
        stream.extend_from_slice(line.as_bytes());
        uploader.write(line.as_bytes(), false).await.expect("write");
        force_flush(&mut uploader).await;
    }

    let mut follower = StreamFollower::new(LocalFetcher::new(tmp.path()), NAME);
    follower.poll_once().await.expect("poll");
    assert_eq!(follower.held(), &stream[..]);

    uploader.write(b"", true).await.expect("finalise");
    assert!(matches!(
        follower.poll_once().await.expect("poll"),
        FollowState::Finished
    ));
    assert_eq!(follower.held(), &stream[..]);
}

#[tokio::test(start_paused = true)]
async fn test_transcodes_to_utf8() {
    let (tmp, _index, mut uploader) = fixture_with_encoding("windows-1252").await;

    // 0xE9 is é in windows-1252.
    uploader.write(&[0xE9, b'!'], false).await.expect("write");
    uploader.write(b"", true).await.expect("finalise");
    assert_eq!(object(&tmp, NAME).unwrap(), "é!".as_bytes());
}

#[tokio::test(start_paused = true)]
async fn test_multibyte_split_across_writes() {
    let (tmp, _index, mut uploader) = fixture().await;

    // é as UTF-8 is C3 A9; feed it one byte per tick.
    uploader.write(&[0xC3], false).await.expect("write");
    uploader.write(&[0xA9], false).await.expect("write");
    uploader.write(b"", true).await.expect("finalise");
    assert_eq!(object(&tmp, NAME).unwrap(), "é".as_bytes());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_input_is_fatal() {
    let (_tmp, _index, mut uploader) = fixture().await;
    let err = uploader.write(&[0xFF], false).await.unwrap_err();
    assert!(matches!(err, crate::CastError::DecodeError(_)), "{:?}", err);
}

#[tokio::test(start_paused = true)]
async fn test_truncated_multibyte_at_finalisation_is_fatal() {
    let (_tmp, _index, mut uploader) = fixture().await;
    let err = uploader.write(&[0xC3], true).await.unwrap_err();
    assert!(matches!(err, crate::CastError::DecodeError(_)), "{:?}", err);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_encoding_rejected() {
    let tmp = TempDir::new().expect("create temp dir");
    let store = LocalDirStore::open(tmp.path()).await.expect("open store");
    let index = IndexedStore::new(Arc::new(store));
    let config = UploaderConfig {
        encoding: "no-such-charset".to_string(),
        ..Default::default()
    };
    assert!(ChunkedUploader::new(config, index).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_write_after_finalisation_fails() {
    let (_tmp, _index, mut uploader) = fixture().await;
    uploader.write(b"", true).await.expect("finalise");
    assert!(uploader.write(b"more", false).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_index_lists_consolidated_object() {
    let (tmp, index, mut uploader) = fixture().await;

    uploader.write(b"hi", false).await.expect("write");
    force_flush(&mut uploader).await;
    index.sync().await.expect("sync");
    // Transient objects stay out of the listing.
    let listing = String::from_utf8(object(&tmp, "index.html").unwrap()).unwrap();
    assert!(!listing.contains("out.txt.0-2"));
    assert!(!listing.contains("out.txt.chunks"));

    uploader.write(b"", true).await.expect("finalise");
    index.sync().await.expect("sync");
    let listing = String::from_utf8(object(&tmp, "index.html").unwrap()).unwrap();
    assert!(listing.contains(">out.txt<"));
    assert!(listing.contains("view.html"));
}
