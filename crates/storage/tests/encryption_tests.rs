// Client-side envelope encryption through the DataStore facade.

mod common;

use bytes::Bytes;
use common::{MemoryQuotaController, module_config, seeded_bytes, sha256_hash, storage_config};
use depot_storage::{
    ByteStream, DataKeyProvider, DataStore, EncryptionMode, EncryptionSelector, LocalKeyProvider,
    MemoryBackend, ObjectStore, SaveOptions, StorageError,
};
use futures::TryStreamExt;
use std::sync::Arc;
use uuid::Uuid;

const CHUNK: u64 = 2048;
const MIN_PART: u64 = 512;

fn client_encrypted_store() -> (DataStore, Arc<MemoryBackend>, Arc<MemoryQuotaController>) {
    let backend = Arc::new(MemoryBackend::new(MIN_PART));
    let ledger = Arc::new(MemoryQuotaController::new());
    let keys: Arc<dyn DataKeyProvider> = Arc::new(LocalKeyProvider::new("local", [7u8; 32]));
    let selector = EncryptionSelector::new(
        EncryptionMode::ClientKms {
            key_id: "local".to_string(),
        },
        backend.clone(),
        Some(keys),
    )
    .unwrap();
    let store = DataStore::with_encryption(
        &storage_config(CHUNK, MIN_PART),
        &module_config(),
        9,
        selector,
        Some(ledger.clone()),
    )
    .unwrap();
    (store, backend, ledger)
}

async fn read_all(store: &DataStore, domain: &str, path: &str) -> Vec<u8> {
    let stream = store.get_read_stream(domain, path, 0, None).await.unwrap();
    let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
    chunks.concat()
}

#[tokio::test]
async fn test_large_save_into_signed_domain_is_committed() {
    let (store, backend, ledger) = client_encrypted_store();
    let owner = Uuid::new_v4();
    let data = seeded_bytes(1, 3 * CHUNK as usize + 17);

    // Ciphertext cannot be handed out, so the signed domain falls back to
    // the shared URL once the write is stored.
    let url = store
        .save("private", "big.bin", owner, data.clone(), &SaveOptions::default())
        .await
        .unwrap();
    assert!(url.path().ends_with("/9/files/private/big.bin"));
    assert!(url.query().is_none());

    assert_eq!(backend.pending_uploads(), 0);
    assert_eq!(ledger.used("private", owner), data.len() as i64);
    assert_eq!(sha256_hash(&read_all(&store, "private", "big.bin").await), sha256_hash(&data));

    let raw = backend.get(&store.resolve("private", "big.bin")).await.unwrap();
    assert!(raw.len() > data.len());
    assert_ne!(&raw[..64], &data[..64]);

    // Explicit presigning still reports the refusal.
    let err = store.get_uri("private", "big.bin").await.unwrap_err();
    assert!(matches!(err, StorageError::Encryption(_)));
}

#[tokio::test]
async fn test_large_stream_and_copy_are_sealed_whole() {
    let (store, backend, ledger) = client_encrypted_store();
    let owner = Uuid::new_v4();
    let data = seeded_bytes(2, 5000);

    let chunks: Vec<Result<Bytes, StorageError>> = data
        .chunks(700)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    let stream: ByteStream = Box::pin(futures::stream::iter(chunks));
    store
        .save_stream("room", "stream.bin", owner, stream, data.len() as u64, &SaveOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(&store, "room", "stream.bin").await, data.to_vec());

    store
        .copy_object("room", "stream.bin", "private", "copy.bin", owner)
        .await
        .unwrap();
    store
        .move_object("room", "stream.bin", "room", "moved.bin", owner)
        .await
        .unwrap();
    assert_eq!(read_all(&store, "private", "copy.bin").await, data.to_vec());
    assert_eq!(read_all(&store, "room", "moved.bin").await, data.to_vec());
    assert!(!store.is_file("room", "stream.bin").await.unwrap());

    assert_eq!(backend.pending_uploads(), 0);
    assert_eq!(ledger.used("room", owner), data.len() as i64);
    assert_eq!(ledger.used("private", owner), data.len() as i64);
}
