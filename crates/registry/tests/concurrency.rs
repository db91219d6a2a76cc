// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use protocol::Category;
use registry::RegistryService;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_adds_of_one_name_are_all_counted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("models.json");
    std::fs::write(&path, r#"{"official": [], "custom": []}"#).unwrap();
    let service = RegistryService::open(&path).unwrap();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .add_model("microsoft/phi-4", Category::Custom)
                .await
                .unwrap()
                .is_new
        }));
    }

    let mut inserted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            inserted += 1;
        }
    }

    assert_eq!(inserted, 1);
    let snapshot = service.snapshot().await.unwrap();
    assert_eq!(snapshot.custom.len(), 1);
    assert_eq!(snapshot.custom[0].usage_count, 32);
    assert_eq!(service.version(), 32);

    // A fresh service sees exactly what was persisted.
    let reopened = RegistryService::open(&path).unwrap();
    assert_eq!(reopened.snapshot().await.unwrap(), snapshot);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notifications_arrive_in_version_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("models.json");
    std::fs::write(&path, r#"{"official": [], "custom": []}"#).unwrap();
    let service = RegistryService::open(&path).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    service.subscribe(move |list| {
        sink.lock().unwrap().push(list.version);
        Ok(())
    });

    let mut handles = Vec::new();
    for i in 0..16 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let name = format!("model-{}", i % 4);
            service.add_model(&name, Category::Custom).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, (1..=16).collect::<Vec<u64>>());

    let custom = service.custom_models(20).await.unwrap();
    assert_eq!(custom, vec!["model-0", "model-1", "model-2", "model-3"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listed_version_always_matches_listed_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("models.json");
    std::fs::write(&path, r#"{"official": [], "custom": []}"#).unwrap();
    let service = RegistryService::open(&path).unwrap();

    // Every add inserts a new official model, so version N lists N models.
    let done = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..6 {
        let service = service.clone();
        let done = done.clone();
        readers.push(tokio::spawn(async move {
            let mut mismatches = Vec::new();
            let mut reads = 0usize;
            while !done.load(Ordering::SeqCst) {
                let list = service.list_models().await.unwrap();
                if list.official.len() as u64 != list.version {
                    mismatches.push((list.version, list.official.len()));
                }
                reads += 1;
                tokio::task::yield_now().await;
            }
            (mismatches, reads)
        }));
    }

    for i in 0..200 {
        service
            .add_model(&format!("model-{i:03}"), Category::Official)
            .await
            .unwrap();
    }
    done.store(true, Ordering::SeqCst);

    let mut total_reads = 0;
    for reader in readers {
        let (mismatches, reads) = reader.await.unwrap();
        assert!(mismatches.is_empty(), "version/data mismatches: {mismatches:?}");
        total_reads += reads;
    }
    assert!(total_reads > 0);

    let list = service.list_models().await.unwrap();
    assert_eq!(list.version, 200);
    assert_eq!(list.official.len(), 200);
}
