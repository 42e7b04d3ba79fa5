mod common;

use common::{generations, harness, MemoryRepository, ScriptedBackend, StubProbe};
use draftlm_core::api::ManifestResolver;
use draftlm_core::config::ServiceConfig;
use draftlm_core::error::{BackendTier, Error};
use draftlm_core::models::{find, Quantization};
use draftlm_core::runtime::LoadPhase;
use draftlm_core::storage::BlobStore;
use std::sync::Arc;

fn text_model() -> &'static draftlm_core::ModelDefinition {
    find("lfm2-350m").unwrap()
}

#[tokio::test]
async fn test_ladder_settles_on_single_variant_generation() {
    let model = text_model();
    let backend = ScriptedBackend::new(model, vec![])
        .failing_when(|_, graph| graph.contains("_q4f16") || graph.contains("_fp16"));
    let h = harness(
        MemoryRepository::with_model(model),
        backend,
        StubProbe::gpu(true),
        ServiceConfig::default(),
    );

    let loaded = h.runtime.load(model.id, None).await.unwrap();
    assert_eq!(loaded.attempt.tier, BackendTier::Gpu);
    assert_eq!(loaded.attempt.quantization, Quantization::Q4);
    assert!(loaded.device.is_some());
    assert_eq!(h.runtime.phase(), LoadPhase::Ready);

    let graphs = h.log.created_graphs();
    assert_eq!(graphs.first().unwrap(), "onnx/embed_tokens_q4f16.onnx");
    assert!(graphs.contains(&"onnx/embed_tokens_fp16.onnx".to_string()));

    // the failed variants were downloaded, then pruned after the commit
    assert_eq!(generations(&h.store).await, vec!["lfm2-350m@main".to_string()]);
    let mut keys = h.store.keys("lfm2-350m@main").await.unwrap();
    keys.sort();
    let mut expected: Vec<String> = loaded.manifest.files().map(|f| f.url.clone()).collect();
    expected.sort();
    assert_eq!(keys, expected);
    assert!(h.runtime.verify().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_half_precision_skipped_without_shader_f16() {
    let model = text_model();
    let h = harness(
        MemoryRepository::with_model(model),
        ScriptedBackend::new(model, vec![]),
        StubProbe::gpu(false),
        ServiceConfig::default(),
    );

    let loaded = h.runtime.load(model.id, None).await.unwrap();
    assert_eq!(loaded.attempt.to_string(), "gpu/q4");
    let q4f16 = MemoryRepository::url(model, "onnx/embed_tokens_q4f16.onnx");
    let fp16 = MemoryRepository::url(model, "onnx/embed_tokens_fp16.onnx");
    assert_eq!(h.repo.fetch_count(&q4f16), 0);
    assert_eq!(h.repo.fetch_count(&fp16), 0);
}

#[tokio::test]
async fn test_cpu_tier_after_preflight_failure() {
    let model = text_model();
    let h = harness(
        MemoryRepository::with_model(model),
        ScriptedBackend::new(model, vec![]),
        StubProbe::none(),
        ServiceConfig::default(),
    );

    let loaded = h.runtime.load(model.id, None).await.unwrap();
    assert_eq!(loaded.attempt.tier, BackendTier::Cpu);
    assert_eq!(loaded.attempt.quantization, model.cpu_fallback);
    assert!(loaded.device.is_none());
    assert!(h.log.tiers().iter().all(|t| *t == BackendTier::Cpu));
    assert_eq!(h.probe.calls(), 1);
}

#[tokio::test]
async fn test_gpu_disabled_skips_probe() {
    let model = text_model();
    let mut config = ServiceConfig::default();
    config.gpu.enabled = false;
    let h = harness(
        MemoryRepository::with_model(model),
        ScriptedBackend::new(model, vec![]),
        StubProbe::gpu(true),
        config,
    );

    let loaded = h.runtime.load(model.id, None).await.unwrap();
    assert_eq!(loaded.attempt.tier, BackendTier::Cpu);
    assert_eq!(h.probe.calls(), 0);
}

#[tokio::test]
async fn test_capability_error_when_gpu_required() {
    let model = text_model();
    let mut config = ServiceConfig::default();
    config.gpu.require_gpu = true;
    let h = harness(
        MemoryRepository::with_model(model),
        ScriptedBackend::new(model, vec![]),
        StubProbe::none(),
        config,
    );

    let err = h.runtime.load(model.id, None).await.unwrap_err();
    assert!(matches!(err.root(), Error::Capability(_)));
    assert_eq!(h.runtime.phase(), LoadPhase::Failed);
    assert!(h.runtime.current().is_none());
    assert_eq!(h.repo.total_fetches(), 0);
}

#[tokio::test]
async fn test_no_backend_available_counts_attempts() {
    let model = text_model();
    let h = harness(
        MemoryRepository::with_model(model),
        ScriptedBackend::new(model, vec![]).failing_when(|_, _| true),
        StubProbe::gpu(true),
        ServiceConfig::default(),
    );

    let err = h.runtime.load(model.id, None).await.unwrap_err();
    match err.root() {
        Error::NoBackendAvailable { model: id, attempts } => {
            assert_eq!(id, "lfm2-350m");
            assert_eq!(*attempts, 4);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.runtime.phase(), LoadPhase::Failed);
}

#[tokio::test]
async fn test_guessed_manifest_failure_is_reported() {
    let model = text_model();
    let repo = MemoryRepository::with_model(model);
    repo.disable_listing();
    let h = harness(
        repo,
        ScriptedBackend::new(model, vec![]).failing_when(|_, _| true),
        StubProbe::none(),
        ServiceConfig::default(),
    );

    let err = h.runtime.load(model.id, None).await.unwrap_err();
    assert!(matches!(err.root(), Error::GuessedManifest { .. }));
}

#[tokio::test]
async fn test_guessed_manifest_loads_when_layout_matches() {
    let model = text_model();
    let repo = MemoryRepository::with_model(model);
    repo.disable_listing();
    let h = harness(
        repo,
        ScriptedBackend::new(model, vec![]),
        StubProbe::none(),
        ServiceConfig::default(),
    );

    let loaded = h.runtime.load(model.id, None).await.unwrap();
    // only the first data shard is guessed
    let decoder = loaded
        .manifest
        .component(draftlm_core::api::SubNetwork::Decoder)
        .unwrap();
    assert_eq!(decoder.data_shards.len(), 1);
}

#[tokio::test]
async fn test_switch_invalidates_in_flight_load() {
    let small = text_model();
    let large = find("lfm2-1.2b").unwrap();
    let repo = MemoryRepository::with_model(small);
    repo.add_model(large);
    let (backend, entered, release) = ScriptedBackend::new(small, vec![]).holding_first();
    let h = harness(repo, backend, StubProbe::none(), ServiceConfig::default());

    let runtime = Arc::clone(&h.runtime);
    let stale = tokio::spawn(async move { runtime.load("lfm2-350m", None).await });

    entered.notified().await;
    h.runtime.switch_model("lfm2-1.2b").unwrap();
    release.notify_one();

    let err = stale.await.unwrap().unwrap_err();
    assert!(matches!(err.root(), Error::Superseded(_)));
    assert!(h.runtime.current().is_none());
    assert_ne!(h.runtime.phase(), LoadPhase::Ready);

    let loaded = h.runtime.load("lfm2-1.2b", None).await.unwrap();
    assert_eq!(loaded.definition.id, "lfm2-1.2b");
    assert_eq!(h.runtime.current().unwrap().definition.id, "lfm2-1.2b");
}

#[tokio::test]
async fn test_concurrent_loads_share_one_execution() {
    let model = text_model();
    let h = harness(
        MemoryRepository::with_model(model),
        ScriptedBackend::new(model, vec![]),
        StubProbe::none(),
        ServiceConfig::default(),
    );

    let (a, b) = tokio::join!(h.runtime.load(model.id, None), h.runtime.load(model.id, None));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    // token embedder and decoder, built once
    assert_eq!(h.log.created_graphs().len(), 2);

    let manifest = ManifestResolver::new(h.repo.clone())
        .resolve(model, model.cpu_fallback)
        .await
        .unwrap();
    for file in manifest.files() {
        assert_eq!(h.repo.fetch_count(&file.url), 1, "{} fetched twice", file.path);
    }

    let again = h.runtime.load(model.id, None).await.unwrap();
    assert!(Arc::ptr_eq(&a, &again));
    assert_eq!(h.log.created_graphs().len(), 2);
}

#[tokio::test]
async fn test_dispose_releases_model() {
    let model = text_model();
    let h = harness(
        MemoryRepository::with_model(model),
        ScriptedBackend::new(model, vec![]),
        StubProbe::none(),
        ServiceConfig::default(),
    );

    let loaded = h.runtime.load(model.id, None).await.unwrap();
    let generation = h.runtime.loader().generation();
    h.runtime.dispose();

    assert!(h.runtime.current().is_none());
    assert_eq!(h.runtime.phase(), LoadPhase::Unloaded);
    assert!(h.runtime.loader().generation() > generation);
    assert!(loaded.generation < h.runtime.loader().generation());
    // cached weights outlive the sessions
    assert_eq!(generations(&h.store).await, vec!["lfm2-350m@main".to_string()]);
}

#[tokio::test]
async fn test_unknown_model() {
    let model = text_model();
    let h = harness(
        MemoryRepository::with_model(model),
        ScriptedBackend::new(model, vec![]),
        StubProbe::none(),
        ServiceConfig::default(),
    );

    let err = h.runtime.load("gpt-17", None).await.unwrap_err();
    assert!(matches!(err, Error::UnknownModel(_)));
    assert!(h.runtime.switch_model("gpt-17").is_err());
}

#[tokio::test]
async fn test_pull_deduplicates_downloads() {
    let model = text_model();
    let h = harness(
        MemoryRepository::with_model(model),
        ScriptedBackend::new(model, vec![]),
        StubProbe::none(),
        ServiceConfig::default(),
    );

    let (a, b) = tokio::join!(
        h.runtime.pull(model.id, Some(Quantization::Q4), None),
        h.runtime.pull(model.id, Some(Quantization::Q4), None)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.downloaded, b.downloaded);
    assert_eq!(h.repo.total_fetches(), a.manifest.files().count());
}

#[tokio::test]
async fn test_pull_and_load_share_one_download() {
    let model = text_model();
    let h = harness(
        MemoryRepository::with_model(model),
        ScriptedBackend::new(model, vec![]),
        StubProbe::none(),
        ServiceConfig::default(),
    );

    let (pulled, loaded) = tokio::join!(
        h.runtime.pull(model.id, Some(model.cpu_fallback), None),
        h.runtime.load(model.id, None)
    );
    let (pulled, loaded) = (pulled.unwrap(), loaded.unwrap());
    assert_eq!(loaded.attempt.quantization, model.cpu_fallback);

    for file in pulled.manifest.files() {
        assert_eq!(h.repo.fetch_count(&file.url), 1, "{} fetched twice", file.path);
    }
}
