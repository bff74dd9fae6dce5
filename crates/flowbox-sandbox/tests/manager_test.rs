use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flowbox_catalog::FsPieceCatalog;
use flowbox_flow::{CodeArtifact, FlowVersionState, PiecePackage, SourceCode};
use flowbox_sandbox::{ENGINE_RUNTIME, SandboxError, SandboxManager};

fn publish(root: &Path, name: &str, version: &str, index: &str) {
  let dir = root.join(format!("{}--{}", name.replace('/', "--"), version));
  std::fs::create_dir_all(&dir).unwrap();
  std::fs::write(
    dir.join("manifest.json"),
    format!(r#"{{"name": "{}", "version": "{}"}}"#, name, version),
  )
  .unwrap();
  std::fs::write(dir.join("index.lua"), index).unwrap();
}

fn artifact(state: FlowVersionState, code: &str) -> CodeArtifact {
  CodeArtifact {
    name: "step_1".to_string(),
    flow_version_id: "fv_1".to_string(),
    flow_version_state: state,
    source_code: SourceCode::new(code),
  }
}

struct Fixture {
  _catalog_dir: tempfile::TempDir,
  sandbox_dir: tempfile::TempDir,
  manager: Arc<SandboxManager>,
}

fn fixture() -> Fixture {
  let catalog_dir = tempfile::tempdir().unwrap();
  publish(
    catalog_dir.path(),
    "@flowbox/piece-math",
    "1.0.0",
    "return create_piece{ display_name = 'Math' }",
  );
  publish(
    catalog_dir.path(),
    "strings",
    "1.2.0",
    "return { upper = string.upper }",
  );

  let sandbox_dir = tempfile::tempdir().unwrap();
  let catalog = Arc::new(FsPieceCatalog::new(catalog_dir.path()));
  let manager = Arc::new(SandboxManager::new(sandbox_dir.path(), catalog));
  Fixture {
    _catalog_dir: catalog_dir,
    sandbox_dir,
    manager,
  }
}

#[tokio::test]
async fn test_locked_artifact_compiles_once() {
  let fx = fixture();
  let code = artifact(FlowVersionState::Locked, "return 1 + 1");

  let first = fx.manager.prepare(&[], &[code.clone()]).await.unwrap();
  let second = fx.manager.prepare(&[], &[code.clone()]).await.unwrap();

  assert_eq!(first.compiled, vec![code.key()]);
  assert!(second.compiled.is_empty());
  assert_eq!(second.reused, vec![code.key()]);
}

#[tokio::test]
async fn test_draft_artifact_compiles_every_time() {
  let fx = fixture();
  let code = artifact(FlowVersionState::Draft, "return 1 + 1");

  let first = fx.manager.prepare(&[], &[code.clone()]).await.unwrap();
  let second = fx.manager.prepare(&[], &[code.clone()]).await.unwrap();

  assert_eq!(first.compiled.len(), 1);
  assert_eq!(second.compiled.len(), 1);
  assert!(second.reused.is_empty());
}

#[tokio::test]
async fn test_draft_recompile_picks_up_new_source() {
  let fx = fixture();
  fx.manager
    .prepare(&[], &[artifact(FlowVersionState::Draft, "return 1")])
    .await
    .unwrap();
  let code = artifact(FlowVersionState::Draft, "return 2");
  fx.manager.prepare(&[], &[code.clone()]).await.unwrap();

  let index = fx.manager.layout().artifact_index(&code.key());
  let module = std::fs::read_to_string(index).unwrap();
  assert!(module.contains("return 2"));
}

#[tokio::test]
async fn test_invalid_source_becomes_stub() {
  let fx = fixture();
  let good = CodeArtifact {
    name: "step_2".to_string(),
    ..artifact(FlowVersionState::Draft, "return 3")
  };
  let bad = artifact(FlowVersionState::Draft, "return 1 +* 2");

  let summary = fx
    .manager
    .prepare(&[], &[bad.clone(), good.clone()])
    .await
    .unwrap();

  assert_eq!(summary.stubbed, vec![bad.key()]);
  assert_eq!(summary.compiled, vec![good.key()]);

  let stub = std::fs::read_to_string(fx.manager.layout().artifact_index(&bad.key())).unwrap();
  assert!(stub.contains("Compilation Error"));
}

#[tokio::test]
async fn test_code_dependencies_install_into_modules() {
  let fx = fixture();
  let code = CodeArtifact {
    source_code: SourceCode {
      code: "return require('strings').upper('a')".to_string(),
      manifest: r#"{"dependencies": {"strings": "^1.0.0"}}"#.to_string(),
    },
    ..artifact(FlowVersionState::Draft, "")
  };

  let summary = fx.manager.prepare(&[], &[code.clone()]).await.unwrap();
  assert_eq!(summary.compiled.len(), 1);

  let dir = fx.manager.layout().artifact_dir(&code.key());
  assert!(dir.join("modules").join("strings").join("index.lua").exists());
  assert!(dir.join("manifest.json").exists());
  assert!(dir.join("build.json").exists());
  assert!(dir.join("source.lua").exists());
}

#[tokio::test]
async fn test_missing_code_dependency_becomes_stub() {
  let fx = fixture();
  let code = CodeArtifact {
    source_code: SourceCode {
      code: "return 1".to_string(),
      manifest: r#"{"dependencies": {"missing": "^1.0.0"}}"#.to_string(),
    },
    ..artifact(FlowVersionState::Draft, "")
  };

  let summary = fx.manager.prepare(&[], &[code.clone()]).await.unwrap();
  assert_eq!(summary.stubbed, vec![code.key()]);
}

#[tokio::test]
async fn test_piece_install_is_idempotent() {
  let fx = fixture();
  let piece = PiecePackage::pinned("@flowbox/piece-math", "1.0.0");

  let first = fx.manager.prepare(&[piece.clone()], &[]).await.unwrap();
  let second = fx.manager.prepare(&[piece.clone()], &[]).await.unwrap();

  assert_eq!(first.installed, vec![piece.clone()]);
  assert_eq!(second.already_present, vec![piece.clone()]);
  assert!(second.installed.is_empty());

  let root = fx.sandbox_dir.path();
  let manifest = std::fs::read_to_string(root.join("sandbox.json")).unwrap();
  assert!(manifest.contains("@flowbox/piece-math"));
  let installed = fx.manager.layout().piece_dir(&piece).join("index.lua");
  assert!(installed.exists());
  assert_eq!(
    std::fs::read_to_string(root.join("engine").join("main.lua")).unwrap(),
    ENGINE_RUNTIME
  );

  // No staging directories are left behind.
  let leftovers = std::fs::read_dir(root.join("pieces"))
    .unwrap()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_name().to_string_lossy().starts_with(".staging"))
    .count();
  assert_eq!(leftovers, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_draft_rebuild_never_hides_the_module() {
  let fx = fixture();
  let code = artifact(FlowVersionState::Draft, "return 1");
  fx.manager.prepare(&[], &[code.clone()]).await.unwrap();

  let index = fx.manager.layout().artifact_index(&code.key());
  let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
  let reader = {
    let done = done.clone();
    std::thread::spawn(move || {
      let mut reads = 0;
      while !done.load(std::sync::atomic::Ordering::Relaxed) {
        let module = std::fs::read_to_string(&index).expect("index.lua disappeared");
        assert!(module.ends_with("end\n"), "partial module: {:?}", module);
        reads += 1;
      }
      reads
    })
  };

  for i in 0..20 {
    let code = artifact(FlowVersionState::Draft, &format!("return {}", i));
    fx.manager.prepare(&[], &[code]).await.unwrap();
  }
  done.store(true, std::sync::atomic::Ordering::Relaxed);
  assert!(reader.join().unwrap() > 0);
}

#[tokio::test]
async fn test_similar_step_names_compile_to_separate_modules() {
  let fx = fixture();
  let slash = CodeArtifact {
    name: "a/b".to_string(),
    ..artifact(FlowVersionState::Draft, "return 'A'")
  };
  let underscore = CodeArtifact {
    name: "a_b".to_string(),
    ..artifact(FlowVersionState::Draft, "return 'B'")
  };

  let summary = fx
    .manager
    .prepare(&[], &[slash.clone(), underscore.clone()])
    .await
    .unwrap();
  assert_eq!(summary.compiled.len(), 2);

  let layout = fx.manager.layout();
  let slash_index = layout.artifact_index(&slash.key());
  let underscore_index = layout.artifact_index(&underscore.key());
  assert_ne!(slash_index, underscore_index);
  assert!(std::fs::read_to_string(slash_index).unwrap().contains("return 'A'"));
  assert!(std::fs::read_to_string(underscore_index).unwrap().contains("return 'B'"));
}

#[tokio::test]
async fn test_unpinned_piece_is_rejected() {
  let fx = fixture();
  let result = fx
    .manager
    .prepare(&[PiecePackage::new("@flowbox/piece-math", "^1.0.0")], &[])
    .await;
  assert!(matches!(result, Err(SandboxError::UnpinnedPiece(_))));
}

#[tokio::test]
async fn test_installer_failure_releases_lock() {
  let fx = fixture();
  let result = fx
    .manager
    .prepare(&[PiecePackage::pinned("piece-missing", "1.0.0")], &[])
    .await;
  assert!(result.is_err());

  let guard = tokio::time::timeout(Duration::from_secs(1), fx.manager.lock()).await;
  assert!(guard.is_ok(), "lock was not released after a failed prepare");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_held_lock_blocks_prepare() {
  let fx = fixture();
  let guard = fx.manager.lock().await;

  let manager = fx.manager.clone();
  let mut prepare = tokio::spawn(async move { manager.prepare(&[], &[]).await });

  let blocked = tokio::time::timeout(Duration::from_millis(200), &mut prepare).await;
  assert!(blocked.is_err(), "prepare ran while the lock was held");

  drop(guard);
  let summary = tokio::time::timeout(Duration::from_secs(5), prepare)
    .await
    .unwrap()
    .unwrap()
    .unwrap();
  assert!(summary.compiled.is_empty());
}
