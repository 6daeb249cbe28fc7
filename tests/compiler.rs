//! Stage Compiler Integration Tests
//!
//! Tests for compiling stage documents into ordered steps: declaration
//! kinds, requisite edges, includes, sub-step rendering, the render cache
//! and compile errors.

mod common;

use std::sync::Arc;

use stagetrack::core::{CompileError, CompileOptions, ReferenceProblem, RenderCache, StageCompiler};
use stagetrack::domain::{DeclarationKind, StepKind, SubStepCall};

use common::MockRenderer;

const DEPLOY: &str = r#"
ready:
  salt.runner:
    - name: ready.check
    - cluster: ceph

monitors:
  salt.state:
    - tgt: 'mon*'
    - sls: ceph.mon
    - require:
      - salt: ready

cleanup:
  salt.function:
    - name: cmd.run
    - tgt: 'mon*'
    - arg:
      - rm -rf /tmp/ceph
    - onfail:
      - salt: monitors

sync:
  orchestrate-function:
    - name: saltutil.sync_all
"#;

const CEPH_MON: &str = r#"
install mon:
  pkg.installed:
    - pkgs:
      - ceph
      - ceph-mon
start mon:
  service.running:
    - name: ceph-mon
    - fire_event: false
"#;

fn compiler(renderer: MockRenderer) -> (StageCompiler, Arc<MockRenderer>) {
    let renderer = Arc::new(renderer);
    let compiler = StageCompiler::new(renderer.clone(), Arc::new(RenderCache::new()));
    (compiler, renderer)
}

fn deploy_renderer() -> MockRenderer {
    MockRenderer::new()
        .with_stage("ceph.deploy", DEPLOY)
        .with_state("ceph.mon", CEPH_MON)
}

#[tokio::test]
async fn test_compile_orders_and_kinds() {
    let (compiler, _) = compiler(deploy_renderer());
    let compiled = compiler
        .compile_stage("ceph.deploy", CompileOptions::default())
        .await
        .unwrap();
    let stage = &compiled.stage;

    assert_eq!(stage.name, "ceph.deploy");
    assert_eq!(stage.total_steps(), 4);
    assert_eq!(compiled.output, "rendered ceph.deploy");

    let orders: Vec<usize> = stage.steps.iter().map(|s| s.order()).collect();
    assert_eq!(orders, vec![1, 2, 3, 4]);

    let ready = &stage.steps[0];
    assert_eq!(ready.declared_as, DeclarationKind::Runner);
    assert_eq!(ready.match_name(), "ready.check");
    assert!(!ready.is_targeted());

    let monitors = &stage.steps[1];
    assert_eq!(monitors.declared_as, DeclarationKind::State);
    assert_eq!(monitors.match_name(), "ceph.mon");
    assert_eq!(monitors.target_selector(), Some("mon*"));

    let cleanup = &stage.steps[2];
    assert_eq!(cleanup.declared_as, DeclarationKind::Function);
    assert_eq!(cleanup.match_name(), "cmd.run");
    assert!(cleanup.is_targeted());

    // A function without a target runs on the master
    let sync = &stage.steps[3];
    assert_eq!(sync.declared_as, DeclarationKind::Function);
    assert!(matches!(sync.kind, StepKind::Runner(_)));
    assert_eq!(sync.match_name(), "saltutil.sync_all");
}

#[tokio::test]
async fn test_dependencies_point_at_earlier_steps() {
    let (compiler, _) = compiler(deploy_renderer());
    let stage = compiler
        .compile_stage("ceph.deploy", CompileOptions::default())
        .await
        .unwrap()
        .stage;

    let monitors = &stage.steps[1];
    assert_eq!(monitors.on_success_deps.len(), 1);
    assert!(Arc::ptr_eq(&monitors.on_success_deps[0], &stage.steps[0]));
    assert_eq!(monitors.success_dep_orders(), vec![1]);

    let cleanup = &stage.steps[2];
    assert!(cleanup.on_success_deps.is_empty());
    assert!(Arc::ptr_eq(&cleanup.on_failure_deps[0], &stage.steps[1]));
    assert_eq!(cleanup.failure_dep_orders(), vec![2]);

    for step in &stage.steps {
        for dep in step.on_success_deps.iter().chain(&step.on_failure_deps) {
            assert!(dep.order() < step.order());
        }
    }
}

#[tokio::test]
async fn test_require_by_description_and_name() {
    let stage_yaml = r#"
A:
  salt.runner:
    - name: a.run
B:
  salt.runner:
    - name: b.run
    - require:
      - A
C:
  salt.runner:
    - name: c.run
    - require: b.run
"#;
    let (compiler, _) = compiler(MockRenderer::new().with_stage("ab", stage_yaml));
    let stage = compiler
        .compile_stage("ab", CompileOptions::default())
        .await
        .unwrap()
        .stage;

    assert_eq!(stage.steps[1].success_dep_orders(), vec![1]);
    // A non-list requisite value is a one-element list
    assert_eq!(stage.steps[2].success_dep_orders(), vec![2]);
}

#[tokio::test]
async fn test_sub_steps_rendered_per_state() {
    let (compiler, renderer) = compiler(deploy_renderer());
    let stage = compiler
        .compile_stage("ceph.deploy", CompileOptions::default())
        .await
        .unwrap()
        .stage;

    let sub_steps = stage.steps[1].sub_steps();
    assert_eq!(sub_steps.len(), 2);
    assert_eq!(sub_steps[0].function, "pkg.installed");
    assert_eq!(sub_steps[0].call, SubStepCall::ExecutionCall);
    assert!(sub_steps[0].visible);
    assert_eq!(sub_steps[1].call, SubStepCall::StateCall);
    assert_eq!(sub_steps[1].match_name(), "ceph-mon");
    assert!(!sub_steps[1].visible);

    // Function steps are opaque
    assert!(stage.steps[2].sub_steps().is_empty());
    assert_eq!(renderer.state_renders(), 1);
}

#[tokio::test]
async fn test_only_visible_steps() {
    let (compiler, _) = compiler(deploy_renderer());
    let options = CompileOptions {
        hide_state_steps: false,
        only_visible_steps: true,
    };
    let stage = compiler.compile_stage("ceph.deploy", options).await.unwrap().stage;

    let sub_steps = stage.steps[1].sub_steps();
    assert_eq!(sub_steps.len(), 1);
    assert_eq!(sub_steps[0].description, "install mon");
}

#[tokio::test]
async fn test_hide_state_steps_keeps_structure() {
    let (full_compiler, _) = compiler(deploy_renderer());
    let full = full_compiler
        .compile_stage("ceph.deploy", CompileOptions::default())
        .await
        .unwrap()
        .stage;

    let (hidden_compiler, renderer) = compiler(deploy_renderer());
    let options = CompileOptions {
        hide_state_steps: true,
        only_visible_steps: false,
    };
    let hidden = hidden_compiler
        .compile_stage("ceph.deploy", options)
        .await
        .unwrap()
        .stage;

    assert_eq!(renderer.state_renders(), 0);
    assert_eq!(hidden.total_steps(), full.total_steps());
    for (h, f) in hidden.steps.iter().zip(&full.steps) {
        assert_eq!(h.description, f.description);
        assert_eq!(h.match_name(), f.match_name());
        assert_eq!(h.success_dep_orders(), f.success_dep_orders());
        assert_eq!(h.failure_dep_orders(), f.failure_dep_orders());
        assert!(h.sub_steps().is_empty());
    }
}

#[tokio::test]
async fn test_multiple_states_in_one_step() {
    let stage_yaml = r#"
storage:
  salt.state:
    - tgt: 'osd*'
    - sls: ceph.osd, ceph.mgr
"#;
    let renderer = MockRenderer::new()
        .with_stage("storage", stage_yaml)
        .with_state("ceph.osd", "deploy osds:\n  module.run:\n    - name: osd.deploy\n")
        .with_state("ceph.mgr", "mgr pkg:\n  pkg.installed:\n    - name: ceph-mgr\n");
    let (compiler, renderer) = compiler(renderer);

    let stage = compiler
        .compile_stage("storage", CompileOptions::default())
        .await
        .unwrap()
        .stage;

    let sub_steps = stage.steps[0].sub_steps();
    assert_eq!(sub_steps.len(), 2);
    assert_eq!(sub_steps[0].call, SubStepCall::ExecutionCall);
    assert_eq!(sub_steps[0].function, "osd.deploy");
    assert_eq!(sub_steps[1].pretty(), "pkg.installed(ceph-mgr)");
    assert_eq!(renderer.state_renders(), 2);
}

#[tokio::test]
async fn test_includes_spliced_in_place() {
    let parent = r#"
first:
  salt.runner:
    - name: first.run
include:
  - .prep
last:
  salt.runner:
    - name: last.run
    - require:
      - prepare
"#;
    let prep = "prepare:\n  salt.runner:\n    - name: prep.run\n";
    let renderer = MockRenderer::new()
        .with_package("ceph.stage.0")
        .with_stage("ceph.stage.0", parent)
        .with_stage("ceph.stage.0.prep", prep);
    let (compiler, renderer) = compiler(renderer);

    let compiled = compiler
        .compile_stage("ceph.stage.0", CompileOptions::default())
        .await
        .unwrap();

    let names: Vec<&str> = compiled.stage.steps.iter().map(|s| s.match_name()).collect();
    assert_eq!(names, vec!["first.run", "prep.run", "last.run"]);
    assert_eq!(compiled.stage.steps[2].success_dep_orders(), vec![2]);
    assert_eq!(
        compiled.output,
        "rendered ceph.stage.0\nrendered ceph.stage.0.prep"
    );
    assert_eq!(renderer.stage_renders(), 2);
}

#[tokio::test]
async fn test_include_cycle_rejected() {
    let renderer = MockRenderer::new()
        .with_stage("a", "include:\n  - b\n")
        .with_stage("b", "include:\n  - a\n");
    let (compiler, _) = compiler(renderer);

    let err = compiler
        .compile_stage("a", CompileOptions::default())
        .await
        .unwrap_err();

    match err {
        CompileError::StageRender { stage_name, errors } => {
            assert_eq!(stage_name, "a");
            assert_eq!(errors, vec!["include cycle: a -> b -> a".to_string()]);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_render_cache_reused() {
    let stage_yaml = r#"
first:
  salt.state:
    - tgt: 'mon*'
    - sls: ceph.mon
again:
  salt.state:
    - tgt: 'mon*'
    - sls: ceph.mon
"#;
    let renderer = MockRenderer::new()
        .with_stage("twice", stage_yaml)
        .with_state("ceph.mon", CEPH_MON);
    let (compiler, renderer) = compiler(renderer);

    compiler
        .compile_stage("twice", CompileOptions::default())
        .await
        .unwrap();
    assert_eq!(renderer.stage_renders(), 1);
    assert_eq!(renderer.state_renders(), 1);

    compiler
        .compile_stage("twice", CompileOptions::default())
        .await
        .unwrap();
    assert_eq!(renderer.stage_renders(), 1);
    assert_eq!(renderer.state_renders(), 1);

    assert_eq!(compiler.cache().invalidate("twice"), 1);
    compiler
        .compile_stage("twice", CompileOptions::default())
        .await
        .unwrap();
    assert_eq!(renderer.stage_renders(), 2);
    assert_eq!(renderer.state_renders(), 1);
}

#[tokio::test]
async fn test_missing_stage_is_render_error() {
    let (compiler, _) = compiler(MockRenderer::new());

    let err = compiler
        .compile_stage("ceph.stage.9", CompileOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, CompileError::StageRender { .. }));
    assert_eq!(
        err.messages(),
        vec!["could not determine path for ceph.stage.9".to_string()]
    );
}

#[tokio::test]
async fn test_stage_render_errors_reported() {
    let renderer = MockRenderer::new().with_failing_stage("broken", &["Jinja error: x", "line 3"]);
    let (compiler, _) = compiler(renderer);

    let err = compiler
        .compile_stage("broken", CompileOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.messages(), vec!["Jinja error: x", "line 3"]);
}

#[tokio::test]
async fn test_state_render_error_names_node() {
    let renderer = MockRenderer::new()
        .with_stage("ceph.deploy", DEPLOY)
        .with_failing_state("ceph.mon", "mon2", &["Rendering SLS failed"]);
    let (compiler, _) = compiler(renderer);

    let err = compiler
        .compile_stage("ceph.deploy", CompileOptions::default())
        .await
        .unwrap_err();

    match err {
        CompileError::StateRender { node, state, errors } => {
            assert_eq!(node, "mon2");
            assert_eq!(state, "ceph.mon");
            assert_eq!(errors, vec!["Rendering SLS failed".to_string()]);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_forward_and_missing_references() {
    let forward = r#"
B:
  salt.runner:
    - name: b.run
    - require:
      - A
A:
  salt.runner:
    - name: a.run
"#;
    let missing = r#"
B:
  salt.runner:
    - name: b.run
    - onfail:
      - salt: nowhere
"#;
    let renderer = MockRenderer::new()
        .with_stage("forward", forward)
        .with_stage("missing", missing);
    let (compiler, _) = compiler(renderer);

    match compiler.compile_stage("forward", CompileOptions::default()).await {
        Err(CompileError::UnknownReference {
            step,
            directive,
            problem,
            ..
        }) => {
            assert_eq!(step, "B");
            assert_eq!(directive, "require");
            assert_eq!(problem, ReferenceProblem::DeclaredLater);
        }
        other => panic!("unexpected result: {:?}", other.map(|c| c.stage.name)),
    }

    match compiler.compile_stage("missing", CompileOptions::default()).await {
        Err(CompileError::UnknownReference {
            directive,
            reference,
            problem,
            ..
        }) => {
            assert_eq!(directive, "onfail");
            assert_eq!(reference, "salt: nowhere");
            assert_eq!(problem, ReferenceProblem::Missing);
        }
        other => panic!("unexpected result: {:?}", other.map(|c| c.stage.name)),
    }
}

#[tokio::test]
async fn test_invalid_declarations() {
    let no_target = "mons:\n  salt.state:\n    - sls: ceph.mon\n";
    let unknown = "mons:\n  file.managed:\n    - name: /etc/x\n";
    let renderer = MockRenderer::new()
        .with_stage("no_target", no_target)
        .with_stage("unknown", unknown);
    let (compiler, _) = compiler(renderer);

    for stage in ["no_target", "unknown"] {
        let err = compiler
            .compile_stage(stage, CompileOptions::default())
            .await
            .unwrap_err();
        assert!(
            matches!(err, CompileError::InvalidDeclaration { ref description, .. } if description == "mons"),
            "{}: {:?}",
            stage,
            err
        );
    }
}
