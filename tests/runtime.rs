use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use ssr_bridge::{
    CancellationToken, ModuleKind, ModuleRef, OutputViolation, PagePayload, SsrConfig, SsrError,
    SsrRuntime,
};

fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn fixture(relative: &str) -> ModuleRef {
    ModuleRef::from_path(fixtures().join(relative))
}

fn config() -> SsrConfig {
    SsrConfig::new(fixtures().join("commonjs/ssr.js")).with_root_dir(fixtures())
}

fn runtime() -> SsrRuntime {
    SsrRuntime::new(&config()).unwrap()
}

fn page(props: Value) -> PagePayload {
    let props = match props {
        Value::Object(map) => map,
        _ => panic!("props must be an object"),
    };
    PagePayload::new("X", "/x").unwrap().with_props(props)
}

async fn render(runtime: &mut SsrRuntime, module: &str, props: Value) -> Result<ssr_bridge::RenderResult, SsrError> {
    runtime.render_module(&fixture(module), &page(props), None).await
}

#[tokio::test]
async fn test_commonjs_without_content() {
    let mut runtime = runtime();
    let result = render(&mut runtime, "commonjs/ssr.js", json!({})).await.unwrap();

    assert_eq!(
        result.head,
        vec![
            "<title>New title</title>".to_string(),
            "<meta name=\"description\" content=\"Head stuff\" />".to_string(),
        ]
    );
    assert_eq!(result.body, "<div id=\"ssr\"></div>");
}

#[tokio::test]
async fn test_commonjs_interpolates_content() {
    let mut runtime = runtime();
    let result = render(&mut runtime, "commonjs/ssr.js", json!({"content": "Hello"}))
        .await
        .unwrap();

    assert_eq!(result.body, "<div id=\"ssr\">Hello</div>");
}

#[tokio::test]
async fn test_esm_detected_from_package_json() {
    let mut runtime = runtime();
    let handle = runtime.load(&fixture("esm/ssr.js")).await.unwrap();
    assert_eq!(handle.kind(), ModuleKind::EsModule);

    let result = runtime
        .render(&handle, &page(json!({"content": "Hello"})))
        .await
        .unwrap();
    assert_eq!(
        result.head,
        vec![
            "<title inertia>New title from ESM</title>".to_string(),
            "<meta name=\"description\" content=\"Head stuff\" />".to_string(),
        ]
    );
    assert_eq!(result.body, "<div id=\"ssr\">Hello</div>");
}

#[tokio::test]
async fn test_convention_does_not_change_output() {
    let mut runtime = runtime();

    for props in [json!({}), json!({"content": "Hello"})] {
        let commonjs = render(&mut runtime, "commonjs/ssr.js", props.clone()).await.unwrap();
        let esm = render(&mut runtime, "esm/mirror.mjs", props).await.unwrap();
        assert_eq!(commonjs, esm);
    }
}

#[tokio::test]
async fn test_repeated_invocation_is_idempotent() {
    let mut runtime = runtime();
    let handle = runtime.load(&fixture("commonjs/ssr.js")).await.unwrap();
    let payload = page(json!({"content": "Hello"}));

    let first = runtime.render(&handle, &payload).await.unwrap();
    let second = runtime.render(&handle, &payload).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_module_initializes_once() {
    let mut runtime = runtime();

    let first = runtime.load(&fixture("esm/counter.mjs")).await.unwrap();
    let second = runtime.load(&fixture("esm/counter.mjs")).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(runtime.loaded_modules(), 1);

    for _ in 0..2 {
        let result = runtime.render(&first, &page(json!({}))).await.unwrap();
        assert_eq!(result.body, "<div data-inits=\"1\">/x</div>");
    }
}

#[tokio::test]
async fn test_render_mutation_does_not_leak() {
    let mut runtime = runtime();
    let handle = runtime.load(&fixture("esm/mutating.mjs")).await.unwrap();
    let payload = page(json!({}));

    for _ in 0..3 {
        let result = runtime.render(&handle, &payload).await.unwrap();
        assert_eq!(result.body, "<div>1</div>");
    }
    assert!(payload.props().is_empty());
}

#[tokio::test]
async fn test_missing_head_is_rejected() {
    let mut runtime = runtime();
    let err = render(&mut runtime, "contract/missing_head.cjs", json!({}))
        .await
        .unwrap_err();

    match err {
        SsrError::InvalidRenderOutput { page, violation } => {
            assert_eq!(violation, OutputViolation::MissingHead);
            assert_eq!(page.component, "X");
            assert_eq!(page.url, "/x");
        }
        other => panic!("expected InvalidRenderOutput, got {other:?}"),
    }
}

#[tokio::test]
async fn test_null_body_is_rejected() {
    let mut runtime = runtime();
    let err = render(&mut runtime, "contract/null_body.cjs", json!({}))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SsrError::InvalidRenderOutput {
            violation: OutputViolation::BodyNotString { found: "null" },
            ..
        }
    ));
}

#[tokio::test]
async fn test_cyclic_result_is_unserializable() {
    let mut runtime = runtime();
    let err = render(&mut runtime, "contract/cyclic.cjs", json!({}))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SsrError::InvalidRenderOutput {
            violation: OutputViolation::Unserializable { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn test_throwing_render() {
    let mut runtime = runtime();
    let err = render(&mut runtime, "contract/throws.cjs", json!({}))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "render_threw");
    assert_eq!(err.page().map(|p| p.url.as_str()), Some("/x"));
    match err {
        SsrError::RenderThrew { message, stack, .. } => {
            assert!(message.contains("TypeError: cannot render X"), "{message}");
            let stack = stack.unwrap();
            assert!(stack.contains("throws.cjs:3"), "{stack}");
        }
        other => panic!("expected RenderThrew, got {other:?}"),
    }
}

#[tokio::test]
async fn test_module_without_render_export() {
    let mut runtime = runtime();

    let err = runtime.load(&fixture("contract/no_render.mjs")).await.unwrap_err();
    assert_eq!(err.code(), "invalid_module_shape");

    let err = runtime.load(&fixture("contract/not_callable.cjs")).await.unwrap_err();
    assert_eq!(err.code(), "invalid_module_shape");
    assert!(err.to_string().contains("found string"), "{err}");
}

#[tokio::test]
async fn test_module_init_failures() {
    let mut runtime = runtime();

    let err = runtime.load(&fixture("contract/init_throws.mjs")).await.unwrap_err();
    assert_eq!(err.code(), "module_load_failed");
    assert!(err.to_string().contains("broken at import time"), "{err}");

    let err = runtime.load(&fixture("contract/uses_require.cjs")).await.unwrap_err();
    assert_eq!(err.code(), "module_load_failed");
    assert!(err.to_string().contains("require(\"react\")"), "{err}");
}

#[tokio::test]
async fn test_nonexistent_module() {
    let mut runtime = runtime();
    let err = runtime.load(&fixture("commonjs/missing.js")).await.unwrap_err();

    assert!(matches!(err, SsrError::ModuleNotFound { .. }), "{err:?}");
}

#[tokio::test]
async fn test_module_outside_root() {
    let outside = tempfile::tempdir().unwrap();
    let path = outside.path().join("ssr.cjs");
    std::fs::write(&path, "module.exports = { render: () => ({ head: [], body: '' }) };").unwrap();

    let mut runtime = runtime();
    let err = runtime.load(&ModuleRef::from_path(&path)).await.unwrap_err();
    assert_eq!(err.code(), "module_not_found");
    assert!(err.to_string().contains("sandbox root"), "{err}");
}

#[tokio::test]
async fn test_explicit_kind_overrides_detection() {
    let mut detected = runtime();
    let err = detected.load(&fixture("contract/plain_esm.js")).await.unwrap_err();
    assert_eq!(err.code(), "module_load_failed");

    let mut explicit = runtime();
    let reference = fixture("contract/plain_esm.js").with_kind(ModuleKind::EsModule);
    let result = explicit
        .render_module(&reference, &page(json!({})), None)
        .await
        .unwrap();
    assert_eq!(result.body, "<main>X</main>");
}

#[tokio::test]
async fn test_async_render_resolves() {
    let mut runtime = runtime();
    let result = render(&mut runtime, "async/ssr.mjs", json!({"content": "later"}))
        .await
        .unwrap();

    assert_eq!(result.head, vec!["<title>X</title>".to_string()]);
    assert_eq!(result.body, "<div id=\"app\">later</div>");
}

#[tokio::test]
async fn test_async_rejection() {
    let mut runtime = runtime();
    let err = render(&mut runtime, "async/rejects.mjs", json!({}))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "render_threw");
    assert!(err.to_string().contains("data fetch failed"), "{err}");
}

#[tokio::test]
async fn test_never_settling_render() {
    let mut runtime = runtime();
    let err = render(&mut runtime, "async/never.mjs", json!({}))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SsrError::InvalidRenderOutput {
            violation: OutputViolation::NeverSettled,
            ..
        }
    ));
    assert!(!runtime.is_poisoned());
}

#[tokio::test]
async fn test_busy_loop_times_out_and_poisons() {
    let config = config().with_timeout(Some(Duration::from_millis(200)));
    let mut runtime = SsrRuntime::new(&config).unwrap();
    let handle = runtime.load(&fixture("async/slow.mjs")).await.unwrap();

    let started = Instant::now();
    let err = runtime
        .render(&handle, &page(json!({"spin": true})))
        .await
        .unwrap_err();

    assert!(matches!(err, SsrError::RenderTimedOut { timeout_ms: 200, .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(runtime.is_poisoned());

    let err = runtime.render(&handle, &page(json!({}))).await.unwrap_err();
    assert!(matches!(err, SsrError::RuntimePoisoned));
}

#[tokio::test]
async fn test_pending_timer_times_out() {
    let config = config().with_timeout(Some(Duration::from_millis(200)));
    let mut runtime = SsrRuntime::new(&config).unwrap();

    let started = Instant::now();
    let err = render(&mut runtime, "async/slow.mjs", json!({"delay": 10_000}))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "render_timed_out");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cancellation() {
    let mut runtime = runtime();
    let handle = runtime.load(&fixture("async/slow.mjs")).await.unwrap();

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let err = runtime
        .render_with_cancel(&handle, &page(json!({})), &cancelled)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "render_cancelled");
    assert!(!runtime.is_poisoned());

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = runtime
        .render_with_cancel(&handle, &page(json!({"delay": 10_000})), &token)
        .await
        .unwrap_err();
    assert!(matches!(err, SsrError::RenderCancelled { .. }), "{err:?}");
    assert!(runtime.is_poisoned());
}

#[tokio::test]
async fn test_web_globals() {
    let mut runtime = runtime();
    let result = render(&mut runtime, "async/globals.cjs", json!({})).await.unwrap();

    let body: Value = serde_json::from_str(&result.body).unwrap();
    assert_eq!(
        body,
        json!({"encoded": "aGk=", "decoded": "hi", "uuidLength": 36, "bytes": 4})
    );
}

#[tokio::test]
async fn test_handle_from_other_runtime_is_stale() {
    let mut first = runtime();
    let handle = first.load(&fixture("commonjs/ssr.js")).await.unwrap();

    let mut second = runtime();
    let err = second.render(&handle, &page(json!({}))).await.unwrap_err();
    assert!(matches!(err, SsrError::StaleHandle));
}

#[tokio::test]
async fn test_page_reaches_render_unmodified() {
    let mut runtime = runtime();
    let page = page(json!({"__proto__": {"weird": true}, "a": 1}))
        .with_version("abc123")
        .with_history_flags(true, false);

    let result = runtime
        .render_module(&fixture("esm/echo.mjs"), &page, None)
        .await
        .unwrap();

    assert_eq!(result.body, r#"{"__proto__":{"weird":true},"a":1}|__proto__,a"#);
    assert_eq!(
        result.head,
        vec![
            "version:abc123".to_string(),
            "encrypt:true".to_string(),
            "clear:undefined".to_string(),
            "plainProto:true".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_values_coercible_to_strings_are_rejected() {
    let cases = [
        (
            "contract/date_body.cjs",
            OutputViolation::BodyNotString { found: "object" },
        ),
        (
            "contract/to_json_head.cjs",
            OutputViolation::HeadEntryNotString {
                index: 1,
                found: "object",
            },
        ),
        (
            "contract/boxed_string.cjs",
            OutputViolation::HeadEntryNotString {
                index: 0,
                found: "object",
            },
        ),
    ];

    let mut runtime = runtime();
    for (module, expected) in cases {
        let err = render(&mut runtime, module, json!({})).await.unwrap_err();
        match err {
            SsrError::InvalidRenderOutput { violation, .. } => {
                assert_eq!(violation, expected, "{module}")
            }
            other => panic!("{module}: expected InvalidRenderOutput, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_heap_limit_terminates_render() {
    let config = config().with_max_heap_size(Some(32 * 1024 * 1024));
    let mut runtime = SsrRuntime::new(&config).unwrap();

    let fine = render(&mut runtime, "contract/hog.mjs", json!({})).await.unwrap();
    assert_eq!(fine.body, "<p>fine</p>");

    let err = render(&mut runtime, "contract/hog.mjs", json!({"hog": true}))
        .await
        .unwrap_err();
    assert!(
        matches!(err, SsrError::RenderOutOfMemory { limit_bytes, .. } if limit_bytes == 32 * 1024 * 1024),
        "{err:?}"
    );
    assert_eq!(err.code(), "render_out_of_memory");
    assert!(runtime.is_poisoned());
}

#[tokio::test]
async fn test_commonjs_runs_in_sloppy_mode() {
    let mut runtime = runtime();
    let result = render(&mut runtime, "commonjs/sloppy.js", json!({})).await.unwrap();
    assert_eq!(result.body, "<p>42</p>");
}

#[tokio::test]
async fn test_cancellation_interrupts_module_load() {
    let mut runtime = runtime();
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = runtime
        .render_module(&fixture("async/slow_init.mjs"), &page(json!({})), Some(&token))
        .await
        .unwrap_err();

    assert!(matches!(err, SsrError::RenderCancelled { .. }), "{err:?}");
    assert_eq!(err.page().map(|p| p.url.as_str()), Some("/x"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(runtime.is_poisoned());
}
