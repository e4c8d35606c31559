//! 模块生命周期集成测试
//!
//! 测试模块从安装到卸载的完整流程，包括：
//! - 基于文件清单的安装与更新
//! - `Require-Module` 依赖解析
//! - 激活钩子注册服务与监听器，以及失败时的清理
//! - 随机操作序列下的状态机完备性

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chips_registry::{
    CoreError, Event, EventCallback, FnActivator, FrameworkConfig, FrameworkEventKind, ListenerKind,
    ManifestLoader,
    ModuleContext, ModuleEventKind, ModuleHandle, ModuleState, PropertyMap, Registry,
    ServiceObject, ServiceSource, StartOptions, StopOptions,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use tempfile::TempDir;

// ============================================================================
// 测试辅助
// ============================================================================

fn sync_config() -> FrameworkConfig {
    FrameworkConfig::builder().without_async_events().build()
}

fn registry_with(loader: ManifestLoader) -> Registry {
    Registry::builder()
        .config(sync_config())
        .loader(Arc::new(loader))
        .build()
        .unwrap()
}

fn install(registry: &Registry, location: &str, manifest: &str) -> ModuleHandle {
    let mut reader = Cursor::new(manifest.to_string());
    registry.install(location, Some(&mut reader)).unwrap()
}

/// 激活时注册一个服务并添加一个服务监听器的钩子
fn publishing_loader(fail: bool) -> ManifestLoader {
    ManifestLoader::new().with_activator("publisher", move || {
        Arc::new(FnActivator::new(
            move |ctx: &ModuleContext| {
                let object = ServiceObject::new(String::from("greeting"), ["com.acme.Greeter"]);
                ctx.register_service(
                    &["com.acme.Greeter"],
                    ServiceSource::singleton(object),
                    PropertyMap::new().with("lang", "en")?,
                )?;
                let callback: EventCallback = Arc::new(|_: &Event| {});
                ctx.add_listener(ListenerKind::Service, Some("(lang=*)"), callback)?;
                if fail {
                    anyhow::bail!("activation refused");
                }
                Ok(())
            },
            |_: &ModuleContext| Ok(()),
        ))
    })
}

// ============================================================================
// 安装
// ============================================================================

#[test]
fn test_install_twice_emits_single_event() {
    let registry = registry_with(ManifestLoader::new());
    let installed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&installed);
    let callback: EventCallback = Arc::new(move |event: &Event| {
        if event.as_module().map(|e| e.kind) == Some(ModuleEventKind::Installed) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    registry
        .add_listener(&registry.system_module(), ListenerKind::SynchronousModule, None, callback)
        .unwrap();

    let first = install(&registry, "mem:a", "Module-SymbolicName: com.acme.a\n");
    let second = install(&registry, "mem:a", "Module-SymbolicName: com.acme.a\n");

    assert_eq!(first.id(), second.id());
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(installed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_install_from_file_and_update_rereads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hello.yaml");
    std::fs::write(&path, "Module-SymbolicName: com.acme.hello\nModule-Version: 1.0.0\n").unwrap();
    let location = format!("file:{}", path.display());

    let registry = registry_with(ManifestLoader::new());
    let module = registry.install(&location, None).unwrap();
    assert_eq!(module.version().to_string(), "1.0.0");
    let installed_at = module.last_modified();

    std::fs::write(&path, "Module-SymbolicName: com.acme.hello\nModule-Version: 1.1.0\n").unwrap();
    registry.update(&module, None).unwrap();
    assert_eq!(module.version().to_string(), "1.1.0");
    assert_eq!(module.state(), ModuleState::Installed);
    assert!(module.last_modified() >= installed_at);
    assert_eq!(module.location(), location);
}

#[test]
fn test_install_missing_file_is_content_error() {
    let registry = registry_with(ManifestLoader::new());
    let err = registry.install("file:/nonexistent/module.yaml", None).unwrap_err();
    assert!(matches!(err, CoreError::ContentRead { .. }));
    assert!(registry.modules().is_empty());
}

#[test]
fn test_duplicates_allowed_by_config() {
    let registry = Registry::builder()
        .config(
            FrameworkConfig::builder()
                .without_async_events()
                .allow_duplicate_modules(true)
                .build(),
        )
        .build()
        .unwrap();
    let a = install(&registry, "mem:a", "Module-SymbolicName: x\nModule-Version: 1.0.0\n");
    let b = install(&registry, "mem:b", "Module-SymbolicName: x\nModule-Version: 1.0.0\n");
    assert_ne!(a.id(), b.id());
    assert!(b.id() > a.id());
}

// ============================================================================
// 依赖解析
// ============================================================================

#[test]
fn test_resolution_reports_missing_dependency() {
    let registry = registry_with(ManifestLoader::new());
    let web = install(
        &registry,
        "mem:web",
        "Module-SymbolicName: com.acme.web\nRequire-Module: com.acme.http; version=^1.0\n",
    );

    let err = registry.start(&web, StartOptions::default()).unwrap_err();
    match err {
        CoreError::Resolution { missing, .. } => assert!(missing.contains("com.acme.http")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(web.state(), ModuleState::Installed);

    install(&registry, "mem:http", "Module-SymbolicName: com.acme.http\nModule-Version: 1.4.0\n");
    registry.start(&web, StartOptions::default()).unwrap();
    assert_eq!(web.state(), ModuleState::Active);
}

#[test]
fn test_resolve_is_noop_when_resolved() {
    let registry = registry_with(ManifestLoader::new());
    let module = install(&registry, "mem:r", "Module-SymbolicName: r\n");
    registry.resolve(&module).unwrap();
    assert_eq!(module.state(), ModuleState::Resolved);
    registry.resolve(&module).unwrap();
    assert_eq!(module.state(), ModuleState::Resolved);
}

// ============================================================================
// 启动与停止
// ============================================================================

#[test]
fn test_activator_services_and_listeners_cleaned_on_stop() {
    let registry = registry_with(publishing_loader(false));
    let module = install(&registry, "mem:p", "Module-SymbolicName: p\nModule-Activator: publisher\n");

    registry.start(&module, StartOptions::default()).unwrap();
    assert_eq!(registry.registered_services(&module).len(), 1);
    let reference = registry
        .get_service_reference(Some("com.acme.Greeter"), Some("(lang=en)"))
        .unwrap()
        .unwrap();
    assert_eq!(reference.owner().id(), module.id());

    registry.stop(&module, StopOptions::default()).unwrap();
    assert!(registry.registered_services(&module).is_empty());
    assert!(registry
        .get_service_references(Some("com.acme.Greeter"), None)
        .unwrap()
        .is_empty());
}

#[test]
fn test_activation_failure_leaves_module_resolved_and_clean() {
    let registry = registry_with(publishing_loader(true));
    let module = install(&registry, "mem:p", "Module-SymbolicName: p\nModule-Activator: publisher\n");

    let err = registry.start(&module, StartOptions::default()).unwrap_err();
    assert!(matches!(err, CoreError::Activation { .. }));
    assert!(err.to_string().contains("activation refused"));
    assert_eq!(module.state(), ModuleState::Resolved);
    assert!(registry.registered_services(&module).is_empty());
    assert!(registry
        .get_service_references(Some("com.acme.Greeter"), None)
        .unwrap()
        .is_empty());

    // 监听器已被移除：后续服务事件不会再投递给它
    let before = registry.dispatch_stats();
    let system = registry.system_module();
    let object = ServiceObject::new(String::from("x"), ["com.acme.Greeter"]);
    registry
        .register_service(
            &system,
            &["com.acme.Greeter"],
            ServiceSource::singleton(object),
            PropertyMap::new().with("lang", "fr").unwrap(),
        )
        .unwrap();
    assert_eq!(registry.dispatch_stats().total_dispatched, before.total_dispatched);
}

#[test]
fn test_activation_panic_is_activation_error() {
    let loader = ManifestLoader::new().with_activator("panicky", || {
        Arc::new(FnActivator::new(
            |_: &ModuleContext| panic!("hook exploded"),
            |_: &ModuleContext| Ok(()),
        ))
    });
    let registry = registry_with(loader);
    let module = install(&registry, "mem:x", "Module-SymbolicName: x\nModule-Activator: panicky\n");

    let err = registry.start(&module, StartOptions::default()).unwrap_err();
    assert!(matches!(err, CoreError::Activation { .. }));
    assert!(err.to_string().contains("hook exploded"));
    assert_eq!(module.state(), ModuleState::Resolved);
}

#[test]
fn test_transient_start_keeps_persistent_flag() {
    let registry = registry_with(ManifestLoader::new());
    let module = install(&registry, "mem:t", "Module-SymbolicName: t\n");

    registry.start(&module, StartOptions::transient()).unwrap();
    assert!(!module.is_persistently_started());
    registry.stop(&module, StopOptions::transient()).unwrap();

    registry.start(&module, StartOptions::default()).unwrap();
    registry.stop(&module, StopOptions::transient()).unwrap();
    assert!(module.is_persistently_started());
}

#[test]
fn test_stop_lazy_pending_skips_deactivation() {
    let deactivations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&deactivations);
    let loader = ManifestLoader::new().with_activator("lazy", move || {
        let counter = Arc::clone(&counter);
        Arc::new(FnActivator::new(
            |_: &ModuleContext| Ok(()),
            move |_: &ModuleContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ))
    });
    let registry = registry_with(loader);
    let module = install(
        &registry,
        "mem:l",
        "Module-SymbolicName: l\nModule-Activator: lazy\nModule-ActivationPolicy: lazy\n",
    );

    registry.start(&module, StartOptions::with_activation_policy()).unwrap();
    assert_eq!(module.state(), ModuleState::Starting);
    registry.stop(&module, StopOptions::default()).unwrap();
    assert_eq!(module.state(), ModuleState::Resolved);
    assert!(!module.is_lazy_activation_pending());
    assert_eq!(deactivations.load(Ordering::SeqCst), 0);
}

#[test]
fn test_started_listener_may_reenter_module() {
    let registry = registry_with(ManifestLoader::new());
    let module = install(&registry, "mem:s", "Module-SymbolicName: s\n");

    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let reentrant = registry.clone();
    let callback: EventCallback = Arc::new(move |event: &Event| {
        if let Some(e) = event.as_module() {
            if e.kind == ModuleEventKind::Started {
                // STARTED 在锁外投递，这里可以在其他线程上停止模块
                let registry = reentrant.clone();
                let module = Arc::clone(&e.module);
                let result = std::thread::spawn(move || registry.stop(&module, StopOptions::transient()))
                    .join()
                    .unwrap();
                sink.lock().push(result.is_ok());
            }
        }
    });
    registry
        .add_listener(&registry.system_module(), ListenerKind::SynchronousModule, None, callback)
        .unwrap();

    registry.start(&module, StartOptions::default()).unwrap();
    assert_eq!(*observed.lock(), vec![true]);
    assert_eq!(module.state(), ModuleState::Resolved);
}

#[test]
fn test_update_propagates_deactivation_error() {
    let loader = ManifestLoader::new().with_activator("grumpy", || {
        Arc::new(FnActivator::new(
            |_: &ModuleContext| Ok(()),
            |_: &ModuleContext| anyhow::bail!("cannot stop now"),
        ))
    });
    let registry = registry_with(loader);
    let module = install(&registry, "mem:g", "Module-SymbolicName: g\nModule-Activator: grumpy\n");
    registry.start(&module, StartOptions::default()).unwrap();

    let mut manifest = Cursor::new("Module-SymbolicName: g\nModule-Version: 2.0.0\nModule-Activator: grumpy\n");
    let err = registry.update(&module, Some(&mut manifest)).unwrap_err();
    assert!(matches!(err, CoreError::Deactivation { .. }));
    assert_eq!(module.version().major, 2);
    assert_eq!(module.state(), ModuleState::Active);
}

// ============================================================================
// 框架错误事件
// ============================================================================

/// 带异步事件投递的注册中心，框架事件只走分发线程
fn async_registry_with(loader: ManifestLoader) -> Registry {
    Registry::builder()
        .config(FrameworkConfig::default())
        .loader(Arc::new(loader))
        .build()
        .unwrap()
}

/// 收集框架错误事件 (模块 ID, 消息)
fn framework_errors(registry: &Registry) -> Arc<Mutex<Vec<(Option<u64>, String)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: EventCallback = Arc::new(move |event: &Event| {
        if let Event::Framework(e) = event {
            if e.kind == FrameworkEventKind::Error {
                sink.lock().push((e.module.as_ref().map(|m| m.id()), e.message.clone()));
            }
        }
    });
    registry
        .add_listener(&registry.system_module(), ListenerKind::Framework, None, callback)
        .unwrap();
    seen
}

#[test]
fn test_update_restart_failure_is_reported_not_returned() {
    let starts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&starts);
    let loader = ManifestLoader::new().with_activator("flaky", move || {
        let counter = Arc::clone(&counter);
        Arc::new(FnActivator::new(
            move |_: &ModuleContext| {
                if counter.fetch_add(1, Ordering::SeqCst) > 0 {
                    anyhow::bail!("second start refused");
                }
                Ok(())
            },
            |_: &ModuleContext| Ok(()),
        ))
    });
    let registry = async_registry_with(loader);
    let errors = framework_errors(&registry);
    let module = install(&registry, "mem:f", "Module-SymbolicName: f\nModule-Activator: flaky\n");
    registry.start(&module, StartOptions::default()).unwrap();

    let mut manifest = Cursor::new("Module-SymbolicName: f\nModule-Version: 2.0.0\nModule-Activator: flaky\n");
    registry.update(&module, Some(&mut manifest)).unwrap();
    assert_eq!(module.state(), ModuleState::Resolved);
    assert_eq!(module.version().major, 2);
    assert_eq!(starts.load(Ordering::SeqCst), 2);

    assert!(registry.flush_events(Duration::from_secs(5)));
    {
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, Some(module.id()));
        assert!(errors[0].1.contains("second start refused"));
    }
    registry.shutdown();
}

#[test]
fn test_uninstall_deactivation_failure_is_reported_not_returned() {
    let loader = ManifestLoader::new().with_activator("grumpy", || {
        Arc::new(FnActivator::new(
            |_: &ModuleContext| Ok(()),
            |_: &ModuleContext| anyhow::bail!("cannot stop now"),
        ))
    });
    let registry = async_registry_with(loader);
    let errors = framework_errors(&registry);
    let module = install(&registry, "mem:g", "Module-SymbolicName: g\nModule-Activator: grumpy\n");
    registry.start(&module, StartOptions::default()).unwrap();

    registry.uninstall(&module).unwrap();
    assert_eq!(module.state(), ModuleState::Uninstalled);
    assert!(registry.module_by_location("mem:g").is_none());

    assert!(registry.flush_events(Duration::from_secs(5)));
    {
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, Some(module.id()));
        assert!(errors[0].1.contains("cannot stop now"));
    }
    registry.shutdown();
}

#[test]
fn test_context_can_install_and_start_other_modules() {
    let loader = ManifestLoader::new().with_activator("launcher", || {
        Arc::new(FnActivator::new(
            |ctx: &ModuleContext| {
                let mut manifest = Cursor::new("Module-SymbolicName: com.acme.child\n");
                let child = ctx.install("mem:child", Some(&mut manifest))?;
                ctx.start(&child, StartOptions::default())?;
                Ok(())
            },
            |_: &ModuleContext| Ok(()),
        ))
    });
    let registry = registry_with(loader);
    let parent = install(&registry, "mem:parent", "Module-SymbolicName: p\nModule-Activator: launcher\n");
    registry.start(&parent, StartOptions::default()).unwrap();

    let child = registry.module_by_location("mem:child").unwrap();
    assert_eq!(child.state(), ModuleState::Active);
    assert_eq!(registry.modules().len(), 2);
}

// ============================================================================
// 状态机完备性
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Op {
    Start,
    StartLazy,
    Trigger,
    Stop,
    Update,
    Uninstall,
    Resolve,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Start),
        Just(Op::StartLazy),
        Just(Op::Trigger),
        Just(Op::Stop),
        Just(Op::Update),
        Just(Op::Uninstall),
        Just(Op::Resolve),
    ]
}

/// 转换表：返回期望的新状态与调用是否成功
fn expected(state: ModuleState, op: Op) -> (ModuleState, bool) {
    use ModuleState::*;
    match (op, state) {
        (_, Uninstalled) => (Uninstalled, false),
        (Op::Start, Installed | Resolved | Starting | Active) => (Active, true),
        (Op::StartLazy, Installed | Resolved) => (Starting, true),
        (Op::StartLazy, s) => (s, true),
        (Op::Trigger, Starting | Active) => (Active, true),
        (Op::Trigger, s) => (s, false),
        (Op::Stop, Starting | Active) => (Resolved, true),
        (Op::Stop, s) => (s, true),
        (Op::Update, Active) => (Active, true),
        (Op::Update, Starting) => (Starting, true),
        (Op::Update, _) => (Installed, true),
        (Op::Uninstall, _) => (Uninstalled, true),
        (Op::Resolve, Installed) => (Resolved, true),
        (Op::Resolve, s) => (s, true),
        (_, s) => (s, false),
    }
}

const LAZY_MANIFEST: &str = "Module-SymbolicName: com.acme.prop\nModule-ActivationPolicy: lazy\n";

fn apply(registry: &Registry, module: &ModuleHandle, op: Op) -> bool {
    match op {
        Op::Start => registry.start(module, StartOptions::default()).is_ok(),
        Op::StartLazy => registry
            .start(module, StartOptions::with_activation_policy())
            .is_ok(),
        Op::Trigger => registry.trigger_activation(module).is_ok(),
        Op::Stop => registry.stop(module, StopOptions::default()).is_ok(),
        Op::Update => {
            let mut manifest = Cursor::new(LAZY_MANIFEST);
            registry.update(module, Some(&mut manifest)).is_ok()
        }
        Op::Uninstall => registry.uninstall(module).is_ok(),
        Op::Resolve => registry.resolve(module).is_ok(),
    }
}

proptest! {
    #[test]
    fn lifecycle_follows_transition_table(ops in prop::collection::vec(arb_op(), 1..24)) {
        let registry = registry_with(ManifestLoader::new());
        let module = install(&registry, "mem:prop", LAZY_MANIFEST);

        for op in ops {
            let before = module.state();
            let (want_state, want_ok) = expected(before, op);
            let ok = apply(&registry, &module, op);
            prop_assert_eq!(ok, want_ok, "{:?} from {}", op, before);
            prop_assert_eq!(module.state(), want_state, "{:?} from {}", op, before);
            prop_assert_eq!(
                module.is_lazy_activation_pending(),
                module.state() == ModuleState::Starting
            );
        }
    }
}
