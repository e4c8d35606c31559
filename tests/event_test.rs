//! 事件分发集成测试
//!
//! 测试同步/异步监听器的投递范围与顺序、监听器异常上报，
//! 以及模块停止后监听器的清理。

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chips_registry::{
    CoreError, Event, EventCallback, FnActivator, FrameworkConfig, FrameworkEventKind, ListenerKind,
    ManifestLoader, ModuleContext, ModuleEventKind, ModuleHandle, PropertyMap, Registry,
    ServiceEventKind, ServiceObject, ServiceSource, StartOptions, StopOptions,
};
use parking_lot::Mutex;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

fn registry() -> Registry {
    Registry::builder().config(FrameworkConfig::default()).build().unwrap()
}

fn install(registry: &Registry, location: &str, manifest: &str) -> ModuleHandle {
    let mut reader = Cursor::new(manifest.to_string());
    registry.install(location, Some(&mut reader)).unwrap()
}

/// 记录模块事件 (模块 ID, 事件类型) 的监听器
fn module_recorder(registry: &Registry, kind: ListenerKind) -> Arc<Mutex<Vec<(u64, ModuleEventKind)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: EventCallback = Arc::new(move |event: &Event| {
        if let Some(e) = event.as_module() {
            sink.lock().push((e.module.id(), e.kind));
        }
    });
    registry
        .add_listener(&registry.system_module(), kind, None, callback)
        .unwrap();
    seen
}

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

fn kinds(seen: &Mutex<Vec<(u64, ModuleEventKind)>>, module: &ModuleHandle) -> Vec<ModuleEventKind> {
    seen.lock()
        .iter()
        .filter(|(id, _)| *id == module.id())
        .map(|(_, kind)| *kind)
        .collect()
}

// ============================================================================
// 模块事件
// ============================================================================

#[test]
fn test_sync_and_async_listeners_see_different_kinds() {
    let registry = registry();
    let sync_seen = module_recorder(&registry, ListenerKind::SynchronousModule);
    let async_seen = module_recorder(&registry, ListenerKind::Module);

    let module = install(&registry, "mem:a", "Module-SymbolicName: a\n");
    registry.start(&module, StartOptions::default()).unwrap();
    registry.stop(&module, StopOptions::default()).unwrap();
    assert!(registry.flush_events(FLUSH_TIMEOUT));

    use ModuleEventKind::*;
    assert_eq!(
        kinds(&sync_seen, &module),
        vec![Installed, Resolved, Starting, Started, Stopping, Stopped]
    );
    assert_eq!(kinds(&async_seen, &module), vec![Installed, Resolved, Started, Stopped]);

    registry.shutdown();
}

#[test]
fn test_lazy_activation_only_reaches_sync_listeners() {
    let registry = registry();
    let sync_seen = module_recorder(&registry, ListenerKind::SynchronousModule);
    let async_seen = module_recorder(&registry, ListenerKind::Module);

    let module = install(
        &registry,
        "mem:lazy",
        "Module-SymbolicName: lazy\nModule-ActivationPolicy: lazy\n",
    );
    registry.start(&module, StartOptions::with_activation_policy()).unwrap();
    registry.trigger_activation(&module).unwrap();
    assert!(registry.flush_events(FLUSH_TIMEOUT));

    use ModuleEventKind::*;
    assert_eq!(
        kinds(&sync_seen, &module),
        vec![Installed, Resolved, LazyActivation, Starting, Started]
    );
    assert_eq!(kinds(&async_seen, &module), vec![Installed, Resolved, Started]);

    registry.shutdown();
}

#[test]
fn test_async_delivery_preserves_publish_order() {
    let registry = registry();
    let seen = module_recorder(&registry, ListenerKind::Module);

    let modules: Vec<ModuleHandle> = (0..20)
        .map(|i| install(&registry, &format!("mem:m{i}"), &format!("Module-SymbolicName: m{i}\n")))
        .collect();
    assert!(registry.flush_events(FLUSH_TIMEOUT));

    let installed: Vec<u64> = seen
        .lock()
        .iter()
        .filter(|(_, kind)| *kind == ModuleEventKind::Installed)
        .map(|(id, _)| *id)
        .collect();
    let expected: Vec<u64> = modules.iter().map(|m| m.id()).collect();
    assert_eq!(installed, expected);

    registry.shutdown();
}

#[test]
fn test_async_listener_is_never_invoked_concurrently() {
    let registry = registry();
    let active = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let (a, o) = (Arc::clone(&active), Arc::clone(&overlaps));
    let callback: EventCallback = Arc::new(move |_: &Event| {
        if a.fetch_add(1, Ordering::SeqCst) > 0 {
            o.fetch_add(1, Ordering::SeqCst);
        }
        std::thread::sleep(Duration::from_millis(1));
        a.fetch_sub(1, Ordering::SeqCst);
    });
    registry
        .add_listener(&registry.system_module(), ListenerKind::Module, None, callback)
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 0..5 {
                    let mut reader = Cursor::new(format!("Module-SymbolicName: t{t}.m{i}\n"));
                    registry.install(&format!("mem:t{t}/m{i}"), Some(&mut reader)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(registry.flush_events(FLUSH_TIMEOUT));
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);

    registry.shutdown();
}

#[test]
fn test_shutdown_drains_pending_async_events() {
    let registry = registry();
    let seen = module_recorder(&registry, ListenerKind::Module);

    let module = install(&registry, "mem:drain", "Module-SymbolicName: drain\n");
    registry.shutdown();

    assert_eq!(kinds(&seen, &module), vec![ModuleEventKind::Installed]);
}

#[test]
fn test_async_delivery_can_be_disabled() {
    let registry = Registry::builder()
        .config(FrameworkConfig::builder().without_async_events().build())
        .build()
        .unwrap();
    let sync_seen = module_recorder(&registry, ListenerKind::SynchronousModule);
    let async_seen = module_recorder(&registry, ListenerKind::Module);

    let module = install(&registry, "mem:quiet", "Module-SymbolicName: quiet\n");
    assert!(!registry.flush_events(Duration::from_millis(50)));

    assert_eq!(kinds(&sync_seen, &module), vec![ModuleEventKind::Installed]);
    assert!(async_seen.lock().is_empty());
}

// ============================================================================
// 监听器异常与注销
// ============================================================================

#[test]
fn test_listener_panic_is_reported_as_framework_error() {
    let registry = registry();
    let errors = framework_errors(&registry);
    let callback: EventCallback = Arc::new(|event: &Event| {
        if event.as_module().map(|e| e.kind) == Some(ModuleEventKind::Installed) {
            panic!("listener exploded");
        }
    });
    registry
        .add_listener(&registry.system_module(), ListenerKind::SynchronousModule, None, callback)
        .unwrap();
    let after = module_recorder(&registry, ListenerKind::SynchronousModule);

    // 发布方不受影响，后续监听器照常收到事件
    let module = install(&registry, "mem:p", "Module-SymbolicName: p\n");
    assert_eq!(kinds(&after, &module), vec![ModuleEventKind::Installed]);
    assert!(registry.flush_events(FLUSH_TIMEOUT));

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, Some(registry.system_module().id()));
    assert!(errors[0].1.contains("listener exploded"));
    assert_eq!(registry.dispatch_stats().failed, 1);

    drop(errors);
    registry.shutdown();
}

#[test]
fn test_removed_listener_receives_nothing() {
    let registry = registry();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let callback: EventCallback = Arc::new(move |_: &Event| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let id = registry
        .add_listener(&registry.system_module(), ListenerKind::SynchronousModule, None, callback)
        .unwrap();

    install(&registry, "mem:one", "Module-SymbolicName: one\n");
    assert!(registry.remove_listener(id));
    assert!(!registry.remove_listener(id));
    install(&registry, "mem:two", "Module-SymbolicName: two\n");

    assert_eq!(count.load(Ordering::SeqCst), 1);
    registry.shutdown();
}

// ============================================================================
// 服务事件
// ============================================================================

#[test]
fn test_service_listener_filter_and_owner_cleanup() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let loader = ManifestLoader::new().with_activator("watcher", move || {
        let sink = Arc::clone(&sink);
        Arc::new(FnActivator::new(
            move |ctx: &ModuleContext| {
                let sink = Arc::clone(&sink);
                let callback: EventCallback = Arc::new(move |event: &Event| {
                    if let Some(e) = event.as_service() {
                        sink.lock().push((e.reference.id(), e.kind));
                    }
                });
                ctx.add_listener(ListenerKind::Service, Some("(lang=en)"), callback)?;
                Ok(())
            },
            |_: &ModuleContext| Ok(()),
        ))
    });
    let registry = Registry::builder()
        .config(FrameworkConfig::default())
        .loader(Arc::new(loader))
        .build()
        .unwrap();
    let watcher = install(
        &registry,
        "mem:watcher",
        "Module-SymbolicName: watcher\nModule-Activator: watcher\n",
    );
    registry.start(&watcher, StartOptions::default()).unwrap();

    let system = registry.system_module();
    let publish = |lang: &str| {
        registry
            .register_service(
                &system,
                &["com.acme.Greeter"],
                ServiceSource::singleton(ServiceObject::new(lang.to_string(), ["com.acme.Greeter"])),
                PropertyMap::new().with("lang", lang).unwrap(),
            )
            .unwrap()
    };

    let english = publish("en");
    let _french = publish("fr");
    assert_eq!(*seen.lock(), vec![(english.reference().id(), ServiceEventKind::Registered)]);

    // 停止后监听器随模块一起清除
    registry.stop(&watcher, StopOptions::default()).unwrap();
    let _more = publish("en");
    english.unregister().unwrap();
    assert_eq!(seen.lock().len(), 1);

    registry.shutdown();
}

#[test]
fn test_listener_requires_live_owner() {
    let registry = registry();
    let module = install(&registry, "mem:idle", "Module-SymbolicName: idle\n");
    let callback: EventCallback = Arc::new(|_: &Event| {});

    let result = registry.add_listener(&module, ListenerKind::Service, None, callback);
    assert!(matches!(result, Err(CoreError::InvalidState { .. })));

    registry.shutdown();
}
