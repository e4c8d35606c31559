//! 事件分发器
//!
//! 负责监听器的登记与事件投递：
//!
//! - **同步模块监听器**：在发布线程上按登记顺序调用
//! - **异步模块监听器 / 框架监听器**：由独立的分发线程按发布顺序调用，
//!   同一监听器不会被并发调用
//! - **服务监听器**：在发布线程上同步调用，每次投递时重新求值过滤器
//!
//! 监听器中的 panic 会被捕获，记录日志并以框架错误事件上报，
//! 不会影响发布方。

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::event::{Event, FrameworkEvent, ModuleEvent, ServiceEvent, ServiceEventKind};
use crate::core::{EventConfig, PropertyMap};
use crate::filter::Filter;
use crate::module::activator::panic_message;
use crate::module::ModuleHandle;
use crate::utils::{CoreError, Result};

/// 事件回调函数类型
///
/// 回调可能在发布线程或分发线程上执行，必须线程安全。
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// 监听器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// 异步模块监听器
    Module,
    /// 同步模块监听器
    SynchronousModule,
    /// 服务监听器，可附带过滤器
    Service,
    /// 框架事件监听器
    Framework,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerKind::Module => "module",
            ListenerKind::SynchronousModule => "synchronous-module",
            ListenerKind::Service => "service",
            ListenerKind::Framework => "framework",
        };
        f.write_str(name)
    }
}

/// 监听器 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// 数值形式
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// 分发统计信息
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    /// 总分发次数
    pub total_dispatched: u64,

    /// 成功分发次数
    pub successful: u64,

    /// 失败分发次数（监听器 panic）
    pub failed: u64,

    /// 最后分发时间
    pub last_dispatch_at: Option<DateTime<Utc>>,
}

/// 内部监听器条目
struct ListenerEntry {
    id: ListenerId,
    owner: ModuleHandle,
    kind: ListenerKind,
    filter: Option<Filter>,
    callback: EventCallback,
    removed: AtomicBool,
}

/// 分发线程的任务
enum Job {
    Deliver(Event, Vec<Arc<ListenerEntry>>),
    Flush(std_mpsc::Sender<()>),
}

/// 事件分发器
pub struct EventDispatcher {
    listeners: RwLock<Vec<Arc<ListenerEntry>>>,
    next_listener_id: AtomicU64,
    stats: Arc<Mutex<DispatchStats>>,
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: Mutex<Option<ThreadId>>,
}

impl EventDispatcher {
    /// 创建分发器；`config.deliver_async_events` 为真时启动分发线程
    ///
    /// # Errors
    ///
    /// 分发线程无法创建时返回 `CoreError::InitFailed`
    pub fn new(config: &EventConfig) -> Result<Self> {
        let dispatcher = Self {
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            stats: Arc::new(Mutex::new(DispatchStats::default())),
            queue: Mutex::new(None),
            worker: Mutex::new(None),
            worker_thread: Mutex::new(None),
        };

        if config.deliver_async_events {
            let (tx, rx) = mpsc::unbounded_channel();
            let stats = Arc::clone(&dispatcher.stats);
            let handle = thread::Builder::new()
                .name(config.dispatch_thread_name.clone())
                .spawn(move || Self::run_worker(rx, stats))
                .map_err(|e| CoreError::InitFailed(format!("无法启动事件分发线程: {}", e)))?;

            *dispatcher.worker_thread.lock() = Some(handle.thread().id());
            *dispatcher.worker.lock() = Some(handle);
            *dispatcher.queue.lock() = Some(tx);
            info!(thread = %config.dispatch_thread_name, "事件分发线程已启动");
        }

        Ok(dispatcher)
    }

    fn run_worker(mut rx: mpsc::UnboundedReceiver<Job>, stats: Arc<Mutex<DispatchStats>>) {
        while let Some(job) = rx.blocking_recv() {
            match job {
                Job::Deliver(event, listeners) => {
                    for listener in listeners {
                        // 投递前已注销的监听器不再接收事件
                        if listener.removed.load(Ordering::Acquire) {
                            continue;
                        }
                        if let Err(message) = Self::invoke(&stats, &listener, &event) {
                            // 分发线程上无法再上报到自身队列之外，仅记录日志
                            error!(
                                listener_id = listener.id.value(),
                                event_type = event.event_type(),
                                error = %message,
                                "异步监听器执行失败"
                            );
                        }
                    }
                }
                Job::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("事件分发线程退出");
    }

    // ==================== 监听器管理 ====================

    /// 登记监听器
    ///
    /// 过滤器只对服务监听器生效。
    pub fn subscribe(
        &self,
        owner: &ModuleHandle,
        kind: ListenerKind,
        filter: Option<Filter>,
        callback: EventCallback,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        let entry = Arc::new(ListenerEntry {
            id,
            owner: Arc::clone(owner),
            kind,
            filter,
            callback,
            removed: AtomicBool::new(false),
        });
        self.listeners.write().push(entry);
        debug!(
            listener_id = id.value(),
            module_id = owner.id(),
            kind = %kind,
            "监听器已登记"
        );
        id
    }

    /// 注销监听器
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        match listeners.iter().position(|l| l.id == id) {
            Some(index) => {
                let entry = listeners.remove(index);
                entry.removed.store(true, Ordering::Release);
                debug!(listener_id = id.value(), "监听器已注销");
                true
            }
            None => false,
        }
    }

    /// 注销模块持有的全部监听器，返回注销数量
    pub fn remove_listeners(&self, owner: &ModuleHandle) -> usize {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| {
            if l.owner.id() == owner.id() {
                l.removed.store(true, Ordering::Release);
                false
            } else {
                true
            }
        });
        let removed = before - listeners.len();
        if removed > 0 {
            debug!(module_id = owner.id(), count = removed, "模块监听器已清除");
        }
        removed
    }

    /// 模块持有的监听器数量
    pub fn listener_count_for(&self, owner: &ModuleHandle) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|l| l.owner.id() == owner.id())
            .count()
    }

    /// 监听器总数
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn snapshot(&self, kind: ListenerKind) -> Vec<Arc<ListenerEntry>> {
        self.listeners
            .read()
            .iter()
            .filter(|l| l.kind == kind)
            .cloned()
            .collect()
    }

    // ==================== 事件发布 ====================

    /// 发布模块事件
    ///
    /// 同步监听器在当前线程上调用完毕后，事件才进入异步队列。
    pub fn publish_module(&self, event: ModuleEvent) {
        trace!(
            module_id = event.module.id(),
            event_type = event.kind.as_str(),
            "发布模块事件"
        );
        let deliver_async = event.kind.is_async_deliverable();
        let event = Event::Module(event);

        for listener in self.snapshot(ListenerKind::SynchronousModule) {
            if listener.removed.load(Ordering::Acquire) {
                continue;
            }
            if let Err(message) = Self::invoke(&self.stats, &listener, &event) {
                self.report_listener_failure(&listener, &event, message);
            }
        }

        if deliver_async {
            let listeners = self.snapshot(ListenerKind::Module);
            self.enqueue(event, listeners);
        }
    }

    /// 发布服务事件
    ///
    /// `previous` 为修改前的属性，用于判定 MODIFIED_ENDMATCH。
    pub fn publish_service(&self, event: ServiceEvent, previous: Option<&PropertyMap>) {
        trace!(
            service_id = event.reference.id(),
            event_type = event.kind.as_str(),
            "发布服务事件"
        );
        let current = event.reference.properties();
        let end_match = event.with_kind(ServiceEventKind::ModifiedEndMatch);
        let event = Event::Service(event);
        let end_match = Event::Service(end_match);

        for listener in self.snapshot(ListenerKind::Service) {
            if listener.removed.load(Ordering::Acquire) || !listener.owner.state().is_live() {
                continue;
            }

            let to_deliver = match &listener.filter {
                None => Some(&event),
                Some(filter) if filter.matches(&current) => Some(&event),
                Some(filter) => match previous {
                    Some(old) if filter.matches(old) => Some(&end_match),
                    _ => None,
                },
            };

            if let Some(to_deliver) = to_deliver {
                if let Err(message) = Self::invoke(&self.stats, &listener, to_deliver) {
                    self.report_listener_failure(&listener, to_deliver, message);
                }
            }
        }
    }

    /// 发布框架事件（异步）
    pub fn publish_framework(&self, event: FrameworkEvent) {
        let listeners = self.snapshot(ListenerKind::Framework);
        self.enqueue(Event::Framework(event), listeners);
    }

    /// 上报异步错误：记录日志并发布框架错误事件
    pub fn report_error(&self, module: Option<&ModuleHandle>, error: CoreError) {
        error!(
            module_id = module.map(|m| m.id()),
            error_code = error.error_code(),
            error = %error,
            "异步错误"
        );
        self.publish_framework(FrameworkEvent::error(module.cloned(), error));
    }

    fn report_listener_failure(&self, listener: &ListenerEntry, event: &Event, message: String) {
        warn!(
            listener_id = listener.id.value(),
            module_id = listener.owner.id(),
            event_type = event.event_type(),
            error = %message,
            "监听器执行失败"
        );
        self.report_error(
            Some(&listener.owner),
            CoreError::Internal(format!("监听器 {} 处理 {} 时失败: {}", listener.id, event.event_type(), message)),
        );
    }

    fn enqueue(&self, event: Event, listeners: Vec<Arc<ListenerEntry>>) {
        if listeners.is_empty() {
            return;
        }
        if let Some(tx) = self.queue.lock().as_ref() {
            if tx.send(Job::Deliver(event, listeners)).is_err() {
                warn!("事件分发线程已停止，异步事件被丢弃");
            }
        }
    }

    fn invoke(
        stats: &Mutex<DispatchStats>,
        listener: &ListenerEntry,
        event: &Event,
    ) -> std::result::Result<(), String> {
        let callback = Arc::clone(&listener.callback);
        let result = panic::catch_unwind(AssertUnwindSafe(|| callback(event)));

        let mut stats = stats.lock();
        stats.total_dispatched += 1;
        stats.last_dispatch_at = Some(Utc::now());
        match result {
            Ok(()) => {
                stats.successful += 1;
                Ok(())
            }
            Err(payload) => {
                stats.failed += 1;
                Err(panic_message(payload.as_ref()))
            }
        }
    }

    // ==================== 统计与关闭 ====================

    /// 获取分发统计信息
    pub fn stats(&self) -> DispatchStats {
        self.stats.lock().clone()
    }

    /// 重置统计信息
    pub fn reset_stats(&self) {
        *self.stats.lock() = DispatchStats::default();
    }

    /// 等待此前入队的异步事件投递完毕
    ///
    /// 在分发线程上调用、分发线程未启动或超时均返回 false。
    pub fn flush(&self, timeout: Duration) -> bool {
        if self.is_worker_thread() {
            return false;
        }
        let (done_tx, done_rx) = std_mpsc::channel();
        let sent = match self.queue.lock().as_ref() {
            Some(tx) => tx.send(Job::Flush(done_tx)).is_ok(),
            None => false,
        };
        sent && done_rx.recv_timeout(timeout).is_ok()
    }

    /// 停止分发线程，队列中已有的事件会先投递完
    pub fn shutdown(&self) {
        let sender = self.queue.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        if self.is_worker_thread() {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("事件分发线程异常退出");
            }
        }
        info!("事件分发线程已停止");
    }

    fn is_worker_thread(&self) -> bool {
        *self.worker_thread.lock() == Some(thread::current().id())
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
