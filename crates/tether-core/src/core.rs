//! Runtime core
//!
//! Owns the interpreter context and everything scripts schedule against
//! it: scopes over the interpreter mutex, protected calls routed to the
//! unhandled-exception sink, timers and intervals, weak references,
//! deferred unprotection, message sinks and the event-wait path, and the
//! core lifecycle state machine.

use crate::interp::{CallableFn, HeapRef, Interpreter, Value};
use crate::scheduler::{Job, JobSink, Scheduler};
use crate::script::ScriptMeta;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Host callback receiving outgoing messages
pub type MessageEmitter = Box<dyn Fn(&str, Option<&[u8]>) + Send + Sync>;

/// Configuration for a runtime core
pub struct CoreOptions {
    /// Script name, used for `Script.fileName`
    pub script_name: String,
    /// Script source, used for source map extraction
    pub script_source: String,
    /// Outgoing message sink; `None` drops emitted messages
    pub emitter: Option<MessageEmitter>,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            script_name: "script".to_string(),
            script_source: String::new(),
            emitter: None,
        }
    }
}

/// Core lifecycle stage
///
/// `Flushed` is reversible: entering a scope moves the core back to
/// `Initialized`. After `Disposed`, message posting and unprotect requests
/// become no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Core exists but is not yet usable
    Uninitialized,
    /// Fully operational
    Initialized,
    /// Quiesced by `flush`; reactivates on the next scope entry
    Flushed,
    /// Torn down; posting and unprotection are no-ops
    Disposed,
    /// Final state; the interpreter thread has stopped
    Finalized,
}

struct ScheduledCallback {
    func: HeapRef,
    repeat: bool,
}

struct WeakRefEntry {
    target: HeapRef,
    callback: HeapRef,
}

struct UnprotectQueue {
    requests: Vec<HeapRef>,
    armed: bool,
}

/// State guarded by the interpreter mutex
pub(crate) struct CoreState {
    /// The managed interpreter context
    pub(crate) interp: Interpreter,
    stage: Stage,
    unhandled_exception_sink: Option<HeapRef>,
    incoming_message_sink: Option<HeapRef>,
    weak_refs: FxHashMap<u32, WeakRefEntry>,
    last_weak_ref_id: u32,
    scheduled: FxHashMap<u32, ScheduledCallback>,
    last_callback_id: u32,
    event_count: u64,
}

pub(crate) struct CoreShared {
    mutex: Mutex<CoreState>,
    event_cond: Condvar,
    unprotect: Mutex<UnprotectQueue>,
    scheduler: Arc<Scheduler>,
    emitter: Option<MessageEmitter>,
    meta: ScriptMeta,
    disposed: AtomicBool,
}

struct CoreJobSink {
    core: Weak<CoreShared>,
}

impl JobSink for CoreJobSink {
    fn run(&self, job: Job) -> bool {
        match self.core.upgrade() {
            Some(core) => core.run_job(job),
            None => false,
        }
    }
}

/// The runtime core bound to one script
#[derive(Clone)]
pub struct Core {
    shared: Arc<CoreShared>,
}

impl Core {
    /// Create and initialize a core
    ///
    /// Spawns the interpreter thread; the returned core is in the
    /// `Initialized` stage.
    pub fn new(options: CoreOptions) -> Core {
        let scheduler = Scheduler::new();
        let shared = Arc::new(CoreShared {
            mutex: Mutex::new(CoreState {
                interp: Interpreter::new(),
                stage: Stage::Uninitialized,
                unhandled_exception_sink: None,
                incoming_message_sink: None,
                weak_refs: FxHashMap::default(),
                last_weak_ref_id: 0,
                scheduled: FxHashMap::default(),
                last_callback_id: 0,
                event_count: 0,
            }),
            event_cond: Condvar::new(),
            unprotect: Mutex::new(UnprotectQueue {
                requests: Vec::new(),
                armed: false,
            }),
            scheduler: scheduler.clone(),
            emitter: options.emitter,
            meta: ScriptMeta::new(options.script_name, options.script_source),
            disposed: AtomicBool::new(false),
        });

        scheduler.start(Arc::new(CoreJobSink {
            core: Arc::downgrade(&shared),
        }));

        shared.mutex.lock().stage = Stage::Initialized;
        log::debug!("core initialized for script {:?}", shared.meta.name());

        Core { shared }
    }

    /// Script metadata (name, source, source map)
    pub fn meta(&self) -> &ScriptMeta {
        &self.shared.meta
    }

    /// Current lifecycle stage
    pub fn stage(&self) -> Stage {
        self.shared.mutex.lock().stage
    }

    /// Enter the interpreter: lock the mutex and return the scope
    pub fn enter(&self) -> Scope<'_> {
        self.shared.enter()
    }

    /// Emit an outgoing message to the host
    pub fn emit_message(&self, message: &str, data: Option<&[u8]>) {
        self.shared.emit(message, data);
    }

    /// Deliver an incoming message to the script's incoming sink
    ///
    /// A no-op after disposal or when no sink is installed. When a sink is
    /// invoked, the event counter advances and `wait_for_event` callers
    /// wake before this returns.
    pub fn post_message(&self, message: &str) {
        if self.shared.disposed.load(Ordering::Acquire) {
            return;
        }
        let mut scope = self.enter();
        if let Some(sink) = scope.state().incoming_message_sink {
            let msg = scope.state().interp.heap.alloc_str(message);
            scope.call(sink, &[Value::Str(msg)]);
            scope.state().interp.heap.unprotect(msg);
            scope.state().event_count += 1;
            self.shared.event_cond.notify_all();
        }
    }

    /// Queue a protection release to run on the interpreter thread
    ///
    /// Safe to call from finalizers on any thread; never takes the
    /// interpreter mutex. A no-op after disposal.
    pub fn unprotect_later(&self, r: HeapRef) {
        self.shared.unprotect_later(r);
    }

    /// Quiesce the core: cancel timers, drain the idle loop, fire and drop
    /// weak references
    ///
    /// Reversible; the next scope entry returns to `Initialized`.
    pub fn flush(&self) {
        self.shared.scheduler.clear_timers();
        {
            let mut scope = self.enter();
            scope.cancel_all_scheduled();
            self.shared.drain_unprotect(&mut scope);
        }
        self.shared.scheduler.wait_until_idle();
        {
            let mut scope = self.enter();
            scope.drop_all_weak_refs();
            scope.state().stage = Stage::Flushed;
        }
        log::debug!("core flushed");
    }

    /// Tear the core down
    ///
    /// Cancels remaining scheduled callbacks, fires remaining weak-ref
    /// notifications, clears both sinks and unblocks event waiters.
    pub fn dispose(&self) {
        {
            let mut scope = self.enter();
            scope.cancel_all_scheduled();
            scope.drop_all_weak_refs();
            scope.set_unhandled_exception_callback(None);
            scope.set_incoming_message_callback(None);
            scope.state().stage = Stage::Disposed;
            scope.state().event_count += 1;
        }
        self.shared.disposed.store(true, Ordering::Release);
        self.shared.event_cond.notify_all();
        self.shared.scheduler.clear_timers();
        log::debug!("core disposed");
    }

    /// Stop the interpreter thread and reach the final stage
    pub fn finalize(&self) {
        self.shared.scheduler.stop();
        self.shared.mutex.lock().stage = Stage::Finalized;
        log::debug!("core finalized");
    }
}

impl CoreShared {
    pub(crate) fn enter(self: &Arc<Self>) -> Scope<'_> {
        let mut guard = self.mutex.lock();
        if guard.stage == Stage::Flushed {
            guard.stage = Stage::Initialized;
        }
        Scope {
            shared: self,
            guard: Some(guard),
        }
    }

    fn emit(&self, message: &str, data: Option<&[u8]>) {
        if let Some(emitter) = &self.emitter {
            emitter(message, data);
        }
    }

    pub(crate) fn unprotect_later(&self, r: HeapRef) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.unprotect.lock();
        queue.requests.push(r);
        if !queue.armed {
            queue.armed = true;
            drop(queue);
            self.scheduler.push_immediate(Job::DrainUnprotect);
        }
    }

    fn drain_unprotect(&self, scope: &mut Scope<'_>) {
        loop {
            let batch = {
                let mut queue = self.unprotect.lock();
                if queue.requests.is_empty() {
                    queue.armed = false;
                    break;
                }
                std::mem::take(&mut queue.requests)
            };
            for r in batch {
                scope.state().interp.heap.unprotect(r);
            }
        }
    }

    fn run_job(self: &Arc<Self>, job: Job) -> bool {
        match job {
            Job::Fire(id) => {
                let mut scope = self.enter();
                let (func, repeat) = match scope.state().scheduled.get(&id) {
                    Some(cb) => (cb.func, cb.repeat),
                    None => return false,
                };
                scope.call(func, &[]);
                if repeat {
                    scope.state().scheduled.contains_key(&id)
                } else {
                    if let Some(cb) = scope.state().scheduled.remove(&id) {
                        scope.state().interp.heap.unprotect(cb.func);
                    }
                    false
                }
            }
            Job::DrainUnprotect => {
                let mut scope = self.enter();
                self.drain_unprotect(&mut scope);
                false
            }
        }
    }
}

impl Drop for CoreShared {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

/// RAII region owning the interpreter mutex for a native->managed crossing
///
/// Every entry from native code into the interpreter goes through a scope;
/// the mutex is released on every exit path, including after the
/// unhandled-exception sink runs.
pub struct Scope<'c> {
    shared: &'c Arc<CoreShared>,
    guard: Option<MutexGuard<'c, CoreState>>,
}

impl<'c> Scope<'c> {
    pub(crate) fn state(&mut self) -> &mut CoreState {
        self.guard.as_mut().expect("scope is suspended")
    }

    /// The managed heap
    pub fn heap(&mut self) -> &mut crate::interp::Heap {
        &mut self.state().interp.heap
    }

    /// A handle to the owning core
    pub fn core(&self) -> Core {
        Core {
            shared: Arc::clone(self.shared),
        }
    }

    /// Allocate a callable in the managed heap
    pub fn alloc_callable<F>(&mut self, f: F) -> HeapRef
    where
        F: Fn(&mut Scope<'_>, &[Value]) -> Result<Value, Value> + Send + Sync + 'static,
    {
        let handle: Arc<CallableFn> = Arc::new(f);
        self.heap().alloc_callable(handle)
    }

    /// Release the interpreter mutex around `f`, reacquiring afterwards
    ///
    /// Used by the call frame engine so a callee may re-enter the
    /// interpreter from the same thread.
    pub fn suspend<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let guard = self.guard.take().expect("scope is suspended");
        drop(guard);
        let result = f();
        self.guard = Some(self.shared.mutex.lock());
        result
    }

    /// Protected call: invoke a managed callable, routing an uncaught
    /// throw to the unhandled-exception sink
    ///
    /// Returns `None` when the callable threw (or does not exist).
    pub fn call(&mut self, func: HeapRef, args: &[Value]) -> Option<Value> {
        let callable = self.heap().callable(func)?;
        match (*callable)(self, args) {
            Ok(value) => Some(value),
            Err(thrown) => {
                self.dispatch_exception(thrown);
                None
            }
        }
    }

    fn dispatch_exception(&mut self, thrown: Value) {
        let sink = self.state().unhandled_exception_sink;
        if let Some(sink) = sink {
            if let Some(callable) = self.heap().callable(sink) {
                let _ = (*callable)(self, &[thrown]);
            }
        }
    }

    /// Schedule a callable: delay 0 queues on the idle source, a positive
    /// delay on a timeout source
    ///
    /// Returns the monotonic callback id.
    pub fn schedule(&mut self, func: HeapRef, delay_ms: u32, repeat: bool) -> u32 {
        let state = self.state();
        state.last_callback_id = state.last_callback_id.wrapping_add(1);
        let id = state.last_callback_id;
        state.interp.heap.protect(func);
        state.scheduled.insert(id, ScheduledCallback { func, repeat });

        if delay_ms == 0 {
            self.shared.scheduler.push_immediate(Job::Fire(id));
        } else {
            let delay = Duration::from_millis(delay_ms as u64);
            self.shared
                .scheduler
                .push_timer(id, delay, repeat.then_some(delay));
        }
        id
    }

    /// `setTimeout`
    pub fn set_timeout(&mut self, func: HeapRef, delay_ms: u32) -> u32 {
        self.schedule(func, delay_ms, false)
    }

    /// `setInterval`
    pub fn set_interval(&mut self, func: HeapRef, delay_ms: u32) -> u32 {
        self.schedule(func, delay_ms, true)
    }

    /// `clearTimeout` / `clearInterval`: tear down the source and destroy
    /// the record
    ///
    /// Idempotent; returns whether the id referred to a live callback.
    pub fn clear_timer(&mut self, id: u32) -> bool {
        let state = self.state();
        match state.scheduled.remove(&id) {
            Some(cb) => {
                state.interp.heap.unprotect(cb.func);
                true
            }
            None => false,
        }
    }

    /// Bind a weak reference: the callback fires exactly once when the
    /// target is collected, the binding is unbound, or the core is torn
    /// down
    ///
    /// The target must be heap-allocated; primitives fail.
    pub fn weak_bind(&mut self, target: &Value, callback: HeapRef) -> CoreResult<u32> {
        let target_ref = target
            .heap_ref()
            .ok_or_else(|| CoreError::InvalidType("expected a non-primitive value".into()))?;
        let state = self.state();
        state.last_weak_ref_id = state.last_weak_ref_id.wrapping_add(1);
        let id = state.last_weak_ref_id;
        state.interp.heap.watch(target_ref);
        state.interp.heap.protect(callback);
        state.weak_refs.insert(
            id,
            WeakRefEntry {
                target: target_ref,
                callback,
            },
        );
        Ok(id)
    }

    /// Unbind a weak reference; the notification still fires
    pub fn weak_unbind(&mut self, id: u32) -> bool {
        match self.state().weak_refs.remove(&id) {
            Some(entry) => {
                self.fire_weak_notification(entry);
                true
            }
            None => false,
        }
    }

    fn fire_weak_notification(&mut self, entry: WeakRefEntry) {
        let target_still_watched = self
            .state()
            .weak_refs
            .values()
            .any(|w| w.target == entry.target);
        if !target_still_watched {
            self.state().interp.heap.unwatch(entry.target);
        }
        self.call(entry.callback, &[]);
        self.state().interp.heap.unprotect(entry.callback);
    }

    fn drop_all_weak_refs(&mut self) {
        let ids: Vec<u32> = self.state().weak_refs.keys().copied().collect();
        for id in ids {
            if let Some(entry) = self.state().weak_refs.remove(&id) {
                self.fire_weak_notification(entry);
            }
        }
    }

    fn cancel_all_scheduled(&mut self) {
        let state = self.state();
        let callbacks: Vec<ScheduledCallback> = state.scheduled.drain().map(|(_, cb)| cb).collect();
        for cb in callbacks {
            state.interp.heap.unprotect(cb.func);
        }
    }

    /// Best-effort managed-heap collection, delivering weak notifications
    /// for swept targets
    pub fn gc(&mut self) {
        let swept = self.state().interp.heap.collect();
        for target in swept {
            let ids: Vec<u32> = self
                .state()
                .weak_refs
                .iter()
                .filter(|(_, w)| w.target == target)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(entry) = self.state().weak_refs.remove(&id) {
                    self.call(entry.callback, &[]);
                    self.state().interp.heap.unprotect(entry.callback);
                }
            }
        }
    }

    /// Install or clear the unhandled-exception sink
    pub fn set_unhandled_exception_callback(&mut self, callback: Option<HeapRef>) {
        if let Some(r) = callback {
            self.state().interp.heap.protect(r);
        }
        let old = std::mem::replace(&mut self.state().unhandled_exception_sink, callback);
        if let Some(old) = old {
            self.state().interp.heap.unprotect(old);
        }
    }

    /// Install or clear the incoming-message sink
    pub fn set_incoming_message_callback(&mut self, callback: Option<HeapRef>) {
        if let Some(r) = callback {
            self.state().interp.heap.protect(r);
        }
        let old = std::mem::replace(&mut self.state().incoming_message_sink, callback);
        if let Some(old) = old {
            self.state().interp.heap.unprotect(old);
        }
    }

    /// `_send`: emit an outgoing message to the host
    pub fn send(&mut self, message: &str, data: Option<&[u8]>) {
        self.shared.emit(message, data);
    }

    /// `_waitForEvent`: block until the event counter advances past its
    /// value on entry
    ///
    /// Releases the interpreter mutex while waiting. Unblocked by
    /// `post_message` delivery and by teardown.
    pub fn wait_for_event(&mut self) {
        let start = self.state().event_count;
        loop {
            {
                let state = self.state();
                if state.event_count != start || state.stage >= Stage::Disposed {
                    break;
                }
            }
            let guard = self.guard.as_mut().expect("scope is suspended");
            self.shared.event_cond.wait(guard);
        }
    }
}
