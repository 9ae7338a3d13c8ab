use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{
    AtomicBool, AtomicU8, AtomicU64,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::activation::{
    Activation, ActivationStack, FrameKind, NumericSettings,
};
use crate::condition::{Condition, ConditionCode};
use crate::instance::ExitTable;

/// Identity of one logical thread of script execution. Zero is reserved
/// for "no owner" in the kernel lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Root,
    Spawned,
    Attached,
}

const PARKED: u8 = 0b01;
const TOKEN: u8 = 0b10;

/// Run-control semaphore of one activity. A post before the wait is
/// remembered as a token, so wake-ups are never lost; posts are counted
/// for the notification accounting.
#[derive(Debug, Default)]
pub struct GuardParker {
    state: AtomicU8,
    lock: Mutex<()>,
    cv: Condvar,
    posts: AtomicU64,
}

impl GuardParker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block the calling thread until a post token arrives. Must never be
    /// called while holding kernel access.
    pub fn wait(&self) {
        // Fast path: post arrived before the wait.
        if self.try_consume_token() {
            return;
        }

        self.state.fetch_or(PARKED, Release);

        if self.try_consume_token() {
            self.state.fetch_and(!PARKED, AcqRel);
            return;
        }

        let mut guard = self.lock.lock();
        loop {
            self.cv.wait(&mut guard);
            if self.try_consume_token() {
                break;
            }
        }
        drop(guard);

        self.state.fetch_and(!PARKED, AcqRel);
    }

    #[inline]
    fn try_consume_token(&self) -> bool {
        let mut s = self.state.load(Acquire);
        while s & TOKEN != 0 {
            match self
                .state
                .compare_exchange_weak(s, s & !TOKEN, AcqRel, Relaxed)
            {
                Ok(_) => return true,
                Err(cur) => s = cur,
            }
        }
        false
    }

    pub fn post(&self) {
        self.posts.fetch_add(1, Relaxed);
        let prev = self.state.fetch_or(TOKEN, Release);
        if prev & PARKED != 0 {
            let _guard = self.lock.lock();
            self.cv.notify_one();
        }
    }

    pub fn post_count(&self) -> u64 {
        self.posts.load(Relaxed)
    }
}

/// Per-call snapshot of activity-global state that must appear
/// call-frame-scoped to nested invocations.
#[derive(Debug, Clone)]
pub struct NestedActivityState {
    exits: ExitTable,
    random_seed: u64,
    stack_base: usize,
}

const DEFAULT_DEPTH_LIMIT: usize = 512;

#[derive(Debug)]
struct ActivityState {
    stack: ActivationStack,
    nested_count: usize,
    saved: Vec<NestedActivityState>,
    condition: Option<Condition>,
    requires: HashSet<String>,
    exits: ExitTable,
    random_seed: u64,
    depth_limit: usize,
}

/// How a raised condition was resolved against the activation chain.
#[derive(Debug)]
pub enum RaiseOutcome {
    /// A frame trapped the condition; frames above it were unwound.
    Handled { frame: usize, condition: Condition },
    Unhandled(Condition),
}

/// One logical thread of script execution: an activation stack, a
/// run-control parker, re-entrancy bookkeeping, and the cooperative
/// halt/trace flags.
#[derive(Debug)]
pub struct Activity {
    pub id: ActivityId,
    pub kind: ActivityKind,
    parker: GuardParker,
    halt_flag: AtomicBool,
    trace_flag: AtomicBool,
    halt_description: Mutex<Option<String>>,
    waiting_on: Mutex<Option<ActivityId>>,
    state: Mutex<ActivityState>,
}

impl Activity {
    pub fn new(id: ActivityId, kind: ActivityKind) -> Arc<Self> {
        Self::with_exits(id, kind, ExitTable::default())
    }

    pub fn with_exits(
        id: ActivityId,
        kind: ActivityKind,
        exits: ExitTable,
    ) -> Arc<Self> {
        debug_assert_ne!(id.0, 0, "activity id zero is reserved");
        Arc::new(Self {
            id,
            kind,
            parker: GuardParker::new(),
            halt_flag: AtomicBool::new(false),
            trace_flag: AtomicBool::new(false),
            halt_description: Mutex::new(None),
            waiting_on: Mutex::new(None),
            state: Mutex::new(ActivityState {
                stack: ActivationStack::new(),
                nested_count: 0,
                saved: Vec::new(),
                condition: None,
                requires: HashSet::new(),
                exits,
                random_seed: id.0.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1,
                depth_limit: DEFAULT_DEPTH_LIMIT,
            }),
        })
    }

    // frame management

    pub fn push_frame(&self, frame: Activation) -> usize {
        self.state.lock().stack.push(frame)
    }

    pub fn pop_frame(&self) -> Activation {
        self.state.lock().stack.pop()
    }

    pub fn depth(&self) -> usize {
        self.state.lock().stack.depth()
    }

    pub fn current_message(&self) -> Option<String> {
        self.state
            .lock()
            .stack
            .current()
            .map(|frame| frame.message.clone())
    }

    pub fn sender_of(&self, index: usize) -> Option<usize> {
        self.state.lock().stack.sender(index)
    }

    pub fn traceback(&self) -> Vec<String> {
        self.state.lock().stack.traceback()
    }

    pub fn with_current_frame<R>(
        &self,
        f: impl FnOnce(&mut Activation) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock();
        state.stack.current_mut().map(f)
    }

    /// Outgoing references of every frame, for the collector's root scan.
    pub fn visit_stack_roots(&self, visit: &mut dyn FnMut(crate::ObjRef)) {
        let state = self.state.lock();
        for frame in state.stack.frames() {
            if let Some(receiver) = frame.receiver {
                visit(receiver);
            }
            if let Some(pool) = frame.variable_pool {
                visit(pool);
            }
            for arg in &frame.args {
                if let Some(r) = arg.as_object() {
                    visit(r);
                }
            }
        }
    }

    // numeric context

    pub fn numeric_settings(&self) -> NumericSettings {
        self.state
            .lock()
            .stack
            .current()
            .map(|frame| frame.settings)
            .unwrap_or_default()
    }

    pub fn set_digits(&self, digits: u32) {
        if let Some(frame) = self.state.lock().stack.current_mut() {
            frame.settings.digits = digits;
        }
    }

    // re-entrancy

    /// Enter a (possibly nested) call: bump the nesting depth and snapshot
    /// the activity-global state the call must see as its own.
    pub fn activate(&self) {
        let mut state = self.state.lock();
        state.nested_count += 1;
        let snapshot = NestedActivityState {
            exits: state.exits.clone(),
            random_seed: state.random_seed,
            stack_base: state.stack.depth(),
        };
        state.saved.push(snapshot);
    }

    /// Leave a call, restoring the snapshot exactly. Also runs on the
    /// unwind path, where it pops any frames the call left behind.
    pub fn deactivate(&self) {
        let mut state = self.state.lock();
        let snapshot = state
            .saved
            .pop()
            .expect("deactivate without a matching activate");
        // a trapped condition may already have unwound past the base
        if state.stack.depth() > snapshot.stack_base {
            state.stack.unwind_to(snapshot.stack_base);
        }
        state.exits = snapshot.exits;
        state.random_seed = snapshot.random_seed;
        state.nested_count -= 1;
    }

    pub fn nested_count(&self) -> usize {
        self.state.lock().nested_count
    }

    // requires load guards

    /// Begin loading a required module; a second begin before the first
    /// finishes is a re-entrant double load.
    pub fn start_requires(&self, name: &str) -> Result<(), Condition> {
        let mut state = self.state.lock();
        if !state.requires.insert(name.to_string()) {
            return Err(Condition::new(
                ConditionCode::Failure,
                format!("recursive load of required module {name}"),
            ));
        }
        Ok(())
    }

    pub fn finish_requires(&self, name: &str) {
        self.state.lock().requires.remove(name);
    }

    // halt / trace: asynchronous request flags checked at safe points

    pub fn halt(&self, description: &str) {
        *self.halt_description.lock() = Some(description.to_string());
        self.halt_flag.store(true, Release);
    }

    pub fn clear_halt(&self) -> bool {
        self.halt_description.lock().take();
        self.halt_flag.swap(false, AcqRel)
    }

    /// Safe-point check. Consumes a pending halt request.
    pub fn poll_halt(&self) -> Option<Condition> {
        if self.halt_flag.swap(false, AcqRel) {
            let description = self
                .halt_description
                .lock()
                .take()
                .unwrap_or_else(|| "halt".to_string());
            Some(Condition::new(ConditionCode::Halt, description))
        } else {
            None
        }
    }

    pub fn set_trace(&self, enabled: bool) {
        self.trace_flag.store(enabled, Release);
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace_flag.load(Acquire)
    }

    // guard protocol

    pub fn guard_post(&self) {
        self.parker.post();
    }

    pub fn guard_posts(&self) -> u64 {
        self.parker.post_count()
    }

    /// Park until another activity guard-posts. The caller must have
    /// released kernel access first.
    pub fn guard_wait_park(&self) {
        self.parker.wait();
    }

    pub fn set_waiting_on(&self, target: Option<ActivityId>) {
        *self.waiting_on.lock() = target;
    }

    pub fn waiting_on(&self) -> Option<ActivityId> {
        *self.waiting_on.lock()
    }

    // resource checks

    pub fn set_depth_limit(&self, limit: usize) {
        self.state.lock().depth_limit = limit;
    }

    /// Proactive recursion check: raised as a recoverable condition before
    /// the stack is actually exhausted.
    pub fn check_stack_space(&self) -> Result<(), Condition> {
        let state = self.state.lock();
        if state.stack.depth() >= state.depth_limit {
            warn!(
                "activity {}: activation stack limit {} reached",
                self.id.0, state.depth_limit
            );
            return Err(Condition::new(
                ConditionCode::StackOverflow,
                format!(
                    "activation depth limit of {} exceeded",
                    state.depth_limit
                ),
            ));
        }
        Ok(())
    }

    // random seed (activity-global, frame-scoped via the nested snapshot)

    pub fn random_next(&self) -> u64 {
        let mut state = self.state.lock();
        let mut seed = state.random_seed;
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        state.random_seed = seed;
        seed
    }

    pub fn random_seed(&self) -> u64 {
        self.state.lock().random_seed
    }

    // exit handler table (activity-scoped copy)

    pub fn exit_table(&self) -> ExitTable {
        self.state.lock().exits.clone()
    }

    pub fn set_exit_table(&self, exits: ExitTable) {
        self.state.lock().exits = exits;
    }

    // conditions

    /// Raise a condition against this activity's activation chain. Fills
    /// in the traceback, then walks frames newest-first looking for a
    /// trap; native frames always re-raise upward. A handling frame stays
    /// on the stack with everything above it unwound.
    pub fn raise(&self, mut condition: Condition) -> RaiseOutcome {
        let mut state = self.state.lock();
        if condition.traceback.is_empty() {
            condition.traceback = state.stack.traceback();
        }

        let depth = state.stack.depth();
        for index in (0..depth).rev() {
            let frame = state
                .stack
                .frame(index)
                .expect("frame index within depth");
            if frame.kind == FrameKind::Native {
                continue;
            }
            if frame.traps(condition.code) {
                debug!(
                    "activity {}: condition {:?} trapped at frame {}",
                    self.id.0, condition.code, index
                );
                state.stack.unwind_to(index + 1);
                return RaiseOutcome::Handled {
                    frame: index,
                    condition,
                };
            }
        }

        debug!(
            "activity {}: condition {:?} unhandled",
            self.id.0, condition.code
        );
        state.condition = Some(condition.clone());
        RaiseOutcome::Unhandled(condition)
    }

    /// Pending unhandled condition, for the native boundary's
    /// check-condition protocol.
    pub fn condition_info(&self) -> Option<Condition> {
        self.state.lock().condition.clone()
    }

    pub fn take_condition(&self) -> Option<Condition> {
        self.state.lock().condition.take()
    }

    pub fn set_condition(&self, condition: Condition) {
        self.state.lock().condition = Some(condition);
    }
}
